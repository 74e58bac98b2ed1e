// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal XML element tree and the domain/network/pool/volume XML builders
//! (§4.3's "Domain XML rewriting rules", shared by the QEMU/LXC/VBox driver
//! specializations). Grounded on `original_source/see/context/resources/qemu.py`
//! and `network.py`, which use Python's `xml.etree.ElementTree` plus a
//! `subelement(element, xpath, tag, text, **attrs)` helper that finds-or-creates
//! a descendant and overwrites its tag/text/attributes. `quick-xml` has no
//! DOM API of its own, so this module builds one: [`Element`] is a small tree
//! parsed and re-serialized with `quick_xml::{Reader, Writer}`.

use cage_core::{CoreError, CoreResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), attrs: Vec::new(), text: None, children: Vec::new() }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.attrs.iter_mut().find(|(k, _)| *k == name) {
            entry.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    /// First descendant (depth-first, including self's direct children, not
    /// `self`) whose tag matches and which satisfies `predicate`.
    pub fn find_descendant(&self, tag: &str, predicate: impl Fn(&Element) -> bool + Copy) -> Option<&Element> {
        for child in &self.children {
            if child.tag == tag && predicate(child) {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(tag, predicate) {
                return Some(found);
            }
        }
        None
    }

    fn find_descendant_mut(&mut self, tag: &str, predicate: impl Fn(&Element) -> bool + Copy) -> Option<&mut Element> {
        if let Some(index) = self.children.iter().position(|child| child.tag == tag && predicate(child)) {
            return Some(&mut self.children[index]);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_descendant_mut(tag, predicate) {
                return Some(found);
            }
        }
        None
    }

    /// Finds the first descendant matching `tag`/`predicate` and overwrites
    /// its tag, text and attributes; if none exists, appends a new direct
    /// child instead — the Rust equivalent of `helpers.subelement`.
    #[allow(clippy::expect_used)]
    pub fn subelement(
        &mut self,
        tag: &str,
        predicate: impl Fn(&Element) -> bool + Copy,
        text: Option<&str>,
        attrs: &[(&str, &str)],
    ) -> &mut Element {
        let exists = self.find_descendant(tag, predicate).is_some();
        if !exists {
            self.children.push(Element::new(tag));
        }
        let target = if exists {
            self.find_descendant_mut(tag, predicate).expect("checked above")
        } else {
            self.children.last_mut().expect("just pushed")
        };
        target.tag = tag.to_string();
        target.text = text.map(str::to_string);
        for (key, value) in attrs {
            target.set_attr(*key, *value);
        }
        target
    }

    #[allow(clippy::expect_used)]
    pub fn push_child(&mut self, child: Element) -> &mut Element {
        self.children.push(child);
        self.children.last_mut().expect("just pushed")
    }
}

#[allow(clippy::expect_used)]
pub fn parse(xml: &str) -> CoreResult<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<Element> = vec![Element::new("#root")];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| CoreError::Configuration(e.to_string()))? {
            Event::Start(start) => stack.push(element_from_start(&start)?),
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                stack.last_mut().expect("root always present").children.push(element);
            }
            Event::Text(text) => {
                let decoded = text.unescape().map_err(|e| CoreError::Configuration(e.to_string()))?.into_owned();
                if !decoded.trim().is_empty() {
                    if let Some(top) = stack.last_mut() {
                        top.text = Some(decoded);
                    }
                }
            }
            Event::End(_) => {
                let finished = stack.pop().ok_or_else(|| CoreError::Configuration("unbalanced XML".into()))?;
                stack.last_mut().expect("root always present").children.push(finished);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let mut root = stack.pop().ok_or_else(|| CoreError::Configuration("empty XML document".into()))?;
    root.children.pop().ok_or_else(|| CoreError::Configuration("XML document has no root element".into()))
}

fn element_from_start(start: &BytesStart) -> CoreResult<Element> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(tag);
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| CoreError::Configuration(e.to_string()))?.into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}

pub fn serialize(element: &Element) -> CoreResult<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_element(&mut writer, element)?;
    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| CoreError::Configuration(e.to_string()))
}

fn write_element(writer: &mut Writer<Cursor<Vec<u8>>>, element: &Element) -> CoreResult<()> {
    let mut start = BytesStart::new(&element.tag);
    for (key, value) in &element.attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_none() {
        writer.write_event(Event::Empty(start)).map_err(|e| CoreError::Configuration(e.to_string()))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(|e| CoreError::Configuration(e.to_string()))?;
    if let Some(text) = &element.text {
        writer.write_event(Event::Text(BytesText::new(text))).map_err(|e| CoreError::Configuration(e.to_string()))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(&element.tag))).map_err(|e| CoreError::Configuration(e.to_string()))?;
    Ok(())
}

/// Fills the domain XML's required fields: name, uuid, devices, disk source,
/// and optionally a network interface (§4.3).
#[allow(clippy::expect_used)]
pub fn domain_xml(identifier: &str, xml: &str, disk_path: &std::path::Path, network_name: Option<&str>) -> CoreResult<String> {
    let mut domain = parse(xml)?;
    domain.subelement("name", |_| true, Some(identifier), &[]);
    domain.subelement("uuid", |_| true, Some(identifier), &[]);

    let devices_exists = domain.children.iter().any(|c| c.tag == "devices");
    if !devices_exists {
        domain.push_child(Element::new("devices"));
    }
    let devices = domain.children.iter_mut().find(|c| c.tag == "devices").expect("ensured above");

    let disk = devices.subelement("disk", |_| true, None, &[("type", "file"), ("device", "disk")]);
    disk.subelement("source", |_| true, None, &[("file", &disk_path.display().to_string())]);

    if let Some(network_name) = network_name {
        let interface = devices.subelement(
            "interface",
            |e| e.attr("type") == Some("network"),
            None,
            &[("type", "network")],
        );
        interface.subelement("source", |_| true, None, &[("network", network_name)]);
    }

    serialize(&domain)
}

/// Fills the network XML's required fields: name, uuid, bridge, and
/// optionally a dynamically generated static address with DHCP range
/// (§4.3's dynamic network address allocation).
pub fn network_xml(identifier: &str, xml: &str, address: Option<ipnet::Ipv4Net>) -> CoreResult<String> {
    let mut network = parse(xml)?;
    let short = &identifier[..identifier.len().min(8)];

    network.subelement("name", |_| true, Some(identifier), &[]);
    network.subelement("uuid", |_| true, Some(identifier), &[]);
    network.subelement("bridge", |_| true, None, &[("name", &format!("virbr-{short}"))]);

    if let Some(address) = address {
        if network.find_descendant("ip", |_| true).is_some() {
            return Err(CoreError::Configuration("address already specified in XML configuration".into()));
        }
        set_address(&mut network, address);
    }

    serialize(&network)
}

fn set_address(network: &mut Element, address: ipnet::Ipv4Net) {
    let netmask = address.netmask().to_string();
    let hosts: Vec<_> = address.hosts().collect();
    let ipv4 = hosts.first().copied().unwrap_or_else(|| address.addr()).to_string();
    let dhcp_start = hosts.get(1).copied().unwrap_or_else(|| address.addr()).to_string();
    let dhcp_end = hosts.last().copied().unwrap_or_else(|| address.broadcast()).to_string();

    let ip = network.push_child(Element::new("ip"));
    ip.set_attr("address", ipv4);
    ip.set_attr("netmask", netmask);
    let dhcp = ip.push_child(Element::new("dhcp"));
    let range = dhcp.push_child(Element::new("range"));
    range.set_attr("start", dhcp_start);
    range.set_attr("end", dhcp_end);
}

/// Injects one `<filesystem type="mount">` device per mount point, for the
/// LXC driver's bind-mount descriptors (§4.3).
#[allow(clippy::expect_used)]
pub fn add_filesystem_mounts(xml: &str, mounts: &[(std::path::PathBuf, std::path::PathBuf)]) -> CoreResult<String> {
    let mut domain = parse(xml)?;
    let devices_exists = domain.children.iter().any(|c| c.tag == "devices");
    if !devices_exists {
        domain.push_child(Element::new("devices"));
    }
    let devices = domain.children.iter_mut().find(|c| c.tag == "devices").expect("ensured above");
    for (source, target) in mounts {
        let filesystem = devices.push_child(Element::new("filesystem"));
        filesystem.set_attr("type", "mount");
        let source_element = filesystem.push_child(Element::new("source"));
        source_element.set_attr("dir", source.display().to_string());
        let target_element = filesystem.push_child(Element::new("target"));
        target_element.set_attr("dir", target.display().to_string());
    }
    serialize(&domain)
}

pub const BASE_POOL_XML_TEMPLATE: &str = "<pool type='dir'><name>{name}</name><target><path>{path}</path></target></pool>";

pub fn pool_xml(name: &str, path: &std::path::Path, uuid: Option<&str>) -> String {
    let uuid_element = uuid.map(|u| format!("<uuid>{u}</uuid>")).unwrap_or_default();
    format!(
        "<pool type='dir'><name>{name}</name>{uuid_element}<target><path>{}</path></target></pool>",
        path.display()
    )
}

pub fn volume_xml(identifier: &str, target_path: &std::path::Path, backing_store: Option<&std::path::Path>) -> String {
    let backing = backing_store
        .map(|p| format!("<backingStore><path>{}</path><format type='qcow2'/></backingStore>", p.display()))
        .unwrap_or_default();
    format!(
        "<volume type='file'><name>{identifier}</name><uuid>{identifier}</uuid><target><path>{}</path><permissions><mode>0644</mode></permissions><format type='qcow2'/></target>{backing}</volume>",
        target_path.display()
    )
}

/// Extracts the `<interface type="network"><source network="..."/>` value
/// from a defined domain's XML, if present — used to locate the network a
/// domain is already attached to (§4.4's network lookup-by-domain).
pub fn extract_interface_network(xml: &str) -> Option<String> {
    let domain = parse(xml).ok()?;
    let devices = domain.find_descendant("devices", |_| true)?;
    let interface = devices.find_descendant("interface", |e| e.attr("type") == Some("network"))?;
    let source = interface.find_descendant("source", |_| true)?;
    source.attr("network").map(str::to_string)
}

pub fn extract_name(xml: &str) -> Option<String> {
    let root = parse(xml).ok()?;
    root.find_descendant("name", |_| true).and_then(|e| e.text.clone())
}

pub fn extract_ip_subnet(xml: &str) -> Option<ipnet::Ipv4Net> {
    let network = parse(xml).ok()?;
    let ip = network.find_descendant("ip", |_| true)?;
    let address: std::net::Ipv4Addr = ip.attr("address")?.parse().ok()?;
    let netmask: std::net::Ipv4Addr = ip.attr("netmask")?.parse().ok()?;
    ipnet::Ipv4Net::with_netmask(address, netmask).ok()
}
