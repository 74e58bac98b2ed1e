// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event data model (§3).
//!
//! Unlike a closed Rust enum, `Event` is open-ended: the bus subscribes and
//! dispatches by event *name*, so new event kinds can be introduced by hooks
//! without touching this crate.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar payload value. The data model restricts payload fields to
/// "a simple scalar or string" — no nested structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::String(s) => write!(f, "{s}"),
            PayloadValue::Int(i) => write!(f, "{i}"),
            PayloadValue::Float(v) => write!(f, "{v}"),
            PayloadValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        PayloadValue::String(s.to_string())
    }
}
impl From<String> for PayloadValue {
    fn from(s: String) -> Self {
        PayloadValue::String(s)
    }
}
impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        PayloadValue::Int(v)
    }
}
impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        PayloadValue::Float(v)
    }
}
impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        PayloadValue::Bool(v)
    }
}

/// An immutable event record: a name (the subscription key), a source tag
/// identifying the emitter's component, and an open payload.
///
/// Equality and hashing for delivery purposes is by `name` alone (§3), which
/// `name()` exposes; `Event` itself derives full structural equality for
/// tests that want to assert on payload contents too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    source: String,
    payload: IndexMap<String, PayloadValue>,
}

impl Event {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self { name: name.into(), source: source.into(), payload: IndexMap::new() }
    }

    pub fn with_payload(
        name: impl Into<String>,
        source: impl Into<String>,
        payload: IndexMap<String, PayloadValue>,
    ) -> Self {
        Self { name: name.into(), source: source.into(), payload }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &IndexMap<String, PayloadValue> {
        &self.payload
    }
}
