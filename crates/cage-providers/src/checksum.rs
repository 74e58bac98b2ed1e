// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integrity verification for downloaded images (§4.2): whole-file MD5 for
//! Glance-style backends, multipart ETag for S3-style backends. Grounded on
//! `original_source/see/image_providers/helpers.py`'s `verify_checksum`/
//! `verify_etag`.

use cage_core::CoreResult;
use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Whole-file MD5 hex digest.
pub fn md5_hex(path: &Path) -> CoreResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 65536];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex(&hasher.finalize()))
}

/// S3-style multipart ETag: splits the file into fixed 8 MiB chunks, hashes
/// each, and if there's more than one chunk returns
/// `<md5-of-concatenated-digests>-<chunk-count>`; a single chunk uses the
/// plain whole-file MD5 form instead.
pub fn multipart_etag(path: &Path) -> CoreResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut digests = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = read_full(&mut file, &mut buf)?;
        if read == 0 {
            break;
        }
        let mut hasher = Md5::new();
        hasher.update(&buf[..read]);
        digests.extend_from_slice(&hasher.finalize());
        if read < CHUNK_SIZE {
            break;
        }
    }

    let chunk_count = digests.len() / 16;
    if chunk_count > 1 {
        let mut hasher = Md5::new();
        hasher.update(&digests);
        Ok(format!("{}-{chunk_count}", hex(&hasher.finalize())))
    } else {
        md5_hex(path)
    }
}

fn read_full(file: &mut std::fs::File, buf: &mut [u8]) -> CoreResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let read = file.read(&mut buf[total..])?;
        if read == 0 {
            break;
        }
        total += read;
    }
    Ok(total)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Checks `path` against `tag` using whichever scheme the tag's shape
/// implies: if it ends in `-<count>`, the multipart form; otherwise plain
/// MD5. Both backends ultimately compare against a remote-reported tag this
/// way.
pub fn verify(path: &Path, tag: &str) -> CoreResult<bool> {
    if tag.rsplit_once('-').map(|(_, count)| count.parse::<u32>().is_ok()).unwrap_or(false) {
        Ok(multipart_etag(path)? == tag)
    } else {
        Ok(md5_hex(path)? == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn md5_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(md5_hex(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn multipart_etag_uses_single_md5_form_for_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"small file").unwrap();
        assert_eq!(multipart_etag(&path).unwrap(), md5_hex(&path).unwrap());
    }

    #[test]
    fn multipart_etag_uses_count_suffixed_form_for_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut file = std::fs::File::create(&path).unwrap();
        let chunk = vec![0xABu8; CHUNK_SIZE];
        file.write_all(&chunk).unwrap();
        file.write_all(&chunk[..1024]).unwrap();
        let tag = multipart_etag(&path).unwrap();
        assert!(tag.ends_with("-2"));
        assert_ne!(tag, md5_hex(&path).unwrap());
    }

    #[test]
    fn verify_dispatches_on_tag_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert!(verify(&path, "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap());
        assert!(!verify(&path, "deadbeefdeadbeefdeadbeefdeadbeef").unwrap());
    }
}
