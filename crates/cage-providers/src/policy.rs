// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared image-resolution policy (§4.2) used by every concrete provider:
//! freshness comparison against a local file's mtime, target-path
//! derivation (file vs directory), atomic `.part`-suffixed download, and
//! first-existing-sibling fallback when a concurrent download is already in
//! flight. Grounded on the common shape of
//! `original_source/see/image_providers/os_glance.py` and `s3.py`, which
//! duplicate this logic almost verbatim in Python; here it is factored out
//! once and both `glance.rs`/`s3.rs` call into it.

use cage_core::{CoreError, CoreResult};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// True if `target` exists, is a file, and was modified after `remote_mtime`.
/// A stale or missing local file means the caller should (re)download.
pub fn is_fresh(target: &Path, remote_mtime: SystemTime) -> bool {
    let Ok(canonical) = std::fs::canonicalize(target) else {
        return false;
    };
    if !canonical.is_file() {
        return false;
    }
    let Ok(local_mtime) = std::fs::metadata(&canonical).and_then(|m| m.modified()) else {
        return false;
    };
    local_mtime > remote_mtime
}

/// Resolves the configured path against the remote image's stable id: if
/// `configured` names an existing directory the id becomes the filename,
/// otherwise `configured` is used verbatim as the target file path.
pub fn resolve_target_path(configured: &Path, id: &str) -> PathBuf {
    if configured.is_dir() {
        configured.join(id)
    } else {
        configured.to_path_buf()
    }
}

/// Downloads into a sibling `<target>.part` file via `download`, verifies it
/// with `verify`, and renames it into place on success. The part file is
/// removed on a verification failure so a future attempt starts clean.
pub async fn download_verify_rename<D, Fut>(target: &Path, download: D, verify: impl Fn(&Path) -> CoreResult<bool>) -> CoreResult<PathBuf>
where
    D: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = CoreResult<()>>,
{
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let part = part_path(target);
    download(part.clone()).await?;

    if !verify(&part)? {
        let _ = std::fs::remove_file(&part);
        return Err(CoreError::ChecksumMismatch { path: target.display().to_string() });
    }
    std::fs::rename(&part, target)?;
    Ok(target.to_path_buf())
}

/// Path of the in-flight download marker for `target`.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// First existing sibling file (within `target`'s parent directory) among
/// `candidate_ids`, in the order given. Callers pass ids ordered
/// newest-first so the result is the newest viable fallback image.
pub fn find_existing_sibling(target: &Path, candidate_ids: &[String]) -> Option<PathBuf> {
    let parent = target.parent()?;
    candidate_ids.iter().map(|id| parent.join(id)).find(|candidate| candidate != target && candidate.is_file())
}
