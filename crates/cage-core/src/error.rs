// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared by every crate in the framework.

use thiserror::Error;

/// Errors surfaced to embedders of the framework.
///
/// Handler failures and hook cleanup failures are deliberately absent here:
/// per the bus and hook manager contracts they are logged and never
/// propagate to a caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("environment not allocated")]
    NotAllocated,

    #[error("state transition {verb:?} not allowed from {from}")]
    InvalidTransition { from: String, verb: String },

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("domain shutdown timed out after {timeout_secs}s")]
    ShutdownTimeout { timeout_secs: u64 },

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("checksum mismatch for {path}")]
    ChecksumMismatch { path: String },

    #[error("no viable image available")]
    NoViableImage,

    #[error("exhausted {attempts} attempts generating a free subnet address")]
    AddressExhausted { attempts: u32 },

    #[error("handler not subscribed")]
    NotSubscribed,

    #[error("hook {name:?} could not be constructed: {reason}")]
    HookConstruction { name: String, reason: String },

    #[error("no class registered under name {0:?}")]
    NotRegistered(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
