// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Generic by-name factory registry backing dynamic hook and image-provider
//! lookup (§4.5, §9's "module-level registration hook").
//!
//! The original looks classes up by fully qualified name via reflection and
//! checks `issubclass` at call time. Rust has no runtime reflection, so the
//! equivalent is a process-wide table a module populates at startup by
//! calling `register`, keyed by whatever name the embedder chooses to expose
//! to configuration. Because the table is generic over the factory type
//! rather than `Any`, only values of the right shape can ever be registered —
//! the `issubclass` check becomes a compile-time property instead of a
//! runtime one.

use crate::error::CoreError;

/// A table mapping names to factories of type `F`.
pub struct Registry<F> {
    factories: parking_lot::RwLock<std::collections::HashMap<String, F>>,
}

impl<F: Clone> Registry<F> {
    pub fn new() -> Self {
        Self { factories: parking_lot::RwLock::new(std::collections::HashMap::new()) }
    }

    pub fn register(&self, name: impl Into<String>, factory: F) {
        self.factories.write().insert(name.into(), factory);
    }

    pub fn lookup(&self, name: &str) -> Option<F> {
        self.factories.read().get(name).cloned()
    }

    pub fn lookup_or_err(&self, name: &str) -> Result<F, CoreError> {
        self.lookup(name).ok_or_else(|| CoreError::NotRegistered(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

impl<F: Clone> Default for Registry<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_then_lookup_round_trips() {
        let registry: Registry<Arc<dyn Fn() -> i32 + Send + Sync>> = Registry::new();
        registry.register("answer", Arc::new(|| 42));
        let factory = registry.lookup("answer").unwrap();
        assert_eq!(factory(), 42);
    }

    #[test]
    fn missing_name_is_not_registered_error() {
        let registry: Registry<Arc<dyn Fn() -> i32 + Send + Sync>> = Registry::new();
        match registry.lookup_or_err("missing") {
            Err(CoreError::NotRegistered(name)) => assert_eq!(name, "missing"),
            _ => panic!("expected NotRegistered error"),
        }
    }
}
