// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hook base contract (§4.5, §6) and the by-name construction registry.

use crate::bus::Observable;
use crate::error::CoreError;
use crate::id::Identifier;
use crate::registry::Registry;
use serde_json::Value;
use std::sync::Arc;

/// The parameters record every hook constructor receives (§3's
/// "Handler parameters record").
pub struct HookParameters<'a> {
    pub identifier: &'a Identifier,
    pub configuration: &'a Value,
    pub context: &'a Observable,
}

/// An instrumentation module that subscribes handlers to events on a
/// Context. `cleanup` is optional in the source (raises `NotImplementedError`
/// when absent); in Rust that maps to a default no-op so hooks need not
/// override it.
pub trait Hook: Send + Sync {
    fn cleanup(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Factory function stored in the registry: builds a boxed hook from its
/// parameters, fallibly (constructor errors are fail-soft per §4.5 step 3).
pub type HookFactory = Arc<dyn Fn(HookParameters<'_>) -> Result<Box<dyn Hook>, CoreError> + Send + Sync>;

/// Process-wide registry mapping a hook's fully qualified name to its
/// factory — the Rust realization of §9's "dynamic class lookup... through
/// an interface and a module-level registration hook". Validation that a
/// registered factory produces a `Hook` is structural: the registry is
/// generic over `HookFactory`, so only `Hook`-implementors can ever be
/// registered, which is strictly stronger than the source's runtime
/// `issubclass` check.
pub type HookRegistry = Registry<HookFactory>;

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHook;
    impl Hook for NoopHook {}

    #[test]
    fn register_then_lookup_round_trips() {
        let registry = HookRegistry::new();
        registry.register("pkg.NoopHook", Arc::new(|_params| Ok(Box::new(NoopHook) as Box<dyn Hook>)));
        assert!(registry.lookup("pkg.NoopHook").is_some());
        assert!(registry.lookup("pkg.MissingHook").is_none());
    }
}
