// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Hook Manager (§4.5, §6): merges shared and entry-specific
//! configuration, looks up and constructs hooks fail-soft, and sweeps
//! `cleanup()` fail-soft on teardown.
//!
//! Grounded on `original_source/see/hooks.py`'s `HookManager`.

use cage_core::{Hook, HookParameters, HookRegistry, Identifier, Observable};
use serde_json::Value;

/// The `{"configuration": ..., "hooks": [...]}` shape of §6.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HookManagerConfig {
    /// Shared configuration, merged *under* each entry's own.
    #[serde(default)]
    pub configuration: Value,
    #[serde(default)]
    pub hooks: Vec<HookEntryConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HookEntryConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub configuration: Value,
}

/// Merges `shared` under `entry`: `entry`'s keys win on collision. Both
/// must be JSON objects (or null, treated as empty) for the merge to apply;
/// a non-object `entry` is returned unchanged.
fn merge_configuration(shared: &Value, entry: &Value) -> Value {
    let Some(entry_map) = entry.as_object() else {
        return entry.clone();
    };
    let mut merged = shared.as_object().cloned().unwrap_or_default();
    for (key, value) in entry_map {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Holds the successfully constructed hooks for one Context, in
/// configuration order, and sweeps `cleanup()` fail-soft on teardown.
pub struct HookManager {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookManager {
    /// Builds every hook entry against `registry`, logging and skipping any
    /// entry whose name is missing, unregistered, or whose constructor
    /// fails (§4.5 steps 1–4).
    pub fn load(identifier: &Identifier, config: &HookManagerConfig, context: &Observable, registry: &HookRegistry) -> Self {
        let mut hooks = Vec::with_capacity(config.hooks.len());
        for entry in &config.hooks {
            let Some(name) = entry.name.as_deref() else {
                tracing::warn!("hook entry missing a `name` field; skipping");
                continue;
            };

            let factory = match registry.lookup(name) {
                Some(factory) => factory,
                None => {
                    tracing::warn!(hook = name, "no hook registered under this name; skipping");
                    continue;
                }
            };

            let merged = merge_configuration(&config.configuration, &entry.configuration);
            let params = HookParameters { identifier, configuration: &merged, context };
            match factory(params) {
                Ok(hook) => hooks.push(hook),
                Err(err) => tracing::warn!(hook = name, error = %err, "hook constructor failed; skipping"),
            }
        }
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Calls `cleanup()` on every hook, logging and continuing past any
    /// individual failure (§4.5 step 5).
    pub fn cleanup(&mut self) {
        for hook in &mut self.hooks {
            if let Err(err) = hook.cleanup() {
                tracing::warn!(error = %err, "hook cleanup failed");
            }
        }
    }
}
