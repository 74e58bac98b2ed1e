// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock abstraction, so shutdown-timeout polling (§4.4) is testable without
//! real sleeps.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A clock that provides the current time and can be slept against.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real system clock, backed by `tokio::time`.
#[derive(Clone, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fake clock for deterministic tests: `sleep` advances the clock
/// immediately instead of waiting in real time.
#[derive(Clone, Default)]
pub struct FakeClock {
    current: Arc<Mutex<Option<Instant>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { current: Arc::new(Mutex::new(None)) }
    }
}

#[async_trait::async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let mut guard = self.current.lock();
        *guard.get_or_insert_with(Instant::now)
    }

    async fn sleep(&self, duration: Duration) {
        let mut guard = self.current.lock();
        let base = *guard.get_or_insert_with(Instant::now);
        *guard = Some(base + duration);
    }
}
