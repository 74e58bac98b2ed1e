// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Observable event bus (§4.1, §5, §9).
//!
//! Dispatch is split in two: synchronous handlers run inline on the
//! caller's thread in registration order; asynchronous handlers are handed
//! to independent `tokio` tasks and never block `trigger`. Both lists are
//! guarded by a re-entrant lock so a handler may itself call `subscribe`,
//! `unsubscribe` or `trigger` — on this bus or another — without deadlock.
//! A plain `Mutex` cannot be used here (see the module-level note in §9):
//! `parking_lot::ReentrantMutex` is the primitive this design requires.

use crate::error::CoreError;
use crate::event::Event;
use indexmap::IndexMap;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Error a handler may return. Never surfaced past the delivery site.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type SyncHandler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
pub type AsyncHandler = Arc<dyn Fn(Event) -> BoxFuture + Send + Sync>;

#[derive(Clone)]
struct Subscriber<H> {
    handler: H,
    /// Label used for log attribution — analogous to the original's
    /// `module.Class` handler-logger naming.
    component: &'static str,
}

#[derive(Default)]
struct Handlers {
    sync_handlers: IndexMap<String, Vec<Subscriber<SyncHandler>>>,
    async_handlers: IndexMap<String, Vec<Subscriber<AsyncHandler>>>,
}

/// Base class for observers and observables (§4.1's `Observatory`).
///
/// Embed one of these in any type that needs to emit or receive events
/// (`Context` does, via composition rather than inheritance).
pub struct Observable {
    /// Name of the emitting component class, used as `Event::source` for
    /// events triggered with a bare name.
    source: String,
    handlers: ReentrantMutex<RefCell<Handlers>>,
    async_tasks: parking_lot::Mutex<JoinSet<()>>,
}

impl Observable {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            handlers: ReentrantMutex::new(RefCell::new(Handlers::default())),
            async_tasks: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    /// Registers a synchronous handler for `event`.
    pub fn subscribe(
        &self,
        event: impl Into<String>,
        component: &'static str,
        handler: SyncHandler,
    ) {
        let guard = self.handlers.lock();
        guard
            .borrow_mut()
            .sync_handlers
            .entry(event.into())
            .or_default()
            .push(Subscriber { handler, component });
    }

    /// Registers an asynchronous handler for `event`.
    pub fn subscribe_async(
        &self,
        event: impl Into<String>,
        component: &'static str,
        handler: AsyncHandler,
    ) {
        let guard = self.handlers.lock();
        guard
            .borrow_mut()
            .async_handlers
            .entry(event.into())
            .or_default()
            .push(Subscriber { handler, component });
    }

    /// Removes the first matching synchronous registration. Fails
    /// `not-subscribed` if `handler` isn't registered for `event`.
    ///
    /// Unlike the original's single untyped `unsubscribe`, this does not
    /// fall back to the asynchronous list: `SyncHandler` and `AsyncHandler`
    /// are distinct Rust trait-object types (`Fn(&Event) -> ...` vs.
    /// `Fn(Event) -> BoxFuture`), so a value of one type can never have been
    /// registered under the other list in the first place — there is no
    /// ambiguity here for a fallback to resolve, unlike the original's
    /// duck-typed handler reference, which could be either.
    pub fn unsubscribe_sync(&self, event: &str, handler: &SyncHandler) -> Result<(), CoreError> {
        let guard = self.handlers.lock();
        let mut handlers = guard.borrow_mut();
        if let Some(list) = handlers.sync_handlers.get_mut(event) {
            if let Some(pos) = list.iter().position(|s| Arc::ptr_eq(&s.handler, handler)) {
                list.remove(pos);
                return Ok(());
            }
        }
        Err(CoreError::NotSubscribed)
    }

    /// Removes the first matching asynchronous registration. Fails
    /// `not-subscribed` if `handler` isn't registered for `event`. See
    /// [`Observable::unsubscribe_sync`] for why this does not fall back to
    /// the synchronous list.
    pub fn unsubscribe_async(&self, event: &str, handler: &AsyncHandler) -> Result<(), CoreError> {
        let guard = self.handlers.lock();
        let mut handlers = guard.borrow_mut();
        if let Some(list) = handlers.async_handlers.get_mut(event) {
            if let Some(pos) = list.iter().position(|s| Arc::ptr_eq(&s.handler, handler)) {
                list.remove(pos);
                return Ok(());
            }
        }
        Err(CoreError::NotSubscribed)
    }

    /// Triggers `event`, fanning out to every handler currently subscribed.
    ///
    /// Synchronous handlers run inline, in registration order, and the
    /// trigger lock is held until every one of them has returned, matching
    /// `original_source/see/observer.py`'s `trigger` holding its
    /// `trigger_mutex` for the whole dispatch rather than just the
    /// snapshot — this is what serializes `trigger` against other `trigger`
    /// calls on the same Observable. Asynchronous handlers are spawned on
    /// independent tasks after the lock is released and may still be
    /// running when this call returns.
    pub fn trigger(&self, event: Event) {
        let async_snapshot = {
            let guard = self.handlers.lock();
            let sync_snapshot = {
                let handlers = guard.borrow();
                handlers.sync_handlers.get(event.name()).cloned().unwrap_or_default()
            };

            for sub in &sync_snapshot {
                if let Err(err) = (sub.handler)(&event) {
                    tracing::warn!(component = sub.component, error = %err, "event handler failed");
                }
            }

            let handlers = guard.borrow();
            handlers.async_handlers.get(event.name()).cloned().unwrap_or_default()
            // `guard` (the trigger lock) is dropped here, after every
            // synchronous handler has returned.
        };

        for sub in &async_snapshot {
            let handler = sub.handler.clone();
            let component = sub.component;
            let event = event.clone();
            let mut tasks = self.async_tasks.lock();
            tasks.spawn(async move {
                if let Err(err) = handler(event).await {
                    tracing::warn!(component, error = %err, "async event handler failed");
                }
            });
        }
    }

    /// Convenience: builds an `Event` from a bare name, `source` defaulting
    /// to this Observable's component tag, and triggers it.
    pub fn trigger_named(&self, name: impl Into<String>) {
        self.trigger(Event::new(name, self.source.clone()));
    }

    /// Awaits all outstanding asynchronous handler tasks, up to `timeout`.
    /// Used by `Environment::deallocate` when draining is enabled (§5, §9).
    /// Handlers still outstanding when the timeout elapses are left to run
    /// to completion in the background; their count is logged.
    pub async fn drain(&self, timeout: std::time::Duration) {
        let mut tasks = {
            let mut guard = self.async_tasks.lock();
            std::mem::take(&mut *guard)
        };
        let drained_in_time = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained_in_time {
            let outstanding = tasks.len();
            tracing::warn!(
                outstanding,
                "async handlers still running after drain timeout; letting them finish in background"
            );
            // Let the stragglers run to completion on the runtime instead of
            // aborting them (dropping a JoinSet aborts its remaining tasks).
            tokio::spawn(async move { while tasks.join_next().await.is_some() {} });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn sync_handler(f: impl Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static) -> SyncHandler {
        Arc::new(f)
    }

    #[test]
    fn subscribe_then_trigger_invokes_handler_in_order() {
        let bus = Observable::new("Test");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        bus.subscribe("e", "h1", sync_handler(move |_| {
            o1.lock().push(1);
            Ok(())
        }));
        bus.subscribe("e", "h2", sync_handler(move |_| {
            o2.lock().push(2);
            Ok(())
        }));
        bus.trigger_named("e");
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn handler_failure_is_isolated() {
        let bus = Observable::new("Test");
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        bus.subscribe("E", "bad", sync_handler(|_| Err(HandlerError::new("boom"))));
        bus.subscribe("E", "good", sync_handler(move |_| {
            flag2.store(true, Ordering::SeqCst);
            Ok(())
        }));
        bus.trigger_named("E");
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn unsubscribe_never_subscribed_fails_not_subscribed() {
        let bus = Observable::new("Test");
        let handler: SyncHandler = sync_handler(|_| Ok(()));
        let err = bus.unsubscribe_sync("e", &handler).unwrap_err();
        assert!(matches!(err, CoreError::NotSubscribed));
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_no_trace() {
        let bus = Observable::new("Test");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handler: SyncHandler = sync_handler(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe("e", "h", handler.clone());
        bus.unsubscribe_sync("e", &handler).unwrap();
        bus.trigger_named("e");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_does_not_fall_back_across_sync_and_async_lists() {
        let bus = Observable::new("Test");
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let sync_handler_unused: SyncHandler = sync_handler(|_| Ok(()));
        bus.subscribe_async(
            "e",
            "h",
            Arc::new(move |_event: Event| {
                let flag = flag2.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }) as BoxFuture
            }),
        );

        // A sync handler that was never subscribed does not fall back to
        // removing the asynchronous registration above: the two lists hold
        // distinct Rust types and can never alias.
        let err = bus.unsubscribe_sync("e", &sync_handler_unused).unwrap_err();
        assert!(matches!(err, CoreError::NotSubscribed));

        bus.trigger_named("e");
        bus.drain(std::time::Duration::from_secs(1)).await;
        assert!(flag.load(Ordering::SeqCst), "async registration must survive the failed sync unsubscribe");
    }

    #[test]
    fn reentrant_trigger_from_within_a_handler_does_not_deadlock() {
        let bus = Arc::new(Observable::new("Test"));
        let inner_ran = Arc::new(AtomicBool::new(false));
        let inner_ran2 = inner_ran.clone();
        let bus_for_handler = bus.clone();
        bus.subscribe(
            "outer",
            "h1",
            sync_handler(move |_| {
                bus_for_handler.trigger_named("inner");
                Ok(())
            }),
        );
        bus.subscribe(
            "inner",
            "h2",
            sync_handler(move |_| {
                inner_ran2.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.trigger_named("outer");
        assert!(inner_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn async_handler_runs_without_blocking_trigger() {
        let bus = Observable::new("Test");
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        bus.subscribe_async(
            "E",
            "h",
            Arc::new(move |_event: Event| {
                let flag = flag2.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }) as BoxFuture
            }),
        );
        bus.trigger_named("E");
        bus.drain(std::time::Duration::from_secs(1)).await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn async_cascade_triggers_sync_handler_eventually() {
        let bus = Arc::new(Observable::new("Test"));
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        bus.subscribe(
            "E2",
            "h2",
            sync_handler(move |_| {
                flag2.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        let bus_for_async = bus.clone();
        bus.subscribe_async(
            "E1",
            "h1",
            Arc::new(move |_event: Event| {
                let bus = bus_for_async.clone();
                Box::pin(async move {
                    bus.trigger_named("E2");
                    Ok(())
                }) as BoxFuture
            }),
        );
        bus.trigger_named("E1");
        bus.drain(std::time::Duration::from_secs(1)).await;
        assert!(flag.load(Ordering::SeqCst));
    }
}
