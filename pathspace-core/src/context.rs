// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The shared bundle threaded through a tree of nested spaces: the wait
//! registry, a notification sink, an executor handle, and shutdown state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::wait::WaitMap;

/// Anything that wants to hear about a write at a path. Tasks hold only a
/// weak reference to their sink so a completed task never keeps a space
/// alive; `PathSpaceBase` lazily seeds a default sink that forwards to its
/// own `notify`.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, path: &str);
}

/// A unit of work an `Executor` can run: the atomic `Created -> Started`
/// transition plus the callable itself. `pathspace-executor::Task`
/// implements this; `pathspace-core` only needs the shape, not the
/// concrete type, so the two crates don't depend on each other.
pub trait Runnable: Send + Sync {
    /// Attempts to move the task from `Created` to `Started`. Returns `true`
    /// if this call performed the transition, or if the task was already
    /// past `Created` (idempotent resubmission).
    fn try_start(&self) -> bool;

    /// Runs the task's callable to completion, recording its result.
    fn run(&self);
}

/// Accepts and runs `Runnable`s, typically backed by a fixed thread pool.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Weak<dyn Runnable>) -> Result<()>;
    fn shutdown(&self);
    fn size(&self) -> usize;
}

#[derive(Default)]
struct Shared {
    sink: Option<Weak<dyn NotificationSink>>,
    executor: Option<Arc<dyn Executor>>,
}

/// Per-tree context: every nested subspace that is adopted by a parent has
/// its context replaced with the parent's (see Invariant I-3), so a single
/// `PathSpaceContext` is shared across however many layers and nested
/// spaces sit under one root.
pub struct PathSpaceContext {
    pub wait_map: WaitMap,
    shared: Mutex<Shared>,
    shutting_down: AtomicBool,
}

impl PathSpaceContext {
    pub fn new() -> Arc<Self> {
        Arc::new(PathSpaceContext {
            wait_map: WaitMap::new(),
            shared: Mutex::new(Shared::default()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn set_sink(&self, sink: Weak<dyn NotificationSink>) {
        self.shared.lock().sink = Some(sink);
    }

    pub fn sink(&self) -> Option<Weak<dyn NotificationSink>> {
        self.shared.lock().sink.clone()
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        self.shared.lock().executor = Some(executor);
    }

    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.shared.lock().executor.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Wakes any reader blocked on `path`. Does not, by itself, forward to a
    /// notification sink — that is the facade's job, since only the facade
    /// knows whether it is a nested space that must re-prefix onto its
    /// parent's namespace.
    pub fn notify(&self, path: &str) {
        self.wait_map.notify(path);
    }

    pub fn notify_all(&self) {
        self.wait_map.notify_all();
    }

    /// Marks the context as shutting down, wakes every waiter, and shuts
    /// down the executor if one is installed. Idempotent.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wait_map.notify_all();
        if let Some(executor) = self.executor() {
            executor.shutdown();
        }
    }
}

impl Default for PathSpaceContext {
    fn default() -> Self {
        PathSpaceContext {
            wait_map: WaitMap::new(),
            shared: Mutex::new(Shared::default()),
            shutting_down: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(AtomicUsize);

    impl NotificationSink for CountingSink {
        fn notify(&self, _path: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sink_is_stored_weakly() {
        let ctx = PathSpaceContext::new();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        ctx.set_sink(Arc::downgrade(&sink) as Weak<dyn NotificationSink>);
        assert!(ctx.sink().unwrap().upgrade().is_some());
        drop(sink);
        assert!(ctx.sink().unwrap().upgrade().is_none());
    }

    #[test]
    fn shutdown_sets_flag_and_wakes_waiters() {
        let ctx = PathSpaceContext::new();
        assert!(!ctx.is_shutting_down());
        ctx.shutdown();
        assert!(ctx.is_shutting_down());
    }
}
