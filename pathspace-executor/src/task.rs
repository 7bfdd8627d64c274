// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use pathspace_core::{ExecutionCategory, NotificationSink, Runnable};

/// A task's lifecycle. Advances only forward, by atomic compare-and-set:
/// `Created -> Started -> Running -> Completed | Failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Created,
    Started,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    fn encode(self) -> u8 {
        self as u8
    }

    fn decode(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Created,
            1 => TaskState::Started,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }
}

type Body = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// The untyped half of a scheduled unit of work: state machine, the
/// callable itself, and the one-shot completion notification. Typed result
/// storage lives in the `FutureT<T>`/`PromiseT<T>` that `TaskT<T>` builds
/// alongside it — `Task` only needs to know whether its body succeeded.
pub struct Task {
    state: AtomicU8,
    category: ExecutionCategory,
    body: Mutex<Option<Body>>,
    sink: Mutex<Option<Weak<dyn NotificationSink>>>,
    notify_path: Mutex<Option<String>>,
}

impl Task {
    pub fn new(category: ExecutionCategory, body: Body) -> Self {
        Task {
            state: AtomicU8::new(TaskState::Created.encode()),
            category,
            body: Mutex::new(Some(body)),
            sink: Mutex::new(None),
            notify_path: Mutex::new(None),
        }
    }

    pub fn category(&self) -> ExecutionCategory {
        self.category
    }

    pub fn state(&self) -> TaskState {
        TaskState::decode(self.state.load(Ordering::Acquire))
    }

    /// Installs the sink and path fired exactly once when this task
    /// completes or fails. A task with no sink installed simply completes
    /// silently.
    pub fn set_notification(&self, sink: Weak<dyn NotificationSink>, path: String) {
        *self.sink.lock() = Some(sink);
        *self.notify_path.lock() = Some(path);
    }
}

impl Runnable for Task {
    fn try_start(&self) -> bool {
        match self.state.compare_exchange(
            TaskState::Created.encode(),
            TaskState::Started.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            // Already past `Created`: resubmitting a started task is a no-op success.
            Err(current) => current >= TaskState::Started.encode(),
        }
    }

    fn run(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Started.encode(),
            TaskState::Running.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let body = self.body.lock().take();
        let outcome = match body {
            Some(f) => f(),
            None => Ok(()),
        };
        let final_state = match outcome {
            Ok(()) => TaskState::Completed,
            Err(_) => TaskState::Failed,
        };
        self.state.store(final_state.encode(), Ordering::Release);

        let sink = self.sink.lock().clone();
        let path = self.notify_path.lock().clone();
        if let (Some(sink), Some(path)) = (sink, path) {
            if let Some(sink) = sink.upgrade() {
                sink.notify(&path);
            }
        }
    }
}
