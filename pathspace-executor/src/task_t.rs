// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Weak};

use pathspace_core::{Error, ErrorCode, ExecutionCategory, NotificationSink, Result, Runnable};
use pathspace_future::{channel, FutureAny, FutureT};

use crate::task::Task;

/// A typed task: an untyped `Task` state machine paired with the
/// `FutureT<T>` that its callable fulfills on success. Submitting the
/// `Arc<Task>` to an `Executor` and reading `future()` are the two halves
/// callers need; `Task` never stores `T` itself.
pub struct TaskT<T: Clone + Send + Sync + 'static> {
    task: Arc<Task>,
    future: FutureT<T>,
}

impl<T: Clone + Send + Sync + 'static> TaskT<T> {
    pub fn new<F>(category: ExecutionCategory, f: F) -> Self
    where
        F: FnOnce() -> std::result::Result<T, String> + Send + 'static,
    {
        let (promise, future) = channel::<T>();
        let body = Box::new(move || match f() {
            Ok(value) => {
                promise.set_value(value);
                Ok(())
            }
            Err(message) => Err(message),
        });
        let task = Arc::new(Task::new(category, body));
        TaskT { task, future }
    }

    pub fn category(&self) -> ExecutionCategory {
        self.task.category()
    }

    /// The handle to submit to an `Executor`.
    pub fn as_runnable(&self) -> Weak<dyn Runnable> {
        Arc::downgrade(&self.task) as Weak<dyn Runnable>
    }

    /// A strong `Runnable` handle, for callers (the facade's `NodeData`
    /// queue slot) that need to keep the task alive themselves rather than
    /// rely on the executor's weak reference.
    pub fn runnable_arc(&self) -> Arc<dyn Runnable> {
        self.task.clone() as Arc<dyn Runnable>
    }

    pub fn future(&self) -> FutureT<T> {
        self.future.clone()
    }

    pub fn future_any(&self) -> FutureAny {
        FutureAny::new(self.future.clone())
    }

    pub fn set_notification(&self, sink: Weak<dyn NotificationSink>, path: String) {
        self.task.set_notification(sink, path);
    }

    /// Runs the task inline on the calling thread, bypassing the executor.
    /// Used for `ExecutionCategory::Lazy` tasks that a reader triggers
    /// directly rather than scheduling.
    pub fn run_inline(&self) -> Result<()> {
        if !self.task.try_start() {
            return Err(Error::new(
                ErrorCode::UnknownError,
                "task could not be started from its current state",
            ));
        }
        self.task.run();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;
    use pathspace_core::Executor;
    use std::time::{Duration, Instant};

    #[test]
    fn submitted_typed_task_fulfills_its_future() {
        let pool = TaskPool::new(1);
        let task = TaskT::new(ExecutionCategory::Immediate, || Ok(7i32));
        pool.submit(task.as_runnable()).unwrap();
        let value = task.future().wait_for(Duration::from_millis(500));
        assert_eq!(value, Some(7));
        pool.shutdown();
    }

    #[test]
    fn run_inline_fulfills_future_without_an_executor() {
        let task = TaskT::new(ExecutionCategory::Lazy, || Ok("lazy".to_string()));
        assert!(!task.future().is_ready());
        task.run_inline().unwrap();
        assert_eq!(
            task.future().wait_until(Instant::now() + Duration::from_millis(10)),
            Some("lazy".to_string())
        );
    }

    #[test]
    fn failing_body_never_fulfills_the_future() {
        let task: TaskT<i32> = TaskT::new(ExecutionCategory::Lazy, || Err("nope".to_string()));
        task.run_inline().unwrap();
        assert!(!task.future().is_ready());
    }
}
