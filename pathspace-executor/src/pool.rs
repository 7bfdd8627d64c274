// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use pathspace_core::{Error, ErrorCode, Executor, Result, Runnable};

type Queue = (Mutex<VecDeque<Weak<dyn Runnable>>>, Condvar);

/// A fixed-size pool of OS threads draining a shared queue of weak task
/// references. A task that expires (its `Arc` dropped) before a worker
/// reaches it is simply skipped.
pub struct TaskPool {
    queue: Arc<Queue>,
    shutting_down: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    capacity: usize,
}

impl TaskPool {
    /// Spawns up to `num_workers` threads. A thread that fails to spawn
    /// only shrinks the pool's effective capacity — it is never a hard
    /// error, per the no-fatal-errors error-handling policy.
    pub fn new(num_workers: usize) -> Arc<Self> {
        let queue: Arc<Queue> = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(num_workers);
        for idx in 0..num_workers {
            let queue = queue.clone();
            let shutting_down = shutting_down.clone();
            match thread::Builder::new()
                .name(format!("pathspace-worker-{}", idx))
                .spawn(move || worker_loop(queue, shutting_down))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("failed to spawn worker thread {}: {}", idx, e),
            }
        }
        let capacity = workers.len();
        debug!("TaskPool started with {} of {} requested workers", capacity, num_workers);
        Arc::new(TaskPool {
            queue,
            shutting_down,
            workers: Mutex::new(workers),
            capacity,
        })
    }
}

fn worker_loop(queue: Arc<Queue>, shutting_down: Arc<AtomicBool>) {
    let (mutex, condvar) = &*queue;
    loop {
        let next = {
            let mut q = mutex.lock();
            loop {
                if let Some(task) = q.pop_front() {
                    break Some(task);
                }
                if shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                condvar.wait(&mut q);
            }
        };
        match next {
            Some(weak) => {
                if let Some(task) = weak.upgrade() {
                    trace!("worker running task");
                    task.run();
                } else {
                    trace!("worker skipped an expired task");
                }
            }
            None => break,
        }
    }
}

impl Executor for TaskPool {
    fn submit(&self, task: Weak<dyn Runnable>) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::new(ErrorCode::UnknownError, "executor is shutting down"));
        }
        let started = match task.upgrade() {
            Some(t) => t.try_start(),
            None => {
                return Err(Error::new(
                    ErrorCode::UnknownError,
                    "task expired before submission",
                ))
            }
        };
        if !started {
            return Err(Error::new(
                ErrorCode::UnknownError,
                "task could not be started from its current state",
            ));
        }
        let (mutex, condvar) = &*self.queue;
        mutex.lock().push_back(task);
        condvar.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let (mutex, condvar) = &*self.queue;
        mutex.lock().clear();
        condvar.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn size(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathspace_core::ExecutionCategory;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    use crate::task::Task;

    #[test]
    fn submitted_task_runs_and_completes() {
        let _ = env_logger::try_init();
        let pool = TaskPool::new(2);
        let result = Arc::new(AtomicI32::new(0));
        let result2 = result.clone();
        let task: Arc<Task> = Arc::new(Task::new(
            ExecutionCategory::Immediate,
            Box::new(move || {
                result2.store(42, Ordering::SeqCst);
                Ok(())
            }),
        ));
        pool.submit(Arc::downgrade(&task) as Weak<dyn Runnable>).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while task.state() != crate::task::TaskState::Completed && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(result.load(Ordering::SeqCst), 42);
        pool.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let pool = TaskPool::new(1);
        pool.shutdown();
        let task: Arc<Task> = Arc::new(Task::new(ExecutionCategory::Immediate, Box::new(|| Ok(()))));
        let err = pool
            .submit(Arc::downgrade(&task) as Weak<dyn Runnable>)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownError);
    }

    #[test]
    fn expired_task_is_skipped_without_panicking() {
        let pool = TaskPool::new(1);
        let weak = {
            let task: Arc<Task> = Arc::new(Task::new(ExecutionCategory::Immediate, Box::new(|| Ok(()))));
            let weak = Arc::downgrade(&task);
            // Task is dropped here before the worker can upgrade the weak ref.
            weak
        };
        // upgrade fails immediately, so submit itself refuses.
        assert!(pool.submit(weak).is_err());
        pool.shutdown();
    }
}
