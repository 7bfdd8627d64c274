// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The task state machine, a fixed-size executor thread pool, and the
//! typed-task wrapper that pairs a `Task` with its `FutureT<T>`.

mod pool;
mod task;
mod task_t;

pub use pool::TaskPool;
pub use task::{Task, TaskState};
pub use task_t::TaskT;
