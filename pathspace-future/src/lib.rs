// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Single-shot typed futures/promises and a type-erased `FutureAny` view
//! onto an execution slot's eventual result.

mod any;
mod future;
mod shared_state;

pub use any::FutureAny;
pub use future::{channel, FutureT, PromiseT};
