// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shared_state::SharedState;

/// Producer half of a single-shot typed result.
pub struct PromiseT<T> {
    pub(crate) state: Arc<SharedState<T>>,
}

/// Consumer half of a single-shot typed result, cheap to clone — every
/// clone observes the same eventual value.
pub struct FutureT<T> {
    pub(crate) state: Arc<SharedState<T>>,
}

impl<T> Clone for FutureT<T> {
    fn clone(&self) -> Self {
        FutureT {
            state: self.state.clone(),
        }
    }
}

/// Creates a fresh promise/future pair sharing one `SharedState<T>`.
pub fn channel<T: Clone>() -> (PromiseT<T>, FutureT<T>) {
    let state = Arc::new(SharedState::new());
    (
        PromiseT {
            state: state.clone(),
        },
        FutureT { state },
    )
}

impl<T: Clone> PromiseT<T> {
    /// Fulfills the future. Returns `false` if it was already fulfilled —
    /// "first set wins".
    pub fn set_value(&self, value: T) -> bool {
        self.state.set_value(value)
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state.is_ready()
    }
}

impl<T: Clone> FutureT<T> {
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Blocks indefinitely until a value has been set.
    pub fn wait(&self) -> T {
        self.state.wait()
    }

    /// Blocks until `deadline`, returning the value if it was set in time.
    pub fn wait_until(&self, deadline: Instant) -> Option<T> {
        self.state.wait_until(deadline)
    }

    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        self.wait_until(Instant::now() + timeout)
    }

    /// Copies the stored value into `dest` without consuming it. Returns
    /// `false` if the future is not yet ready.
    pub fn copy_to(&self, dest: &mut T) -> bool {
        match self.state.try_get() {
            Some(v) => {
                *dest = v;
                true
            }
            None => false,
        }
    }
}
