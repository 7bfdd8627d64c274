// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Backing store for one `PromiseT<T>`/`FutureT<T>` pair: a mutex-guarded
/// optional value, a condvar to wake waiters, and a "first set wins" write
/// policy.
pub(crate) struct SharedState<T> {
    value: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T: Clone> SharedState<T> {
    pub(crate) fn new() -> Self {
        SharedState {
            value: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// Sets the value if it has not already been set. Returns `false` if a
    /// value was already present.
    pub(crate) fn set_value(&self, value: T) -> bool {
        let mut guard = self.value.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        self.condvar.notify_all();
        true
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.value.lock().is_some()
    }

    pub(crate) fn try_get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Blocks until a value is set, then returns a clone of it.
    pub(crate) fn wait(&self) -> T {
        let mut guard = self.value.lock();
        while guard.is_none() {
            self.condvar.wait(&mut guard);
        }
        guard.clone().unwrap()
    }

    /// Blocks until a value is set or `deadline` passes.
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<T> {
        let mut guard = self.value.lock();
        loop {
            if let Some(v) = guard.as_ref() {
                return Some(v.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return guard.as_ref().cloned();
            }
            let timeout = deadline - now;
            self.condvar.wait_for(&mut guard, timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_wins() {
        let state = SharedState::new();
        assert!(state.set_value(1));
        assert!(!state.set_value(2));
        assert_eq!(state.try_get(), Some(1));
    }

    #[test]
    fn wait_until_times_out_when_unset() {
        let state: SharedState<i32> = SharedState::new();
        let result = state.wait_until(Instant::now() + std::time::Duration::from_millis(10));
        assert_eq!(result, None);
    }
}
