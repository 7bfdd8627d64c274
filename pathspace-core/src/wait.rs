// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Per-path condition variables backing the blocking `out` protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::trace;
use parking_lot::{Condvar, Mutex};

struct Slot {
    condvar: Condvar,
}

/// A single mutex guarding a path→condvar map. `wait` registers (or reuses)
/// the condvar for a path; `notify`/`notify_all` wake waiters on it.
pub struct WaitMap {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl WaitMap {
    pub fn new() -> Self {
        WaitMap {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in `path`, returning a guard whose `wait_until`
    /// suspends the calling thread until notified or the deadline passes.
    pub fn wait(&self, path: &str) -> Guard<'_> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(path.to_string())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        condvar: Condvar::new(),
                    })
                })
                .clone()
        };
        trace!("wait registered on {}", path);
        Guard {
            registry: self,
            slot,
        }
    }

    /// Wakes one waiter registered on `path`, if any.
    pub fn notify(&self, path: &str) {
        let slots = self.slots.lock();
        if let Some(slot) = slots.get(path) {
            trace!("notify {}", path);
            slot.condvar.notify_one();
        }
    }

    /// Wakes every waiter on every path. Used on shutdown and when an alias
    /// retarget can't identify a single mount path to notify.
    pub fn notify_all(&self) {
        let slots = self.slots.lock();
        trace!("notify_all: {} paths", slots.len());
        for slot in slots.values() {
            slot.condvar.notify_all();
        }
    }

    /// Drops every registered condvar after waking its waiters. Safe to call
    /// while other threads hold a `Guard`: they simply find nothing
    /// registered the next time they call `wait`.
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values() {
            slot.condvar.notify_all();
        }
        slots.clear();
    }

    pub fn registered_paths(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for WaitMap {
    fn default() -> Self {
        WaitMap::new()
    }
}

/// Holds a path's condvar alive across one or more `wait_until` calls.
pub struct Guard<'a> {
    registry: &'a WaitMap,
    slot: Arc<Slot>,
}

impl<'a> Guard<'a> {
    /// Blocks until another thread calls `notify`/`notify_all` on this path
    /// or `deadline` passes. Returns `true` if the deadline was reached.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.registry.slots.lock();
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let timeout = deadline - now;
        let result = self.slot.condvar.wait_for(&mut guard, timeout);
        result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_wakes_a_waiter() {
        let _ = env_logger::try_init();
        let map = StdArc::new(WaitMap::new());
        let woken = StdArc::new(Mutex::new(false));

        let map2 = map.clone();
        let woken2 = woken.clone();
        let handle = thread::spawn(move || {
            let guard = map2.wait("/v");
            let timed_out = guard.wait_until(Instant::now() + Duration::from_millis(500));
            *woken2.lock() = !timed_out;
        });

        thread::sleep(Duration::from_millis(20));
        map.notify("/v");
        handle.join().unwrap();
        assert!(*woken.lock());
    }

    #[test]
    fn wait_times_out_without_notify() {
        let map = WaitMap::new();
        let guard = map.wait("/never");
        let timed_out = guard.wait_until(Instant::now() + Duration::from_millis(20));
        assert!(timed_out);
    }

    #[test]
    fn clear_is_safe_with_outstanding_guard() {
        let map = WaitMap::new();
        let _guard = map.wait("/v");
        map.clear();
        assert_eq!(map.registered_paths(), 0);
    }
}
