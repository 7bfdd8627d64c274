// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A read-optimized snapshot cache layered on top of a backing space.
//!
//! Non-blocking, non-destructive, non-glob reads of a path not currently
//! marked dirty are served from an in-memory snapshot instead of the
//! backing space. Mutations mark the path (or, for a glob destination,
//! the whole tree) dirty so later reads fall back to the backing space
//! until a background worker rebuilds the snapshot, debounced after the
//! last mutation.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use pathspace_core::{is_glob, InsertOptions, InsertReturn, NotificationSink, ReadOptions, Result};
use pathspace_future::FutureAny;
use pathspace_tree::{Encode, NestedSpace};

use crate::base::{Children, PathSpaceBase, PathVisitor, VisitControl, VisitOptions};

#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    pub enabled: bool,
    pub rebuild_debounce: Duration,
    pub max_dirty_roots: usize,
    pub allow_synchronous_rebuild: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        SnapshotOptions {
            enabled: false,
            rebuild_debounce: Duration::from_millis(200),
            max_dirty_roots: 128,
            allow_synchronous_rebuild: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SnapshotMetrics {
    pub hits: u64,
    pub misses: u64,
    pub rebuilds: u64,
    pub rebuild_failures: u64,
    pub last_rebuild_ms: u64,
    pub bytes: u64,
}

struct SnapshotInner {
    enabled: bool,
    allow_synchronous_rebuild: bool,
    debounce: Duration,
    max_dirty_roots: usize,
    dirty: bool,
    rebuild_in_progress: bool,
    stop_worker: bool,
    last_mutation: Instant,
    mutation_counter: u64,
    dirty_roots: HashSet<String>,
    values: HashMap<String, Box<dyn Encode>>,
    bytes: u64,
    hits: u64,
    misses: u64,
    rebuilds: u64,
    rebuild_failures: u64,
    last_rebuild_ms: u64,
}

impl SnapshotInner {
    fn disabled() -> Self {
        SnapshotInner::from_options(&SnapshotOptions::default())
    }

    fn from_options(options: &SnapshotOptions) -> Self {
        let mut dirty_roots = HashSet::new();
        if options.enabled {
            dirty_roots.insert("/".to_string());
        }
        SnapshotInner {
            enabled: options.enabled,
            allow_synchronous_rebuild: options.allow_synchronous_rebuild,
            debounce: options.rebuild_debounce,
            max_dirty_roots: options.max_dirty_roots.max(1),
            dirty: options.enabled,
            rebuild_in_progress: false,
            stop_worker: false,
            last_mutation: Instant::now(),
            mutation_counter: 0,
            dirty_roots,
            values: HashMap::new(),
            bytes: 0,
            hits: 0,
            misses: 0,
            rebuilds: 0,
            rebuild_failures: 0,
            last_rebuild_ms: 0,
        }
    }

    /// Folds one mutated `path` into the dirty-root set, collapsing to the
    /// whole tree on a glob write or once the set would grow past
    /// `max_dirty_roots`, and dropping any existing root that `path`
    /// subsumes.
    fn mark_dirty(&mut self, path: &str) {
        self.dirty = true;
        self.last_mutation = Instant::now();
        self.mutation_counter += 1;

        if is_glob(path) {
            self.collapse_to_root();
            return;
        }
        if dirty_roots_contain_prefix(&self.dirty_roots, path) {
            return;
        }
        if self.dirty_roots.len() >= self.max_dirty_roots {
            self.collapse_to_root();
            return;
        }
        self.dirty_roots.retain(|existing| !is_path_prefix(path, existing));
        self.dirty_roots.insert(path.to_string());
    }

    fn collapse_to_root(&mut self) {
        self.dirty_roots.clear();
        self.dirty_roots.insert("/".to_string());
    }
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    if path.len() < prefix.len() || &path[..prefix.len()] != prefix {
        return false;
    }
    path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

fn dirty_roots_contain_prefix(roots: &HashSet<String>, path: &str) -> bool {
    if roots.is_empty() {
        return false;
    }
    if roots.contains("/") {
        return true;
    }
    if path.is_empty() {
        return false;
    }
    if !path.starts_with('/') {
        return roots.contains(path);
    }
    let mut pos = 1;
    while pos < path.len() {
        match path[pos..].find('/') {
            Some(offset) => {
                let next = pos + offset;
                if roots.contains(&path[..next]) {
                    return true;
                }
                pos = next + 1;
            }
            None => return roots.contains(path),
        }
    }
    roots.contains(path)
}

type SharedState = Arc<(Mutex<SnapshotInner>, Condvar)>;

pub struct SnapshotCachedPathSpace {
    backing: Arc<dyn PathSpaceBase>,
    state: SharedState,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SnapshotCachedPathSpace {
    pub fn new(backing: Arc<dyn PathSpaceBase>) -> Arc<SnapshotCachedPathSpace> {
        Arc::new(SnapshotCachedPathSpace {
            backing,
            state: Arc::new((Mutex::new(SnapshotInner::disabled()), Condvar::new())),
            worker: Mutex::new(None),
        })
    }

    /// Reconfigures the cache wholesale: a fresh, empty snapshot, reset
    /// counters, and the dirty set seeded to `{"/"}` if enabling (so the
    /// first read always falls through until the first rebuild). Starts or
    /// stops the background worker to match.
    pub fn set_snapshot_options(self: &Arc<Self>, options: SnapshotOptions) {
        {
            let (mutex, condvar) = &*self.state;
            let mut inner = mutex.lock();
            *inner = SnapshotInner::from_options(&options);
            condvar.notify_all();
        }
        if options.enabled {
            self.start_worker();
        } else {
            self.stop_worker();
        }
    }

    pub fn snapshot_enabled(&self) -> bool {
        self.state.0.lock().enabled
    }

    pub fn snapshot_metrics(&self) -> SnapshotMetrics {
        let inner = self.state.0.lock();
        SnapshotMetrics {
            hits: inner.hits,
            misses: inner.misses,
            rebuilds: inner.rebuilds,
            rebuild_failures: inner.rebuild_failures,
            last_rebuild_ms: inner.last_rebuild_ms,
            bytes: inner.bytes,
        }
    }

    /// Forces an immediate rebuild, waiting out any rebuild already under way.
    pub fn rebuild_snapshot_now(&self) {
        {
            let (mutex, condvar) = &*self.state;
            let mut inner = mutex.lock();
            if !inner.enabled {
                return;
            }
            while inner.rebuild_in_progress {
                condvar.wait(&mut inner);
                if !inner.enabled {
                    return;
                }
            }
            inner.rebuild_in_progress = true;
        }
        self.rebuild_snapshot();
    }

    fn start_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let owner = self.clone();
        match thread::Builder::new()
            .name("pathspace-snapshot-worker".to_string())
            .spawn(move || owner.worker_loop())
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => warn!("failed to spawn snapshot worker thread: {}", e),
        }
    }

    fn stop_worker(&self) {
        let handle = {
            let (mutex, condvar) = &*self.state;
            let mut inner = mutex.lock();
            inner.stop_worker = true;
            condvar.notify_all();
            drop(inner);
            self.worker.lock().take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let (mutex, condvar) = &*self.state;
        loop {
            let wake_at = {
                let mut inner = mutex.lock();
                loop {
                    if inner.stop_worker {
                        return;
                    }
                    if inner.enabled && inner.dirty {
                        break;
                    }
                    condvar.wait(&mut inner);
                }
                inner.last_mutation + inner.debounce
            };

            let remaining = wake_at.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                let mut inner = mutex.lock();
                if inner.stop_worker {
                    return;
                }
                condvar.wait_for(&mut inner, remaining);
            }

            {
                let mut inner = mutex.lock();
                while inner.rebuild_in_progress {
                    if inner.stop_worker {
                        return;
                    }
                    condvar.wait(&mut inner);
                }
                if inner.stop_worker {
                    return;
                }
                if !inner.enabled || !inner.dirty {
                    continue;
                }
                inner.rebuild_in_progress = true;
            }
            self.rebuild_snapshot();
        }
    }

    fn mark_dirty(&self, path: &str) {
        let (mutex, condvar) = &*self.state;
        let mut inner = mutex.lock();
        if !inner.enabled {
            return;
        }
        inner.mark_dirty(path);
        condvar.notify_all();
    }

    /// Walks the backing space, capturing every value leaf's front entry
    /// as a fresh snapshot. A mutation landing mid-walk is caught by
    /// comparing the mutation counter before and after: if it moved, the
    /// new snapshot is still published (better than nothing) but the
    /// dirty set is left alone instead of being cleared.
    fn rebuild_snapshot(&self) {
        let start = Instant::now();
        let start_mutation = self.state.0.lock().mutation_counter;

        let mut next_values: HashMap<String, Box<dyn Encode>> = HashMap::new();
        let mut next_bytes: u64 = 0;
        let options = VisitOptions {
            root: "/".to_string(),
            ..VisitOptions::default()
        };
        let visit_result = self.backing.visit(
            &mut |path| {
                if let Ok(boxed) = self.backing.out_raw(path, false, &ReadOptions::non_blocking(), None) {
                    if let Ok(value) = boxed.downcast::<Box<dyn Encode>>() {
                        next_bytes += value.encode().len() as u64;
                        next_values.insert(path.to_string(), value.clone_box());
                    }
                }
                VisitControl::Continue
            },
            &options,
        );

        let (mutex, condvar) = &*self.state;
        let mut inner = mutex.lock();
        let end_mutation = inner.mutation_counter;
        if !inner.enabled {
            inner.rebuild_in_progress = false;
            condvar.notify_all();
            return;
        }
        if visit_result.is_err() {
            inner.rebuild_failures += 1;
            inner.rebuild_in_progress = false;
            condvar.notify_all();
            return;
        }
        inner.values = next_values;
        inner.bytes = next_bytes;
        if end_mutation == start_mutation {
            inner.dirty_roots.clear();
            inner.dirty = false;
        } else {
            inner.dirty = true;
        }
        inner.last_rebuild_ms = start.elapsed().as_millis() as u64;
        inner.rebuilds += 1;
        inner.rebuild_in_progress = false;
        condvar.notify_all();
        debug!("snapshot rebuilt: {} entries, {} bytes", inner.values.len(), inner.bytes);
    }

    /// Tries to serve a non-blocking, non-destructive, non-glob read from
    /// the cache. Returns `None` on a miss or whenever the request shape
    /// disqualifies the snapshot outright, in which case the caller falls
    /// back to the backing space. A cached entry whose type doesn't match
    /// `expected_type` is treated as a miss rather than served or rejected
    /// here — the fallback to the backing space raises the authoritative
    /// `InvalidType`, so the cache never becomes a second source of truth
    /// for type checking.
    fn try_snapshot_read(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        if pop || options.do_block || is_glob(path) {
            return None;
        }

        let (mutex, _condvar) = &*self.state;
        let mut inner = mutex.lock();
        if !inner.enabled {
            return None;
        }

        if inner.allow_synchronous_rebuild
            && !inner.rebuild_in_progress
            && inner.dirty
            && inner.last_mutation.elapsed() >= inner.debounce
        {
            inner.rebuild_in_progress = true;
            drop(inner);
            self.rebuild_snapshot();
            inner = mutex.lock();
        }

        if !inner.enabled {
            return None;
        }
        if dirty_roots_contain_prefix(&inner.dirty_roots, path) {
            inner.misses += 1;
            return None;
        }
        match inner.values.get(path) {
            Some(value) => {
                if let Some(expected) = expected_type {
                    if value.as_any().type_id() != expected {
                        inner.misses += 1;
                        return None;
                    }
                }
                let boxed = value.clone_box();
                inner.hits += 1;
                Some(Box::new(boxed) as Box<dyn Any + Send + Sync>)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }
}

impl PathSpaceBase for SnapshotCachedPathSpace {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn {
        let ret = self.backing.insert_raw(path, payload, options);
        if ret.values_inserted > 0 || ret.spaces_inserted > 0 || ret.tasks_inserted > 0 {
            self.mark_dirty(path);
        }
        ret
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        if let Some(value) = self.try_snapshot_read(path, pop, options, expected_type) {
            return Ok(value);
        }
        let result = self.backing.out_raw(path, pop, options, expected_type);
        if result.is_ok() && pop {
            self.mark_dirty(path);
        }
        result
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        self.backing.future_at(path)
    }

    fn notify(&self, path: &str) {
        self.backing.notify(path);
    }

    fn shutdown(&self) {
        self.stop_worker();
        self.backing.shutdown();
    }

    fn visit(&self, visitor: &mut PathVisitor, options: &VisitOptions) -> Result<()> {
        self.backing.visit(visitor, options)
    }

    fn adopt_context_and_prefix(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        self.backing.adopt_context_and_prefix(mount_prefix, sink)
    }

    fn list_children(&self, path: &str) -> Result<Children> {
        self.backing.list_children(path)
    }
}

impl NestedSpace for SnapshotCachedPathSpace {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> Result<()> {
        match PathSpaceBase::insert_raw(self, path, payload, options).errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        PathSpaceBase::out_raw(self, path, pop, options, expected_type)
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        PathSpaceBase::future_at(self, path)
    }

    fn notify(&self, path: &str) {
        PathSpaceBase::notify(self, path)
    }

    fn shutdown(&self) {
        PathSpaceBase::shutdown(self)
    }

    fn adopt(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        self.backing.adopt_context_and_prefix(mount_prefix, sink)
    }
}

impl Drop for SnapshotCachedPathSpace {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::PathSpace;
    use pathspace_tree::Encode;
    use std::thread;
    use std::time::Duration;

    fn insert_value<T: Encode + Clone + 'static>(space: &Arc<dyn PathSpaceBase>, path: &str, value: T) {
        let payload: Box<dyn Any + Send + Sync> = Box::new(Box::new(value) as Box<dyn Encode>);
        space.insert_raw(path, payload, &InsertOptions::default());
    }

    fn read_value(cache: &SnapshotCachedPathSpace, path: &str) -> Option<i32> {
        let boxed = cache
            .out_raw(path, false, &ReadOptions::non_blocking(), Some(TypeId::of::<i32>()))
            .ok()?;
        boxed.downcast::<Box<dyn Encode>>().ok()?.as_any().downcast_ref::<i32>().cloned()
    }

    #[test]
    fn disabled_cache_passes_every_read_straight_through() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        insert_value(&backing, "/x", 9i32);
        let cache = SnapshotCachedPathSpace::new(backing);
        assert_eq!(read_value(&cache, "/x"), Some(9));
        assert_eq!(cache.snapshot_metrics().hits, 0);
    }

    #[test]
    fn a_rebuilt_snapshot_serves_reads_as_cache_hits() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        insert_value(&backing, "/x", 9i32);
        let cache = SnapshotCachedPathSpace::new(backing);
        cache.set_snapshot_options(SnapshotOptions {
            enabled: true,
            rebuild_debounce: Duration::from_millis(1),
            ..SnapshotOptions::default()
        });
        cache.rebuild_snapshot_now();

        assert_eq!(read_value(&cache, "/x"), Some(9));
        assert_eq!(cache.snapshot_metrics().hits, 1);
    }

    #[test]
    fn a_write_after_enabling_marks_the_path_dirty_until_rebuilt() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        let cache = SnapshotCachedPathSpace::new(backing.clone());
        cache.set_snapshot_options(SnapshotOptions {
            enabled: true,
            rebuild_debounce: Duration::from_millis(1),
            ..SnapshotOptions::default()
        });
        cache.rebuild_snapshot_now();

        insert_value(&cache.backing.clone(), "/y", 1i32);
        cache.mark_dirty("/y");
        assert!(read_value(&cache, "/y").is_none());

        cache.rebuild_snapshot_now();
        assert_eq!(read_value(&cache, "/y"), Some(1));
    }

    #[test]
    fn background_worker_rebuilds_after_the_debounce_elapses() {
        let _ = env_logger::try_init();
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        insert_value(&backing, "/x", 3i32);
        let cache = SnapshotCachedPathSpace::new(backing);
        cache.set_snapshot_options(SnapshotOptions {
            enabled: true,
            rebuild_debounce: Duration::from_millis(5),
            ..SnapshotOptions::default()
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.snapshot_metrics().rebuilds == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(cache.snapshot_metrics().rebuilds >= 1);
        assert_eq!(read_value(&cache, "/x"), Some(3));
        cache.shutdown();
    }

    #[test]
    fn a_cached_entry_of_the_wrong_type_falls_back_to_the_backing_space() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        insert_value(&backing, "/x", 9i32);
        let cache = SnapshotCachedPathSpace::new(backing);
        cache.set_snapshot_options(SnapshotOptions {
            enabled: true,
            rebuild_debounce: Duration::from_millis(1),
            ..SnapshotOptions::default()
        });
        cache.rebuild_snapshot_now();

        let err = cache
            .out_raw(
                "/x",
                false,
                &ReadOptions::non_blocking(),
                Some(TypeId::of::<String>()),
            )
            .unwrap_err();
        assert_eq!(err.code, pathspace_core::ErrorCode::InvalidType);
        // the mismatch fell through as a miss, not a false hit, before the
        // backing space raised the authoritative error
        assert!(cache.snapshot_metrics().misses >= 1);
    }
}
