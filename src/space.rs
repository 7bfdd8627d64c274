// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The concrete `PathSpace`: a tree plus a shared context, wired up to the
//! blocking `out` protocol and the `PathSpaceBase`/`NestedSpace` contracts
//! so a `PathSpace` can be mounted as a nested subspace inside another one.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use pathspace_core::{
    validate_path, DataCategory, Error, ExecutionCategory, Executor, InsertOptions, InsertReturn,
    NotificationSink, PathSpaceContext, ReadOptions, Result, Runnable,
};
use pathspace_executor::TaskT;
use pathspace_future::FutureAny;
use pathspace_tree::{Encode, Extracted, NestedSpace, Payload, Tree};

use crate::base::{Children, CopyStats, PathSpaceBase, PathVisitor, VisitControl, VisitOptions};

/// Default wait ceiling when a caller requests blocking without a timeout.
const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(3600);
const BACKOFF_CAP: Duration = Duration::from_millis(8);
const YIELD_EVERY: u32 = 8;

/// A hierarchical, concurrent, path-addressed value/task space. Wraps a
/// `pathspace_tree::Tree` with the shared wait/notify/executor context and
/// the adoption bookkeeping (`mount_prefix`) a parent installs when this
/// space is inserted as a nested subspace somewhere else.
pub struct PathSpace {
    tree: Tree,
    ctx: Arc<PathSpaceContext>,
    mount_prefix: Mutex<String>,
    self_weak: Weak<PathSpace>,
}

impl PathSpace {
    pub fn new() -> Arc<PathSpace> {
        PathSpace::from_parts(Tree::new())
    }

    /// A new, empty space whose `Immediate` tasks are scheduled on `executor`.
    pub fn with_executor(executor: Arc<dyn Executor>) -> Arc<PathSpace> {
        let space = PathSpace::new();
        space.ctx.set_executor(executor);
        space
    }

    fn from_parts(tree: Tree) -> Arc<PathSpace> {
        Arc::new_cyclic(|weak| {
            let ctx = PathSpaceContext::new();
            ctx.set_sink(weak.clone() as Weak<dyn NotificationSink>);
            PathSpace {
                tree,
                ctx,
                mount_prefix: Mutex::new(String::new()),
                self_weak: weak.clone(),
            }
        })
    }

    /// Inserts a plain value at `path`.
    pub fn insert<T: Encode + Clone + 'static>(&self, path: &str, value: T, options: InsertOptions) -> InsertReturn {
        if let Err(e) = validate_path(path, options.validation_level) {
            let mut ret = InsertReturn::new();
            ret.errors.push(e);
            return ret;
        }
        let payload = Payload::Value(TypeId::of::<T>(), DataCategory::Fundamental, Box::new(value));
        let ret = self.tree.insert(path, payload, &options);
        if ret.errors.is_empty() {
            self.notify(path);
        }
        ret
    }

    /// Inserts a callable as an execution task. `Immediate` is submitted to
    /// the context's executor (if one is installed) right away; `Lazy`
    /// runs inline on whichever thread first reads its future or value.
    pub fn insert_task<T, F>(&self, path: &str, options: InsertOptions, f: F) -> InsertReturn
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> std::result::Result<T, String> + Send + 'static,
    {
        if let Err(e) = validate_path(path, options.validation_level) {
            let mut ret = InsertReturn::new();
            ret.errors.push(e);
            return ret;
        }
        let task = TaskT::new(options.execution_category, f);
        let runnable = task.runnable_arc();
        let future = task.future_any();
        task.set_notification(self.self_weak.clone() as Weak<dyn NotificationSink>, path.to_string());
        if options.execution_category == ExecutionCategory::Immediate {
            if let Some(executor) = self.ctx.executor() {
                let _ = executor.submit(Arc::downgrade(&runnable));
            }
        }
        let ret = self.tree.insert(path, Payload::Task(runnable, future), &options);
        if ret.errors.is_empty() {
            self.notify(path);
        }
        ret
    }

    /// Mounts `space` as a nested subspace at `path`, adopting it: its
    /// notifications are re-prefixed onto this space's namespace from then
    /// on (Invariant I-3).
    pub fn insert_nested(&self, path: &str, space: Arc<dyn NestedSpace>, options: InsertOptions) -> InsertReturn {
        if let Err(e) = validate_path(path, options.validation_level) {
            let mut ret = InsertReturn::new();
            ret.errors.push(e);
            return ret;
        }
        let mut ret = self.tree.insert(path, Payload::Nested(space.clone()), &options);
        if ret.errors.is_empty() {
            let sink: Weak<dyn NotificationSink> = self.self_weak.clone();
            if let Err(e) = space.adopt(path.to_string(), sink) {
                ret.errors.push(e);
                return ret;
            }
            self.notify(path);
        }
        ret
    }

    /// Non-destructive typed read. Blocks per `options` if the value isn't
    /// present yet.
    pub fn read<T: Clone + 'static>(&self, path: &str, options: ReadOptions) -> Result<T> {
        self.out_blocking(path, false, options)
    }

    /// Destructive typed read.
    pub fn take<T: Clone + 'static>(&self, path: &str, options: ReadOptions) -> Result<T> {
        self.out_blocking(path, true, options)
    }

    /// A type-erased handle onto the execution slot at `path`. Triggers a
    /// `Lazy` task's first run inline if it hasn't started yet.
    pub fn read_future(&self, path: &str) -> Result<FutureAny> {
        match self.tree.out(path, false, None)? {
            Extracted::TaskFuture(task, future) | Extracted::TaskPopped(task, future) => {
                if task.try_start() {
                    task.run();
                }
                Ok(future)
            }
            Extracted::Forwarded(any) => any
                .downcast::<FutureAny>()
                .map(|boxed| *boxed)
                .map_err(|_| Error::invalid_type("forwarded entry is not an execution slot")),
            Extracted::Value(..) => Err(Error::invalid_type("no execution slot at this path")),
        }
    }

    /// Names of the immediate children of the node at `path`.
    pub fn list_children(&self, path: &str) -> Result<Children> {
        self.tree.list_children(path).map(|names| Children { names })
    }

    /// Deep copy of values and nested structure; execution payloads are
    /// dropped. Named `deep_clone` rather than `clone` so it never shadows
    /// `Arc::clone` on the handle callers actually hold.
    pub fn deep_clone(&self) -> (Arc<PathSpace>, CopyStats) {
        let (tree_copy, (values_copied, spaces_copied, tasks_dropped)) = self.tree.deep_copy();
        let copy = PathSpace::from_parts(tree_copy);
        (
            copy,
            CopyStats {
                values_copied,
                spaces_copied,
                tasks_dropped,
            },
        )
    }

    /// Wakes any reader blocked on `path`, then — if this space was
    /// adopted under a parent — forwards the same wake-up, re-prefixed,
    /// to the parent's sink.
    pub fn notify(&self, path: &str) {
        self.ctx.notify(path);
        let prefix = self.mount_prefix.lock().clone();
        if prefix.is_empty() {
            return;
        }
        if let Some(sink) = self.ctx.sink().and_then(|weak| weak.upgrade()) {
            let full = format!("{}{}", prefix, path);
            sink.notify(&full);
        }
    }

    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }

    /// Clears the wait registry, releasing any blocked readers with a
    /// timeout. Does not erase stored data: `Tree` has no erase path by
    /// design (an emptied node's queue is simply left empty, never
    /// removed from its parent's children map), so a literal "drop
    /// everything" `clear()` is not implemented here.
    pub fn clear(&self) {
        self.ctx.wait_map.clear();
    }

    /// Reads (or pops) the front entry at `path` as a `T`. The type check
    /// and the peek/pop happen in the same `Tree::out` call, under the same
    /// node-data lock — a pop can never destroy an entry (a wrong-typed
    /// value, or a pending task) that doesn't match the requested type.
    fn try_out<T: Clone + 'static>(&self, path: &str, pop: bool) -> Result<T> {
        extract::<T>(self.tree.out(path, pop, Some(TypeId::of::<T>()))?)
    }

    /// The blocking `out` protocol: one immediate attempt, then (if
    /// blocking was requested) a deadline-clamped retry loop backed by the
    /// wait registry with exponentially-capped backoff.
    fn out_blocking<T: Clone + 'static>(&self, path: &str, pop: bool, options: ReadOptions) -> Result<T> {
        match self.try_out::<T>(path, pop) {
            Ok(value) => {
                self.notify(path);
                return Ok(value);
            }
            Err(e) => {
                if !options.do_block {
                    return Err(e);
                }
            }
        }

        let deadline = Instant::now() + clamp_timeout(options.timeout);

        // Second attempt closes the race between the first attempt and
        // wait-registration below.
        if let Ok(value) = self.try_out::<T>(path, pop) {
            self.notify(path);
            return Ok(value);
        }

        let mut slice = Duration::from_millis(1);
        let mut iterations: u32 = 0;
        loop {
            if self.ctx.is_shutting_down() {
                return Err(Error::timeout(format!("shutting down while waiting for {:?}", path)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout(format!("no value at {:?} before the deadline", path)));
            }
            match self.try_out::<T>(path, pop) {
                Ok(value) => {
                    self.notify(path);
                    return Ok(value);
                }
                Err(_) => {}
            }

            let guard = self.ctx.wait_map.wait(path);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let this_slice = slice.min(remaining);
            guard.wait_until(Instant::now() + this_slice);
            drop(guard);

            slice = (slice * 2).min(BACKOFF_CAP);
            iterations += 1;
            if iterations % YIELD_EVERY == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Tries each of the three payload shapes `forward_nested_insert` may
    /// have boxed (a plain value, a nested subspace, or a task handle) in
    /// turn, inserts into this space's own tree under whichever one
    /// matches, and notifies on success.
    fn insert_raw_core(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn {
        let ret = if let Ok(boxed) = payload.downcast::<Box<dyn Encode>>() {
            let value: Box<dyn Encode> = *boxed;
            let type_id = value.as_any().type_id();
            self.tree.insert(path, Payload::Value(type_id, DataCategory::Fundamental, value), options)
        } else {
            match payload.downcast::<Arc<dyn NestedSpace>>() {
                Ok(space) => self.tree.insert(path, Payload::Nested(*space), options),
                Err(payload) => match payload.downcast::<(Arc<dyn Runnable>, FutureAny)>() {
                    Ok(pair) => {
                        let (task, future) = *pair;
                        self.tree.insert(path, Payload::Task(task, future), options)
                    }
                    Err(_) => {
                        let mut ret = InsertReturn::new();
                        ret.errors.push(Error::invalid_type("unrecognized forwarded payload shape"));
                        ret
                    }
                },
            }
        };
        if ret.errors.is_empty() {
            self.notify(path);
        }
        ret
    }

    fn insert_raw_impl(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> Result<()> {
        let ret = self.insert_raw_core(path, payload, options);
        match ret.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn out_raw_impl(
        &self,
        path: &str,
        pop: bool,
        _options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        match self.tree.out(path, pop, expected_type)? {
            Extracted::Value(_, value) => Ok(Box::new(value) as Box<dyn Any + Send + Sync>),
            Extracted::Forwarded(any) => Ok(any),
            Extracted::TaskFuture(task, future) | Extracted::TaskPopped(task, future) => {
                if task.try_start() {
                    task.run();
                }
                Ok(Box::new(future) as Box<dyn Any + Send + Sync>)
            }
        }
    }

    fn adopt_impl(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        *self.mount_prefix.lock() = mount_prefix;
        self.ctx.set_sink(sink);
        Ok(())
    }
}

fn extract<T: Clone + 'static>(extracted: Extracted) -> Result<T> {
    match extracted {
        Extracted::Value(type_id, value) => {
            if type_id != TypeId::of::<T>() {
                return Err(Error::invalid_type("front entry does not hold the requested type"));
            }
            value
                .as_any()
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(|| Error::invalid_type("type id matched but downcast failed"))
        }
        Extracted::Forwarded(any) => any
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::invalid_type("forwarded value is not the requested type")),
        Extracted::TaskFuture(..) | Extracted::TaskPopped(..) => {
            Err(Error::invalid_type("execution slot: use read_future instead"))
        }
    }
}

fn finish_forwarded_insert(space: &PathSpace, path: &str, ret: InsertReturn) -> Result<()> {
    if ret.errors.is_empty() {
        space.notify(path);
        Ok(())
    } else {
        Err(ret.errors.into_iter().next().expect("errors is non-empty"))
    }
}

fn clamp_timeout(requested: Option<Duration>) -> Duration {
    let mut timeout = requested.unwrap_or(DEFAULT_BLOCKING_TIMEOUT);
    if let Ok(raw) = std::env::var("PATHSPACE_TEST_TIMEOUT_MS") {
        if let Ok(ms) = raw.trim().parse::<u64>() {
            timeout = timeout.min(Duration::from_millis(ms));
        }
    } else if let Ok(raw) = std::env::var("PATHSPACE_TEST_TIMEOUT") {
        if let Ok(secs) = raw.trim().parse::<u64>() {
            timeout = timeout.min(Duration::from_secs(secs));
        }
    }
    timeout
}

impl NotificationSink for PathSpace {
    fn notify(&self, path: &str) {
        PathSpace::notify(self, path)
    }
}

impl NestedSpace for PathSpace {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> Result<()> {
        self.insert_raw_impl(path, payload, options)
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        self.out_raw_impl(path, pop, options, expected_type)
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        self.read_future(path)
    }

    fn notify(&self, path: &str) {
        PathSpace::notify(self, path)
    }

    fn shutdown(&self) {
        PathSpace::shutdown(self)
    }

    fn adopt(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        self.adopt_impl(mount_prefix, sink)
    }
}

impl PathSpaceBase for PathSpace {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn {
        self.insert_raw_core(path, payload, options)
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        self.out_raw_impl(path, pop, options, expected_type)
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        self.read_future(path)
    }

    fn notify(&self, path: &str) {
        PathSpace::notify(self, path)
    }

    fn shutdown(&self) {
        PathSpace::shutdown(self)
    }

    fn visit(&self, visitor: &mut PathVisitor, options: &VisitOptions) -> Result<()> {
        self.tree.visit(
            &options.root,
            options.max_depth,
            options.max_children,
            options.include_nested_spaces,
            options.include_values,
            &mut |path| matches!(visitor(path), VisitControl::Continue),
        )
    }

    fn adopt_context_and_prefix(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        self.adopt_impl(mount_prefix, sink)
    }

    fn list_children(&self, path: &str) -> Result<Children> {
        PathSpace::list_children(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathspace_core::ExecutionCategory;
    use std::time::Duration;

    fn immediate() -> InsertOptions {
        InsertOptions {
            execution_category: ExecutionCategory::Immediate,
            ..InsertOptions::default()
        }
    }

    #[test]
    fn insert_then_read_round_trips_a_value() {
        let space = PathSpace::new();
        let ret = space.insert("/a/b", 42i32, immediate());
        assert_eq!(ret.values_inserted, 1);
        let value: i32 = space.read("/a/b", ReadOptions::non_blocking()).unwrap();
        assert_eq!(value, 42);
        // read is non-destructive
        let value: i32 = space.read("/a/b", ReadOptions::non_blocking()).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn take_removes_the_value() {
        let space = PathSpace::new();
        space.insert("/x", "hi".to_string(), immediate());
        let value: String = space.take("/x", ReadOptions::non_blocking()).unwrap();
        assert_eq!(value, "hi");
        assert!(space.read::<String>("/x", ReadOptions::non_blocking()).is_err());
    }

    #[test]
    fn blocking_read_wakes_on_a_concurrent_insert() {
        let space = PathSpace::new();
        let space2 = space.clone();
        let handle = thread::spawn(move || space2.read::<i32>("/v", ReadOptions::blocking(Duration::from_millis(500))));
        thread::sleep(Duration::from_millis(20));
        space.insert("/v", 7i32, immediate());
        let value = handle.join().unwrap().unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn non_blocking_read_times_out_immediately_without_block() {
        let space = PathSpace::new();
        let err = space.read::<i32>("/missing", ReadOptions::non_blocking()).unwrap_err();
        assert_eq!(err.code, pathspace_core::ErrorCode::NoSuchPath);
    }

    #[test]
    fn blocking_read_honors_the_deadline() {
        let space = PathSpace::new();
        let err = space
            .read::<i32>("/never", ReadOptions::blocking(Duration::from_millis(30)))
            .unwrap_err();
        assert_eq!(err.code, pathspace_core::ErrorCode::Timeout);
    }

    #[test]
    fn lazy_task_runs_inline_on_first_future_read() {
        let space = PathSpace::new();
        space.insert_task::<i32, _>("/task", InsertOptions::default(), || Ok(99));
        let future = space.read_future("/task").unwrap();
        let value = future.downcast::<i32>().unwrap();
        assert_eq!(value.wait_for(Duration::from_millis(200)), Some(99));
    }

    #[test]
    fn deep_clone_drops_tasks_and_keeps_values() {
        let space = PathSpace::new();
        space.insert("/a", 1i32, immediate());
        space.insert_task::<i32, _>("/b", InsertOptions::default(), || Ok(2));
        let (copy, stats) = space.deep_clone();
        assert_eq!(stats.values_copied, 1);
        assert_eq!(stats.tasks_dropped, 1);
        let value: i32 = copy.read("/a", ReadOptions::non_blocking()).unwrap();
        assert_eq!(value, 1);
        assert!(copy.read::<i32>("/b", ReadOptions::non_blocking()).is_err());
    }

    #[test]
    fn visit_reports_every_path_in_depth_first_order() {
        let space = PathSpace::new();
        space.insert("/a/b", 1i32, immediate());
        space.insert("/a/c", 2i32, immediate());
        let mut seen = Vec::new();
        let options = VisitOptions::default();
        PathSpaceBase::visit(
            &*space,
            &mut |path| {
                seen.push(path.to_string());
                VisitControl::Continue
            },
            &options,
        )
        .unwrap();
        assert!(seen.contains(&"/a/b".to_string()));
        assert!(seen.contains(&"/a/c".to_string()));
    }

    #[test]
    fn list_children_is_sorted() {
        let space = PathSpace::new();
        space.insert("/a/z", 1i32, immediate());
        space.insert("/a/m", 2i32, immediate());
        let children = space.list_children("/a").unwrap();
        assert_eq!(children.names, vec!["m".to_string(), "z".to_string()]);
    }

    #[test]
    fn typed_glob_read_skips_a_wrong_typed_sibling() {
        let space = PathSpace::new();
        space.insert("/g/a", 7i32, immediate());
        space.insert("/g/b", "hi".to_string(), immediate());
        let value: String = space.read("/g/*", ReadOptions::non_blocking()).unwrap();
        assert_eq!(value, "hi");
    }

    #[test]
    fn typed_take_never_destroys_a_wrong_typed_entry() {
        let space = PathSpace::new();
        space.insert("/h", 7i32, immediate());
        assert!(space.take::<String>("/h", ReadOptions::non_blocking()).is_err());
        let value: i32 = space.take("/h", ReadOptions::non_blocking()).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn pack_insert_spans_clones_one_value_across_every_destination() {
        let space = PathSpace::new();
        let payload: Box<dyn Any + Send + Sync> = Box::new(Box::new(5i32) as Box<dyn Encode>);
        let paths = vec!["/p/a".to_string(), "/p/b".to_string(), "/p/c".to_string()];
        let ret = space.pack_insert_spans(&paths, payload, &immediate());
        assert!(ret.errors.is_empty());
        assert_eq!(ret.values_inserted, 3);
        for path in &paths {
            let value: i32 = space.read(path, ReadOptions::non_blocking()).unwrap();
            assert_eq!(value, 5);
        }
    }

    #[test]
    fn pack_insert_spans_refuses_a_payload_that_is_not_a_plain_value() {
        let space = PathSpace::new();
        let payload: Box<dyn Any + Send + Sync> = Box::new(42u64);
        let paths = vec!["/q/a".to_string()];
        let ret = space.pack_insert_spans(&paths, payload, &immediate());
        assert_eq!(ret.errors.len(), 1);
        assert_eq!(ret.errors[0].code, pathspace_core::ErrorCode::NotSupported);
        assert!(space.read::<i32>("/q/a", ReadOptions::non_blocking()).is_err());
    }

    #[test]
    fn jittered_blocking_takers_each_receive_exactly_one_value() {
        use rand::Rng;

        const TAKERS: i32 = 12;

        let space = PathSpace::new();
        let mut takers = Vec::new();
        for _ in 0..TAKERS {
            let space = space.clone();
            takers.push(thread::spawn(move || {
                space.take::<i32>("/jitter", ReadOptions::blocking(Duration::from_secs(5)))
            }));
        }

        let writer = {
            let space = space.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..TAKERS {
                    thread::sleep(Duration::from_micros(rng.gen_range(0, 500)));
                    // each blocked taker pops exactly one value before the next is inserted
                    while space.read::<i32>("/jitter", ReadOptions::non_blocking()).is_ok() {
                        thread::sleep(Duration::from_micros(rng.gen_range(0, 200)));
                    }
                    space.insert("/jitter", i, immediate());
                }
            })
        };
        writer.join().unwrap();

        let mut got: Vec<i32> = takers
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..TAKERS).collect::<Vec<_>>());
    }
}
