// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A lightweight alias/mount layer that forwards to an upstream space by
//! rewriting every path with a target prefix.
//!
//! Mount-agnostic: an alias can be inserted anywhere in a parent space.
//! `insert`/`out`/`notify` are forwarded upstream with the alias path
//! appended to the current target prefix; retargeting is atomic and wakes
//! any reader blocked on a path under the alias's own mount.
//!
//! This layer does not reflect upstream notifications back through itself
//! automatically — callers either notify through the alias, or a
//! higher-level manager bridges notifications between the two namespaces.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use pathspace_core::{Error, InsertOptions, InsertReturn, NotificationSink, ReadOptions, Result};
use pathspace_future::FutureAny;
use pathspace_tree::{Encode, NestedSpace};

use crate::base::{Children, PathSpaceBase, PathVisitor, VisitOptions};

/// Forwards every operation to `upstream` with paths rewritten under
/// `target_prefix`. `mount_prefix` and `sink` are filled in by `adopt`,
/// when a parent space mounts this alias as a nested subspace; they are
/// what lets `set_target_prefix` wake readers blocked on the alias's own
/// mount point without going anywhere near `upstream`.
pub struct PathAlias {
    upstream: Arc<dyn PathSpaceBase>,
    target_prefix: Mutex<String>,
    mount_prefix: Mutex<String>,
    sink: Mutex<Option<Weak<dyn NotificationSink>>>,
}

impl PathAlias {
    pub fn new(upstream: Arc<dyn PathSpaceBase>, target_prefix: impl Into<String>) -> Arc<PathAlias> {
        let alias = Arc::new(PathAlias {
            upstream,
            target_prefix: Mutex::new(String::new()),
            mount_prefix: Mutex::new(String::new()),
            sink: Mutex::new(None),
        });
        alias.set_target_prefix(target_prefix.into());
        alias
    }

    /// Atomically changes the prefix this alias forwards to, then wakes
    /// any reader blocked on the alias's own mount point so it re-checks
    /// against the new target.
    pub fn set_target_prefix(&self, new_prefix: String) {
        *self.target_prefix.lock() = normalize_prefix(new_prefix);

        let mount = self.mount_prefix.lock().clone();
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            if mount.is_empty() {
                sink.notify("/");
            } else {
                sink.notify(&mount);
            }
        }
    }

    pub fn target_prefix(&self) -> String {
        self.target_prefix.lock().clone()
    }

    fn map_path(&self, tail: &str) -> String {
        join_paths(&self.target_prefix.lock(), tail)
    }

    fn strip_target_prefix(&self, upstream_path: &str) -> String {
        let prefix = self.target_prefix.lock().clone();
        if prefix.is_empty() || prefix == "/" {
            return upstream_path.to_string();
        }
        if upstream_path == prefix {
            return "/".to_string();
        }
        if upstream_path.len() > prefix.len() && upstream_path.starts_with(&prefix) {
            let remainder = &upstream_path[prefix.len()..];
            return if remainder.is_empty() {
                "/".to_string()
            } else if !remainder.starts_with('/') {
                format!("/{}", remainder)
            } else {
                remainder.to_string()
            };
        }
        upstream_path.to_string()
    }

    fn map_visit_root(&self, path: &str) -> String {
        if path.is_empty() || path == "/" {
            let prefix = self.target_prefix.lock().clone();
            return if prefix.is_empty() { "/".to_string() } else { prefix };
        }
        self.map_path(path)
    }

    /// Inserts a plain value at `path`, mapped onto the current target prefix.
    pub fn insert<T: Encode + Clone + 'static>(&self, path: &str, value: T, options: InsertOptions) -> InsertReturn {
        let payload: Box<dyn Any + Send + Sync> = Box::new(Box::new(value) as Box<dyn Encode>);
        self.upstream.insert_raw(&self.map_path(path), payload, &options)
    }

    /// Non-destructive typed read, mapped onto the current target prefix.
    /// The expected type is passed into `out_raw` itself so the upstream
    /// tree checks it before committing to the entry, not after.
    pub fn read<T: Clone + 'static>(&self, path: &str, options: ReadOptions) -> Result<T> {
        let boxed = self.upstream.out_raw(&self.map_path(path), false, &options, Some(TypeId::of::<T>()))?;
        extract_boxed(boxed)
    }

    /// Destructive typed read, mapped onto the current target prefix. Like
    /// `read`, the type check happens inside the upstream `out_raw` call, at
    /// the same lock acquisition as the pop — a mismatched entry is never
    /// destructively removed just to discover the mismatch afterward.
    pub fn take<T: Clone + 'static>(&self, path: &str, options: ReadOptions) -> Result<T> {
        let boxed = self.upstream.out_raw(&self.map_path(path), true, &options, Some(TypeId::of::<T>()))?;
        extract_boxed(boxed)
    }
}

/// Recovers a `T` from the boxed `Any` an `out_raw` call returns: either a
/// boxed `Box<dyn Encode>` (a plain value one hop away) or, if some
/// forwarding already unwrapped it, a directly boxed `T`. The upstream
/// `out_raw` call has already checked the type against what it was asked
/// for; this downcast should never actually fail in practice, but stays
/// defensive against a layer that forwards `expected_type: None`.
fn extract_boxed<T: Clone + 'static>(boxed: Box<dyn Any + Send + Sync>) -> Result<T> {
    match boxed.downcast::<Box<dyn Encode>>() {
        Ok(value) => value
            .as_any()
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::invalid_type("stored value is not the requested type")),
        Err(boxed) => boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::invalid_type("front entry does not hold the requested type")),
    }
}

/// Joins `prefix` and `tail`, ensuring exactly one slash at the boundary.
fn join_paths(prefix: &str, tail: &str) -> String {
    if prefix.is_empty() {
        return tail.to_string();
    }
    if tail.is_empty() {
        return prefix.to_string();
    }
    let prefix_ends_with_slash = prefix.ends_with('/');
    let tail_starts_with_slash = tail.starts_with('/');
    if prefix_ends_with_slash && tail_starts_with_slash {
        format!("{}{}", prefix, &tail[1..])
    } else if !prefix_ends_with_slash && !tail_starts_with_slash {
        format!("{}/{}", prefix, tail)
    } else {
        format!("{}{}", prefix, tail)
    }
}

/// Normalizes a target prefix to start with `/` and carry no trailing
/// slash, except for the root prefix itself.
fn normalize_prefix(mut prefix: String) -> String {
    if prefix.is_empty() || !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}

impl NestedSpace for PathAlias {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> Result<()> {
        let mapped = self.map_path(path);
        match self.upstream.insert_raw(&mapped, payload, options).errors.into_iter().next() {
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
        self.upstream.out_raw(&self.map_path(path), pop, options, expected_type)
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        self.upstream.future_at(&self.map_path(path))
    }

    fn notify(&self, path: &str) {
        self.upstream.notify(&self.map_path(path));
    }

    /// No special shutdown behavior: the upstream space is managed by
    /// whoever owns it, not by the alias pointing at it.
    fn shutdown(&self) {}

    fn adopt(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        *self.mount_prefix.lock() = mount_prefix;
        *self.sink.lock() = Some(sink);
        Ok(())
    }
}

impl PathSpaceBase for PathAlias {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn {
        self.upstream.insert_raw(&self.map_path(path), payload, options)
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        self.upstream.out_raw(&self.map_path(path), pop, options, expected_type)
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        self.upstream.future_at(&self.map_path(path))
    }

    fn notify(&self, path: &str) {
        self.upstream.notify(&self.map_path(path));
    }

    fn shutdown(&self) {}

    fn visit(&self, visitor: &mut PathVisitor, options: &VisitOptions) -> Result<()> {
        let mut mapped_options = options.clone();
        mapped_options.root = self.map_visit_root(&options.root);
        self.upstream.visit(
            &mut |upstream_path| visitor(&self.strip_target_prefix(upstream_path)),
            &mapped_options,
        )
    }

    fn adopt_context_and_prefix(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        *self.mount_prefix.lock() = mount_prefix;
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn list_children(&self, path: &str) -> Result<Children> {
        self.upstream.list_children(&self.map_path(path))
    }

    fn span_pack_const(&self, paths: &[String], pop: bool, options: &ReadOptions) -> Result<Vec<Box<dyn Any + Send + Sync>>> {
        let mapped: Vec<String> = paths.iter().map(|p| self.map_path(p)).collect();
        self.upstream.span_pack_const(&mapped, pop, options)
    }

    fn span_pack_mut(&self, paths: &[String], options: &ReadOptions) -> Result<Vec<Box<dyn Any + Send + Sync>>> {
        let mapped: Vec<String> = paths.iter().map(|p| self.map_path(p)).collect();
        self.upstream.span_pack_mut(&mapped, options)
    }

    fn pack_insert(&self, paths: &[String], payloads: Vec<Box<dyn Any + Send + Sync>>, options: &InsertOptions) -> InsertReturn {
        let mapped: Vec<String> = paths.iter().map(|p| self.map_path(p)).collect();
        self.upstream.pack_insert(&mapped, payloads, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::VisitControl;
    use crate::space::PathSpace;

    #[test]
    fn insert_and_read_forward_through_the_mapped_prefix() {
        let upstream = PathSpace::new();
        let alias: Arc<PathAlias> = PathAlias::new(upstream.clone(), "/devices/mouse/0");

        alias.insert("/x", 7i32, InsertOptions::default());
        assert_eq!(upstream.read::<i32>("/devices/mouse/0/x", ReadOptions::non_blocking()).unwrap(), 7);
        assert_eq!(alias.read::<i32>("/x", ReadOptions::non_blocking()).unwrap(), 7);
    }

    #[test]
    fn retargeting_moves_where_reads_resolve() {
        let upstream = PathSpace::new();
        let alias = PathAlias::new(upstream.clone(), "/a");
        upstream.insert("/a/x", 1i32, InsertOptions::default());
        upstream.insert("/b/x", 2i32, InsertOptions::default());

        assert_eq!(alias.read::<i32>("/x", ReadOptions::non_blocking()).unwrap(), 1);
        alias.set_target_prefix("/b".to_string());
        assert_eq!(alias.read::<i32>("/x", ReadOptions::non_blocking()).unwrap(), 2);
    }

    #[test]
    fn visit_reports_paths_in_the_alias_namespace() {
        let upstream = PathSpace::new();
        let alias = PathAlias::new(upstream.clone(), "/mnt");
        upstream.insert("/mnt/a", 1i32, InsertOptions::default());
        upstream.insert("/mnt/b", 2i32, InsertOptions::default());

        let mut seen = Vec::new();
        let options = VisitOptions::default();
        alias
            .visit(
                &mut |path| {
                    seen.push(path.to_string());
                    VisitControl::Continue
                },
                &options,
            )
            .unwrap();
        assert!(seen.contains(&"/a".to_string()));
        assert!(seen.contains(&"/b".to_string()));
        assert!(!seen.iter().any(|p| p.starts_with("/mnt")));
    }

    #[test]
    fn normalizes_prefixes_without_a_leading_or_with_a_trailing_slash() {
        let upstream = PathSpace::new();
        let alias = PathAlias::new(upstream, "devices/mouse/0/".to_string());
        assert_eq!(alias.target_prefix(), "/devices/mouse/0");
    }

    #[test]
    fn take_of_the_wrong_type_never_destroys_the_stored_value() {
        let upstream = PathSpace::new();
        let alias = PathAlias::new(upstream.clone(), "/a");
        alias.insert("/x", 7i32, InsertOptions::default());

        assert!(alias.take::<String>("/x", ReadOptions::non_blocking()).is_err());
        assert_eq!(alias.take::<i32>("/x", ReadOptions::non_blocking()).unwrap(), 7);
    }
}
