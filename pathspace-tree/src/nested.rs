// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The narrow, object-safe contract a nested subspace must satisfy so a
//! parent tree can route into it without `pathspace-tree` depending on the
//! facade or layer types defined in the root crate (those depend on this
//! crate, not the other way around).

use std::any::TypeId;
use std::sync::Weak;

use pathspace_core::{Error, InsertOptions, NotificationSink, ReadOptions, Result};
use pathspace_future::FutureAny;

/// What a single `in`/`out` call at a nested node needs from the space it
/// is delegating into. `PathSpaceBase` in the root crate is a superset of
/// this trait; every concrete space that can be nested implements both.
pub trait NestedSpace: Send + Sync {
    /// Inserts a raw already-decoded value at `path` inside this nested
    /// space. `payload` is a serialized blob understood by the specific
    /// implementation; keeping it opaque here is what avoids a generic
    /// parameter on a trait object.
    fn insert_raw(&self, path: &str, payload: Box<dyn std::any::Any + Send + Sync>, options: &InsertOptions) -> Result<()>;

    /// Reads or pops a value out of this nested space, returning the same
    /// opaque payload `insert_raw` accepted. `expected_type`, when given, is
    /// checked against the front entry's concrete type before it is
    /// committed to, under the same lock as the peek/pop itself — see
    /// `pathspace-tree::leaf::extract_front`.
    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn std::any::Any + Send + Sync>>;

    /// Looks up a pending task's erased future at `path`, if any.
    fn future_at(&self, path: &str) -> Result<FutureAny>;

    /// Wakes blocked readers anywhere under `path` in this nested space.
    fn notify(&self, path: &str);

    /// Tears the nested space down: wakes every blocked reader with a
    /// `NoSuchPath`-flavored wakeup and detaches its executor, if any.
    fn shutdown(&self);

    /// Re-parents this space under a new mount prefix and notification
    /// sink, used when a `Nested` queue entry is adopted into a different
    /// tree (Invariant I-3).
    fn adopt(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()>;
}

pub(crate) fn no_such_nested(path: &str) -> Error {
    Error::no_such_path(format!("no nested subspace mounted at {}", path))
}
