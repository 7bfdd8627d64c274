// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The layering contract every concrete space and every layer implements,
//! and the handful of supporting types (`VisitOptions`, `Children`,
//! `CopyStats`) the contract's operations share.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use pathspace_core::{Error, InsertOptions, InsertReturn, NotificationSink, ReadOptions, Result};
use pathspace_future::FutureAny;
use pathspace_tree::Encode;

/// A plain value read back from `PathSpaceBase::list_children`: the names
/// of a node's immediate children, in no particular order. Grounded on the
/// alias layer's `listChildrenCanonical`, which reads exactly this shape
/// back from the upstream space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Children {
    pub names: Vec<String>,
}

/// Bounds and switches for a `visit` traversal.
#[derive(Clone, Debug)]
pub struct VisitOptions {
    pub max_depth: Option<usize>,
    pub max_children: Option<usize>,
    pub include_nested_spaces: bool,
    pub include_values: bool,
    pub root: String,
}

impl Default for VisitOptions {
    fn default() -> Self {
        VisitOptions {
            max_depth: None,
            max_children: None,
            include_nested_spaces: true,
            include_values: true,
            root: "/".to_string(),
        }
    }
}

/// What a visitor reports back for each entry `visit` walks over.
pub enum VisitControl {
    Continue,
    Stop,
}

pub type PathVisitor<'a> = dyn FnMut(&str) -> VisitControl + 'a;

/// Tally produced by `clone()`: a deep copy drops execution payloads, so a
/// caller can tell how much of the original tree didn't survive the copy.
#[derive(Clone, Debug, Default)]
pub struct CopyStats {
    pub values_copied: u64,
    pub spaces_copied: u64,
    pub tasks_dropped: u64,
}

/// The operation set every layer (alias, trellis, snapshot cache) and every
/// concrete `PathSpace` implements. Richer than `pathspace_tree::NestedSpace`
/// — it adds `visit`, the batched `span_pack_*`/`pack_insert*` operations,
/// and the adoption hook — which is why it lives in the root crate instead
/// of `pathspace-tree`: only here can it depend on both the tree and the
/// layer types built on top of it without creating a cycle.
pub trait PathSpaceBase: Send + Sync {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn;

    /// Single-shot read or pop. `expected_type`, when given, is checked
    /// against the front entry's concrete type before it is committed to —
    /// see `pathspace_tree::leaf::extract_front`. Passing `None` falls back
    /// to the old kind-only (value vs. task vs. nested) check.
    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>>;
    fn future_at(&self, path: &str) -> Result<FutureAny>;
    fn notify(&self, path: &str);
    fn shutdown(&self);
    fn visit(&self, visitor: &mut PathVisitor, options: &VisitOptions) -> Result<()>;

    /// Names of the immediate children of the node at `path`, sorted.
    /// Grounded on `PathAlias::listChildrenCanonical`'s use of `read<Children>`;
    /// exposed as a first-class trait method rather than going through
    /// `out_raw` since `Children` carries no wire encoding of its own.
    fn list_children(&self, path: &str) -> Result<Children>;

    /// Re-parents this space under `mount_prefix`, installing `sink` as the
    /// context's notification sink. The default forwards to `notify` at the
    /// mount path — concrete layers override only when they keep their own
    /// context object (e.g. the root `PathSpace`, which owns the context
    /// every nested nested space below it is adopted into).
    fn adopt_context_and_prefix(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()>;

    /// Batched read over several paths sharing one `InputMetadata`. The
    /// default loops calling `out_raw` per path and refuses outright
    /// (`NotSupported`) once any individual call fails for a reason other
    /// than an empty queue — concrete layers may override with a real
    /// batched fast path.
    fn span_pack_const(&self, paths: &[String], pop: bool, options: &ReadOptions) -> Result<Vec<Box<dyn Any + Send + Sync>>> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push(self.out_raw(path, pop, options, None)?);
        }
        Ok(out)
    }

    fn span_pack_mut(&self, paths: &[String], options: &ReadOptions) -> Result<Vec<Box<dyn Any + Send + Sync>>> {
        self.span_pack_const(paths, true, options)
    }

    /// Batched insert of one payload-per-path. Default loops; a layer may
    /// override to share validation or locking work across the batch.
    fn pack_insert(&self, paths: &[String], payloads: Vec<Box<dyn Any + Send + Sync>>, options: &InsertOptions) -> InsertReturn {
        let mut ret = InsertReturn::new();
        for (path, payload) in paths.iter().zip(payloads.into_iter()) {
            ret.merge(self.insert_raw(path, payload, options));
        }
        ret
    }

    /// Batched insert where every path shares the same already-encoded
    /// payload span (used for broadcasting one value to many destinations).
    /// The default only ever sees a plain value payload (the shape
    /// `insert_raw_core` unwraps as `Box<dyn Encode>`) — it clones that
    /// value per destination with `Encode::clone_box` and inserts each
    /// clone in turn. A nested-subspace or task payload can't be shared
    /// across destinations at all, so the default refuses with
    /// `NotSupported` rather than silently dropping the payload; concrete
    /// layers needing a real batched fast path override this directly.
    fn pack_insert_spans(&self, paths: &[String], payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn
    where
        Self: Sized,
    {
        let mut ret = InsertReturn::new();
        let value = match payload.downcast::<Box<dyn Encode>>() {
            Ok(value) => value,
            Err(_) => {
                ret.errors.push(Error::not_supported(
                    "pack_insert_spans only supports broadcasting a plain value across paths",
                ));
                return ret;
            }
        };
        for path in paths {
            let clone: Box<dyn Any + Send + Sync> = Box::new(value.clone_box());
            ret.merge(self.insert_raw(path, clone, options));
        }
        ret
    }
}
