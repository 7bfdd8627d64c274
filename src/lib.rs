// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An in-process, hierarchical, path-addressed value and task space.
//!
//! The concurrent tree (node routing, glob matching, the per-node queue)
//! lives in `pathspace-tree`; wait/notify and executor plumbing shared
//! across a whole space lives in `pathspace-core`; task handles live in
//! `pathspace-executor`; future handles live in `pathspace-future`. This
//! crate is the facade: `PathSpace` itself, the `PathSpaceBase` contract
//! every space and layer implements, and the layers (`alias`, `trellis`,
//! `snapshot`) built on top of it.

mod base;
mod space;

pub mod layer;

pub use base::{Children, CopyStats, PathSpaceBase, PathVisitor, VisitControl, VisitOptions};
pub use space::PathSpace;

pub use pathspace_core::{
    DataCategory, Error, ErrorCode, ExecutionCategory, InputMetadata, InsertOptions, InsertReturn, ReadOptions, Result,
    ValidationLevel,
};
pub use pathspace_tree::Encode;
