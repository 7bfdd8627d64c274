// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Layers: `PathSpaceBase` implementations that wrap another `PathSpaceBase`
//! instead of owning a tree of their own. Each can be mounted into a
//! `PathSpace` as a nested subspace, or driven directly by a caller holding
//! its own `Arc`.

pub mod alias;
pub mod snapshot;
pub mod trellis;

pub use alias::PathAlias;
pub use snapshot::{SnapshotCachedPathSpace, SnapshotMetrics, SnapshotOptions};
pub use trellis::{DisableTrellisCommand, EnableTrellisCommand, PathSpaceTrellis, TrellisMode, TrellisPolicy};
