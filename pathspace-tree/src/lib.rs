// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The concurrent tree: per-node payload queues (`queue`), the routing
//! logic that walks a path to the right node (`leaf`), the encodable
//! value subset a queue can snapshot (`encode`), and the narrow contract
//! a mounted nested subspace must satisfy (`nested`).

pub mod encode;
pub mod leaf;
pub mod nested;
pub mod queue;

pub use encode::{decode_tagged, Encode, TypeTag};
pub use leaf::{Extracted, Payload, Tree};
pub use nested::NestedSpace;
pub use queue::{NestedBorrow, NodeData, QueueEntry};
