// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Path parsing, error types, the wait/notify registry, and the shared
//! per-tree context used by every other `pathspace` crate.

pub mod context;
pub mod error;
pub mod insert;
pub mod path;
pub mod wait;

pub use context::{Executor, NotificationSink, PathSpaceContext, Runnable};
pub use error::{Error, ErrorCode, Result};
pub use insert::{
    validate_path, DataCategory, ExecutionCategory, InputMetadata, InsertOptions, InsertReturn,
    ReadOptions, ValidationLevel,
};
pub use path::{
    append_index_suffix, components, is_concrete, is_glob, match_names, parse_indexed_component,
    IndexedComponent, PathIterator,
};
