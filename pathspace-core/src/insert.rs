// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::TypeId;
use std::time::Duration;

use crate::error::{Error, Result};

/// How strictly a path is checked before an operation is attempted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationLevel {
    None,
    Basic,
    Full,
}

impl Default for ValidationLevel {
    fn default() -> Self {
        ValidationLevel::Basic
    }
}

/// When a callable payload is scheduled on the executor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionCategory {
    /// Scheduled as soon as it is inserted.
    Immediate,
    /// Scheduled the first time a reader reaches the slot.
    Lazy,
}

impl Default for ExecutionCategory {
    fn default() -> Self {
        ExecutionCategory::Immediate
    }
}

/// How a value entry is represented in a `NodeData` byte buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataCategory {
    Fundamental,
    SerializedData,
    PodPreferred,
}

/// Describes the static type and storage category of a value being written
/// or read, enough for `NodeData` to match front-of-queue entries against a
/// caller's expected type without reifying the value itself.
#[derive(Clone, Copy, Debug)]
pub struct InputMetadata {
    pub type_id: TypeId,
    pub category: DataCategory,
}

impl InputMetadata {
    pub fn of<T: 'static>(category: DataCategory) -> Self {
        InputMetadata {
            type_id: TypeId::of::<T>(),
            category,
        }
    }
}

/// Options accepted by `insert`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InsertOptions {
    pub validation_level: ValidationLevel,
    pub execution_category: ExecutionCategory,
}

/// Options accepted by `read`/`take`.
#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    pub do_block: bool,
    pub timeout: Option<Duration>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            do_block: false,
            timeout: None,
        }
    }
}

impl ReadOptions {
    pub fn blocking(timeout: Duration) -> Self {
        ReadOptions {
            do_block: true,
            timeout: Some(timeout),
        }
    }

    pub fn non_blocking() -> Self {
        ReadOptions::default()
    }
}

/// Tally of what an `insert` actually did, plus any per-child errors
/// encountered while fanning a glob insert out across matching children.
#[derive(Clone, Debug, Default)]
pub struct InsertReturn {
    pub values_inserted: u32,
    pub spaces_inserted: u32,
    pub tasks_inserted: u32,
    pub errors: Vec<Error>,
}

impl InsertReturn {
    pub fn new() -> Self {
        InsertReturn::default()
    }

    /// Folds `other` into `self`, used when a glob insert fans out across
    /// several matching children and their individual tallies need
    /// combining into one return value.
    pub fn merge(&mut self, other: InsertReturn) {
        self.values_inserted += other.values_inserted;
        self.spaces_inserted += other.spaces_inserted;
        self.tasks_inserted += other.tasks_inserted;
        self.errors.extend(other.errors);
    }
}

/// Validates a path under the given strictness. `None` never fails.
/// `Basic` requires a non-empty string starting with `/` and, unless the
/// path is exactly the root, no trailing `/`. `Full` additionally rejects
/// unmatched quotes and unterminated glob brackets in any component.
pub fn validate_path(path: &str, level: ValidationLevel) -> Result<()> {
    if level == ValidationLevel::None {
        return Ok(());
    }
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::invalid_path(format!(
            "path must be non-empty and start with '/': {:?}",
            path
        )));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(Error::invalid_path(format!(
            "path must not have a trailing '/': {:?}",
            path
        )));
    }
    if level == ValidationLevel::Full {
        let quotes = path.chars().filter(|&c| c == '"').count();
        if quotes % 2 != 0 {
            return Err(Error::new(
                crate::error::ErrorCode::UnmatchedQuotes,
                format!("unmatched quote in path: {:?}", path),
            ));
        }
        for component in crate::path::components(path) {
            if component.matches('[').count() != component.matches(']').count() {
                return Err(Error::invalid_path_subcomponent(format!(
                    "unterminated character class in component: {:?}",
                    component
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_validation_rejects_missing_leading_slash() {
        assert!(validate_path("a/b", ValidationLevel::Basic).is_err());
    }

    #[test]
    fn basic_validation_rejects_trailing_slash() {
        assert!(validate_path("/a/b/", ValidationLevel::Basic).is_err());
        assert!(validate_path("/", ValidationLevel::Basic).is_ok());
    }

    #[test]
    fn full_validation_catches_unmatched_brackets() {
        assert!(validate_path("/a[b", ValidationLevel::Full).is_err());
        assert!(validate_path("/a[b]", ValidationLevel::Full).is_ok());
    }

    #[test]
    fn none_accepts_anything() {
        assert!(validate_path("", ValidationLevel::None).is_ok());
    }

    #[test]
    fn merge_combines_tallies_and_errors() {
        let mut a = InsertReturn {
            values_inserted: 1,
            ..InsertReturn::default()
        };
        let b = InsertReturn {
            values_inserted: 2,
            errors: vec![Error::no_such_path("x")],
            ..InsertReturn::default()
        };
        a.merge(b);
        assert_eq!(a.values_inserted, 3);
        assert_eq!(a.errors.len(), 1);
    }
}
