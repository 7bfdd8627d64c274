// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

/// Bit-stable error discriminant shared by every layer of a `PathSpace`.
///
/// The ordering here is not significant, but the *names* are: callers match on
/// `ErrorCode` across crate boundaries, so a variant is never renamed or removed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCode {
    NoSuchPath,
    InvalidPath,
    InvalidPathSubcomponent,
    InvalidType,
    Timeout,
    CapabilityMismatch,
    CapabilityWriteMissing,
    InvalidPermissions,
    MemoryAllocationFailed,
    MalformedInput,
    UnmatchedQuotes,
    NoObjectFound,
    NotFound,
    NotSupported,
    SerializationFunctionMissing,
    UnserializableType,
    UnknownError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoSuchPath => "NoSuchPath",
            ErrorCode::InvalidPath => "InvalidPath",
            ErrorCode::InvalidPathSubcomponent => "InvalidPathSubcomponent",
            ErrorCode::InvalidType => "InvalidType",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::CapabilityMismatch => "CapabilityMismatch",
            ErrorCode::CapabilityWriteMissing => "CapabilityWriteMissing",
            ErrorCode::InvalidPermissions => "InvalidPermissions",
            ErrorCode::MemoryAllocationFailed => "MemoryAllocationFailed",
            ErrorCode::MalformedInput => "MalformedInput",
            ErrorCode::UnmatchedQuotes => "UnmatchedQuotes",
            ErrorCode::NoObjectFound => "NoObjectFound",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::SerializationFunctionMissing => "SerializationFunctionMissing",
            ErrorCode::UnserializableType => "UnserializableType",
            ErrorCode::UnknownError => "UnknownError",
        };
        f.write_str(name)
    }
}

/// An error surfaced by any `PathSpace` operation: a stable code plus a
/// human-readable message for logs and test assertions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
}

impl Error {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Error {
            code,
            message: message.into(),
        }
    }

    pub fn no_such_path<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::NoSuchPath, message)
    }

    pub fn invalid_path<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::InvalidPath, message)
    }

    pub fn invalid_path_subcomponent<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::InvalidPathSubcomponent, message)
    }

    pub fn invalid_type<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::InvalidType, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::Timeout, message)
    }

    pub fn no_object_found<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::NoObjectFound, message)
    }

    pub fn not_supported<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::NotSupported, message)
    }

    pub fn malformed_input<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::MalformedInput, message)
    }

    pub fn unserializable_type<S: Into<String>>(message: S) -> Self {
        Error::new(ErrorCode::UnserializableType, message)
    }

    pub fn is_empty_queue(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NoObjectFound | ErrorCode::NotFound | ErrorCode::NoSuchPath
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
