// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The subset of types a `NodeData` can snapshot to bytes and back.
//!
//! Rust's `TypeId` is process-local and never appears on the wire (the
//! original snapshot format was explicit that type ids are process-
//! addressed and must not be persisted across processes); instead, every
//! encodable value tags itself with one of a small closed set of
//! `TypeTag`s that a decoder can dispatch on within this process.

use std::any::Any;
use std::convert::TryInto;

use pathspace_core::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TypeTag {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Bytes,
}

impl TypeTag {
    pub fn to_u8(self) -> u8 {
        match self {
            TypeTag::I32 => 0,
            TypeTag::I64 => 1,
            TypeTag::U32 => 2,
            TypeTag::U64 => 3,
            TypeTag::F64 => 4,
            TypeTag::Bool => 5,
            TypeTag::Str => 6,
            TypeTag::Bytes => 7,
        }
    }

    pub fn from_u8(raw: u8) -> Result<TypeTag> {
        Ok(match raw {
            0 => TypeTag::I32,
            1 => TypeTag::I64,
            2 => TypeTag::U32,
            3 => TypeTag::U64,
            4 => TypeTag::F64,
            5 => TypeTag::Bool,
            6 => TypeTag::Str,
            7 => TypeTag::Bytes,
            other => {
                return Err(Error::new(
                    pathspace_core::ErrorCode::SerializationFunctionMissing,
                    format!("no decoder registered for wire type tag {}", other),
                ))
            }
        })
    }
}

/// A value that can be written into a `NodeData` snapshot buffer and
/// recovered from it. Stored boxed as `Box<dyn Encode>` inside `QueueEntry`,
/// doubling as the type-erased live value (via `as_any`) and as the
/// serialization hook.
pub trait Encode: Any + Send + Sync {
    fn type_tag(&self) -> TypeTag;
    fn encode(&self) -> Vec<u8>;
    fn as_any(&self) -> &dyn Any;
    fn clone_box(&self) -> Box<dyn Encode>;
}

macro_rules! impl_encode_num {
    ($t:ty, $tag:expr) => {
        impl Encode for $t {
            fn type_tag(&self) -> TypeTag {
                $tag
            }
            fn encode(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn clone_box(&self) -> Box<dyn Encode> {
                Box::new(*self)
            }
        }
    };
}

impl_encode_num!(i32, TypeTag::I32);
impl_encode_num!(i64, TypeTag::I64);
impl_encode_num!(u32, TypeTag::U32);
impl_encode_num!(u64, TypeTag::U64);
impl_encode_num!(f64, TypeTag::F64);

impl Encode for bool {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Bool
    }
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn clone_box(&self) -> Box<dyn Encode> {
        Box::new(*self)
    }
}

impl Encode for String {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Str
    }
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn clone_box(&self) -> Box<dyn Encode> {
        Box::new(self.clone())
    }
}

impl Encode for Vec<u8> {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Bytes
    }
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn clone_box(&self) -> Box<dyn Encode> {
        Box::new(self.clone())
    }
}

/// Reconstructs a boxed value from its wire tag and bytes. Fails with
/// `MalformedInput` when the byte length doesn't match what the tag
/// requires.
pub fn decode_tagged(tag: TypeTag, bytes: &[u8]) -> Result<Box<dyn Encode>> {
    fn bad(what: &str) -> Error {
        Error::malformed_input(format!("truncated {} in snapshot", what))
    }
    Ok(match tag {
        TypeTag::I32 => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| bad("i32"))?;
            Box::new(i32::from_le_bytes(arr))
        }
        TypeTag::I64 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| bad("i64"))?;
            Box::new(i64::from_le_bytes(arr))
        }
        TypeTag::U32 => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| bad("u32"))?;
            Box::new(u32::from_le_bytes(arr))
        }
        TypeTag::U64 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| bad("u64"))?;
            Box::new(u64::from_le_bytes(arr))
        }
        TypeTag::F64 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| bad("f64"))?;
            Box::new(f64::from_le_bytes(arr))
        }
        TypeTag::Bool => {
            if bytes.len() != 1 {
                return Err(bad("bool"));
            }
            Box::new(bytes[0] != 0)
        }
        TypeTag::Str => Box::new(
            String::from_utf8(bytes.to_vec()).map_err(|_| Error::malformed_input("invalid utf8 in snapshot"))?,
        ),
        TypeTag::Bytes => Box::new(bytes.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_round_trips() {
        let v: i32 = 42;
        let bytes = v.encode();
        let decoded = decode_tagged(TypeTag::I32, &bytes).unwrap();
        assert_eq!(decoded.as_any().downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn string_round_trips() {
        let v = "hello".to_string();
        let bytes = v.encode();
        let decoded = decode_tagged(TypeTag::Str, &bytes).unwrap();
        assert_eq!(decoded.as_any().downcast_ref::<String>(), Some(&v));
    }

    #[test]
    fn truncated_numeric_is_malformed() {
        assert!(decode_tagged(TypeTag::I64, &[1, 2, 3]).is_err());
    }
}
