// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Instant;

use pathspace_core::{Error, Result};

use crate::future::FutureT;
use crate::shared_state::SharedState;

fn is_ready_impl<T: Clone + Send + Sync + 'static>(state: &Arc<dyn Any + Send + Sync>) -> bool {
    state
        .downcast_ref::<SharedState<T>>()
        .expect("FutureAny ops called against the wrong concrete type")
        .is_ready()
}

fn wait_impl<T: Clone + Send + Sync + 'static>(state: &Arc<dyn Any + Send + Sync>) {
    state
        .downcast_ref::<SharedState<T>>()
        .expect("FutureAny ops called against the wrong concrete type")
        .wait();
}

fn wait_until_impl<T: Clone + Send + Sync + 'static>(
    state: &Arc<dyn Any + Send + Sync>,
    deadline: Instant,
) -> bool {
    state
        .downcast_ref::<SharedState<T>>()
        .expect("FutureAny ops called against the wrong concrete type")
        .wait_until(deadline)
        .is_some()
}

#[derive(Clone, Copy)]
struct Ops {
    is_ready: fn(&Arc<dyn Any + Send + Sync>) -> bool,
    wait: fn(&Arc<dyn Any + Send + Sync>),
    wait_until: fn(&Arc<dyn Any + Send + Sync>, Instant) -> bool,
}

/// A type-erased view onto an execution slot's eventual result. Holds a
/// runtime type id so a caller can attempt `downcast::<T>()` back to a typed
/// `FutureT<T>`; the erased lifecycle operations (`is_ready`/`wait`) work
/// without knowing `T`.
#[derive(Clone)]
pub struct FutureAny {
    type_id: TypeId,
    type_name: &'static str,
    state: Arc<dyn Any + Send + Sync>,
    ops: Ops,
}

impl FutureAny {
    pub fn new<T: Clone + Send + Sync + 'static>(future: FutureT<T>) -> Self {
        FutureAny {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            state: future.state,
            ops: Ops {
                is_ready: is_ready_impl::<T>,
                wait: wait_impl::<T>,
                wait_until: wait_until_impl::<T>,
            },
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_ready(&self) -> bool {
        (self.ops.is_ready)(&self.state)
    }

    pub fn wait(&self) {
        (self.ops.wait)(&self.state)
    }

    pub fn wait_until(&self, deadline: Instant) -> bool {
        (self.ops.wait_until)(&self.state, deadline)
    }

    /// Recovers a typed `FutureT<T>`. Fails with `InvalidType` if `T` does
    /// not match the type this handle was erased from.
    pub fn downcast<T: Clone + Send + Sync + 'static>(&self) -> Result<FutureT<T>> {
        if self.type_id != TypeId::of::<T>() {
            return Err(Error::invalid_type(format!(
                "FutureAny holds {}, requested {}",
                self.type_name,
                std::any::type_name::<T>()
            )));
        }
        let state = self
            .state
            .clone()
            .downcast::<SharedState<T>>()
            .expect("type_id matched but downcast failed");
        Ok(FutureT { state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::channel;

    #[test]
    fn downcast_succeeds_for_matching_type() {
        let (promise, future) = channel::<i32>();
        promise.set_value(5);
        let any = FutureAny::new(future);
        assert!(any.is_ready());
        let typed = any.downcast::<i32>().unwrap();
        assert_eq!(typed.wait(), 5);
    }

    #[test]
    fn downcast_fails_for_mismatched_type() {
        let (_promise, future) = channel::<i32>();
        let any = FutureAny::new(future);
        let err = any.downcast::<String>().unwrap_err();
        assert_eq!(err.code, pathspace_core::ErrorCode::InvalidType);
    }
}
