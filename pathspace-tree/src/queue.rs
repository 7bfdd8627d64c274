// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `NodeData`: the heterogeneous FIFO payload queue stored at a single tree
//! node. A node's queue interleaves plain values, nested subspaces, and
//! pending execution tasks in insertion order; every read or pop operates
//! on whichever entry currently sits at the front, regardless of its kind.

use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;
use std::sync::Arc;

use log::warn;
use parking_lot::{Condvar, Mutex};

use pathspace_core::{DataCategory, Error, ErrorCode, Result, Runnable};
use pathspace_future::FutureAny;

use crate::encode::{decode_tagged, Encode, TypeTag};
use crate::nested::NestedSpace;

const SNAPSHOT_VERSION: u32 = 2;

/// Per-slot borrow bookkeeping for a nested subspace. Keyed by a
/// monotonic id rather than queue position so a shared borrow survives
/// unrelated value entries being popped out from in front of it, and lives
/// independently of the node's own payload mutex: a `NestedBorrow` guard
/// can be dropped, and `take_nested_at` can poll, without either side
/// holding the node lock while it waits.
pub struct BorrowSlot {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl BorrowSlot {
    fn new() -> Arc<Self> {
        Arc::new(BorrowSlot {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        })
    }

    fn acquire(self: &Arc<Self>) -> NestedBorrow {
        *self.count.lock() += 1;
        NestedBorrow { slot: self.clone() }
    }

    fn is_idle(&self) -> bool {
        *self.count.lock() == 0
    }
}

/// RAII guard for a shared borrow of a nested subspace. Decrements the
/// slot's count and wakes anyone polling `take_nested_at` when dropped.
pub struct NestedBorrow {
    slot: Arc<BorrowSlot>,
}

impl Drop for NestedBorrow {
    fn drop(&mut self) {
        let mut count = self.slot.count.lock();
        *count -= 1;
        if *count == 0 {
            self.slot.condvar.notify_all();
        }
    }
}

/// The front entry's kind and, for a value, its `TypeId` — cheap to read
/// without cloning the boxed value itself, so a caller can decide whether
/// to peek or pop before touching the entry at all.
pub enum FrontKind {
    Value(TypeId),
    Task,
    Nested,
}

pub enum QueueEntry {
    Value {
        type_id: TypeId,
        category: DataCategory,
        value: Box<dyn Encode>,
    },
    Nested {
        id: u64,
        space: Option<Arc<dyn NestedSpace>>,
    },
    Task {
        task: Arc<dyn Runnable>,
        future: FutureAny,
    },
}

impl QueueEntry {
    fn kind_name(&self) -> &'static str {
        match self {
            QueueEntry::Value { .. } => "value",
            QueueEntry::Nested { .. } => "nested",
            QueueEntry::Task { .. } => "task",
        }
    }
}

/// The payload queue of a single tree node.
pub struct NodeData {
    entries: VecDeque<QueueEntry>,
    next_nested_id: u64,
    borrows: HashMap<u64, Arc<BorrowSlot>>,
}

impl NodeData {
    pub fn new() -> Self {
        NodeData {
            entries: VecDeque::new(),
            next_nested_id: 0,
            borrows: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn value_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, QueueEntry::Value { .. }))
            .count()
    }

    pub fn nested_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, QueueEntry::Nested { .. }))
            .count()
    }

    pub fn task_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, QueueEntry::Task { .. }))
            .count()
    }

    /// Per-entry kind labels in FIFO order, front first. Used by tests
    /// asserting queue ordering without exposing the entry type itself.
    pub fn type_summary(&self) -> Vec<&'static str> {
        self.entries.iter().map(QueueEntry::kind_name).collect()
    }

    pub fn push_value<T: Encode + 'static>(&mut self, category: DataCategory, value: T) {
        self.push_value_boxed(TypeId::of::<T>(), category, Box::new(value));
    }

    pub fn push_value_boxed(&mut self, type_id: TypeId, category: DataCategory, value: Box<dyn Encode>) {
        self.entries.push_back(QueueEntry::Value {
            type_id,
            category,
            value,
        });
    }

    /// Pushes a nested subspace entry and returns the slot id later used to
    /// address it via `borrow_nested_shared`/`try_take_nested_at`.
    pub fn push_nested(&mut self, space: Arc<dyn NestedSpace>) -> u64 {
        let id = self.next_nested_id;
        self.next_nested_id += 1;
        self.borrows.insert(id, BorrowSlot::new());
        self.entries.push_back(QueueEntry::Nested { id, space: Some(space) });
        id
    }

    pub fn push_task(&mut self, task: Arc<dyn Runnable>, future: FutureAny) {
        self.entries.push_back(QueueEntry::Task { task, future });
    }

    /// Reads the front value without removing it. Fails with `InvalidType`
    /// if the front entry exists but isn't a `T`-typed value, or
    /// `NoObjectFound` if the queue is empty.
    pub fn deserialize<T: Clone + 'static>(&self) -> Result<T> {
        match self.entries.front() {
            None => Err(Error::no_object_found("queue is empty")),
            Some(QueueEntry::Value { value, .. }) => value
                .as_any()
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(|| Error::invalid_type("front entry does not hold the requested type")),
            Some(other) => Err(Error::invalid_type(format!(
                "front entry is a {}, not a value",
                other.kind_name()
            ))),
        }
    }

    /// Same matching rules as `deserialize`, but removes the front entry on
    /// success.
    pub fn deserialize_pop<T: Clone + 'static>(&mut self) -> Result<T> {
        match self.entries.front() {
            None => return Err(Error::no_object_found("queue is empty")),
            Some(QueueEntry::Value { value, .. }) => {
                if value.as_any().downcast_ref::<T>().is_none() {
                    return Err(Error::invalid_type("front entry does not hold the requested type"));
                }
            }
            Some(other) => {
                return Err(Error::invalid_type(format!(
                    "front entry is a {}, not a value",
                    other.kind_name()
                )))
            }
        }
        match self.entries.pop_front() {
            Some(QueueEntry::Value { value, .. }) => Ok(value
                .as_any()
                .downcast_ref::<T>()
                .cloned()
                .expect("type already checked above")),
            _ => unreachable!("front entry kind was checked above"),
        }
    }

    /// The front entry's kind, and its `TypeId` if it's a value — checked
    /// before a caller commits to peeking or popping so a type mismatch
    /// (or a task/nested front entry) never triggers a destructive pop.
    pub fn front_kind(&self) -> Option<FrontKind> {
        match self.entries.front() {
            None => None,
            Some(QueueEntry::Value { type_id, .. }) => Some(FrontKind::Value(*type_id)),
            Some(QueueEntry::Task { .. }) => Some(FrontKind::Task),
            Some(QueueEntry::Nested { .. }) => Some(FrontKind::Nested),
        }
    }

    /// Kind-erased peek at the front value entry, used by the tree layer
    /// when it doesn't yet know the caller's expected `T` (that downcast
    /// happens one layer up, against the returned `TypeId`).
    pub fn peek_front_value(&self) -> Result<(TypeId, Box<dyn Encode>)> {
        match self.entries.front() {
            None => Err(Error::no_object_found("queue is empty")),
            Some(QueueEntry::Value { type_id, value, .. }) => Ok((*type_id, value.clone_box())),
            Some(other) => Err(Error::invalid_type(format!(
                "front entry is a {}, not a value",
                other.kind_name()
            ))),
        }
    }

    /// Kind-erased pop of the front value entry.
    pub fn pop_front_value(&mut self) -> Result<(TypeId, Box<dyn Encode>)> {
        match self.entries.front() {
            Some(QueueEntry::Value { .. }) => {}
            Some(other) => {
                return Err(Error::invalid_type(format!(
                    "front entry is a {}, not a value",
                    other.kind_name()
                )))
            }
            None => return Err(Error::no_object_found("queue is empty")),
        }
        match self.entries.pop_front() {
            Some(QueueEntry::Value { type_id, value, .. }) => Ok((type_id, value)),
            _ => unreachable!("front entry kind was checked above"),
        }
    }

    /// Clones the front entry's pending-task future without consuming it.
    pub fn peek_any_future(&self) -> Result<FutureAny> {
        match self.entries.front() {
            None => Err(Error::no_object_found("queue is empty")),
            Some(QueueEntry::Task { future, .. }) => Ok(future.clone()),
            Some(other) => Err(Error::invalid_type(format!(
                "front entry is a {}, not a task",
                other.kind_name()
            ))),
        }
    }

    /// Clones both the runnable handle and the future of the front task
    /// entry without removing it, so a caller can attempt `try_start` (a
    /// lazy task's first read triggers its execution) while leaving the
    /// slot available for subsequent readers.
    pub fn peek_front_task(&self) -> Result<(Arc<dyn Runnable>, FutureAny)> {
        match self.entries.front() {
            None => Err(Error::no_object_found("queue is empty")),
            Some(QueueEntry::Task { task, future }) => Ok((task.clone(), future.clone())),
            Some(other) => Err(Error::invalid_type(format!(
                "front entry is a {}, not a task",
                other.kind_name()
            ))),
        }
    }

    /// Pops the front task entry, returning its runnable handle so a
    /// caller can submit it to an executor (or run it inline for a lazy
    /// task) before handing back the future to whoever reads it.
    pub fn pop_front_task(&mut self) -> Result<(Arc<dyn Runnable>, FutureAny)> {
        match self.entries.front() {
            Some(QueueEntry::Task { .. }) => {}
            Some(other) => {
                return Err(Error::invalid_type(format!(
                    "front entry is a {}, not a task",
                    other.kind_name()
                )))
            }
            None => return Err(Error::no_object_found("queue is empty")),
        }
        match self.entries.pop_front() {
            Some(QueueEntry::Task { task, future }) => Ok((task, future)),
            _ => unreachable!("front entry kind was checked above"),
        }
    }

    fn nested_ids_in_order(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                QueueEntry::Nested { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Takes out a shared reference to the `index`-th live nested subspace
    /// (counting only `Nested` entries, front to back), incrementing its
    /// borrow count until the returned guard is dropped.
    pub fn borrow_nested_shared(&self, index: usize) -> Result<(Arc<dyn NestedSpace>, NestedBorrow)> {
        let id = self
            .nested_ids_in_order()
            .get(index)
            .copied()
            .ok_or_else(|| Error::no_such_path(format!("no nested subspace at index {}", index)))?;
        let space = self.entries.iter().find_map(|e| match e {
            QueueEntry::Nested { id: eid, space } if *eid == id => space.clone(),
            _ => None,
        });
        let space = space.ok_or_else(|| Error::no_object_found("nested slot was already taken"))?;
        let slot = self
            .borrows
            .get(&id)
            .expect("borrow slot always created alongside its entry")
            .clone();
        Ok((space, slot.acquire()))
    }

    /// Attempts to remove the `index`-th live nested subspace entry from
    /// the queue entirely. Returns `Ok(None)` if outstanding shared borrows
    /// are still live — callers poll this with backoff rather than
    /// blocking inside the queue itself, keeping this call non-blocking and
    /// safe to retry under the node's own payload lock.
    pub fn try_take_nested_at(&mut self, index: usize) -> Result<Option<Arc<dyn NestedSpace>>> {
        let id = self
            .nested_ids_in_order()
            .get(index)
            .copied()
            .ok_or_else(|| Error::no_such_path(format!("no nested subspace at index {}", index)))?;
        let idle = self.borrows.get(&id).map(|slot| slot.is_idle()).unwrap_or(true);
        if !idle {
            return Ok(None);
        }
        let pos = self
            .entries
            .iter()
            .position(|e| matches!(e, QueueEntry::Nested { id: eid, .. } if *eid == id))
            .expect("id came from this same queue's nested entries");
        let removed = self.entries.remove(pos).expect("position just located");
        self.borrows.remove(&id);
        match removed {
            QueueEntry::Nested { space, .. } => {
                space.ok_or_else(|| Error::no_object_found("nested slot was already taken"))
                    .map(Some)
            }
            _ => unreachable!("position matched a Nested entry"),
        }
    }

    /// Deposits a subspace into an existing, currently empty nested slot
    /// (used when adoption re-parents a space back into the tree it was
    /// momentarily taken out of).
    pub fn emplace_nested_at(&mut self, index: usize, space: Arc<dyn NestedSpace>) -> Result<()> {
        let id = self
            .nested_ids_in_order()
            .get(index)
            .copied()
            .ok_or_else(|| Error::no_such_path(format!("no nested subspace at index {}", index)))?;
        for entry in self.entries.iter_mut() {
            if let QueueEntry::Nested { id: eid, space: slot } = entry {
                if *eid == id {
                    *slot = Some(space);
                    return Ok(());
                }
            }
        }
        unreachable!("id came from this same queue's nested entries")
    }

    /// Invariant I-4: copying a node's payload keeps only `Value` entries.
    /// Nested subspaces and pending tasks are never duplicated by a copy —
    /// a copy observes data, not identity.
    pub fn copy_values_only(&self) -> NodeData {
        let mut out = NodeData::new();
        for entry in &self.entries {
            if let QueueEntry::Value { type_id, category, value } = entry {
                out.entries.push_back(QueueEntry::Value {
                    type_id: *type_id,
                    category: *category,
                    value: value.clone_box(),
                });
            }
        }
        out
    }

    /// Deep-copies this queue for `PathSpace::clone`: `Value` entries are
    /// cloned independently, `Nested` entries carry the *same* subspace
    /// handle forward (an opaque `dyn NestedSpace` cannot be cloned
    /// generically, so the copy aliases rather than duplicates it), and
    /// `Task` entries are dropped. Returns the copy plus
    /// (values, spaces, tasks_dropped) counts for the caller's `CopyStats`.
    pub fn deep_copy_counted(&self) -> (NodeData, u64, u64, u64) {
        let mut out = NodeData::new();
        let mut values = 0u64;
        let mut spaces = 0u64;
        let mut tasks = 0u64;
        for entry in &self.entries {
            match entry {
                QueueEntry::Value { type_id, category, value } => {
                    out.entries.push_back(QueueEntry::Value {
                        type_id: *type_id,
                        category: *category,
                        value: value.clone_box(),
                    });
                    values += 1;
                }
                QueueEntry::Nested { space: Some(space), .. } => {
                    out.push_nested(space.clone());
                    spaces += 1;
                }
                QueueEntry::Nested { space: None, .. } => {}
                QueueEntry::Task { .. } => {
                    tasks += 1;
                }
            }
        }
        (out, values, spaces, tasks)
    }

    /// Encodes the queue's current `Value` entries (front to back) into
    /// the versioned wire format. `Nested` and `Task` entries are
    /// represented as empty placeholders: neither a live subspace nor a
    /// running task's closure can be serialized, so a restored snapshot
    /// gets an empty slot at that position instead of silently vanishing
    /// from the FIFO order.
    pub fn serialize_snapshot(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            match entry {
                QueueEntry::Value { value, .. } => {
                    out.push(0u8);
                    out.push(value.type_tag().to_u8());
                    let bytes = value.encode();
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(&bytes);
                }
                QueueEntry::Nested { .. } => {
                    out.push(1u8);
                }
                QueueEntry::Task { .. } => {
                    out.push(2u8);
                }
            }
        }
        out
    }

    pub fn deserialize_snapshot(bytes: &[u8]) -> Result<NodeData> {
        let mut cursor = 0usize;
        let take = |cursor: &mut usize, n: usize| -> Result<&[u8]> {
            if *cursor + n > bytes.len() {
                return Err(Error::malformed_input("truncated snapshot"));
            }
            let slice = &bytes[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        };

        let version = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
        if version != SNAPSHOT_VERSION {
            return Err(Error::new(
                ErrorCode::MalformedInput,
                format!("unsupported snapshot version {}", version),
            ));
        }
        let count = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());

        let mut out = NodeData::new();
        for _ in 0..count {
            let kind = take(&mut cursor, 1)?[0];
            match kind {
                0 => {
                    let tag = TypeTag::from_u8(take(&mut cursor, 1)?[0])?;
                    let len = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
                    let raw = take(&mut cursor, len)?;
                    let value = decode_tagged(tag, raw)?;
                    let type_id = match tag {
                        TypeTag::I32 => TypeId::of::<i32>(),
                        TypeTag::I64 => TypeId::of::<i64>(),
                        TypeTag::U32 => TypeId::of::<u32>(),
                        TypeTag::U64 => TypeId::of::<u64>(),
                        TypeTag::F64 => TypeId::of::<f64>(),
                        TypeTag::Bool => TypeId::of::<bool>(),
                        TypeTag::Str => TypeId::of::<String>(),
                        TypeTag::Bytes => TypeId::of::<Vec<u8>>(),
                    };
                    out.entries.push_back(QueueEntry::Value {
                        type_id,
                        category: DataCategory::Fundamental,
                        value,
                    });
                }
                1 => {
                    let id = out.next_nested_id;
                    out.next_nested_id += 1;
                    out.borrows.insert(id, BorrowSlot::new());
                    out.entries.push_back(QueueEntry::Nested { id, space: None });
                    warn!("snapshot restored an empty nested slot; the mounted subspace itself is not persisted");
                }
                2 => {
                    warn!("snapshot dropped a pending task entry; task bodies are not persisted");
                }
                other => return Err(Error::malformed_input(format!("unknown queue entry kind {}", other))),
            }
        }
        Ok(out)
    }
}

impl Default for NodeData {
    fn default() -> Self {
        NodeData::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathspace_core::{NotificationSink, Runnable};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Weak;

    struct NoopRunnable {
        ran: AtomicBool,
    }
    impl Runnable for NoopRunnable {
        fn try_start(&self) -> bool {
            !self.ran.swap(true, Ordering::SeqCst)
        }
        fn run(&self) {}
    }

    struct FakeNested;
    impl NestedSpace for FakeNested {
        fn insert_raw(
            &self,
            _path: &str,
            _payload: Box<dyn std::any::Any + Send + Sync>,
            _options: &pathspace_core::InsertOptions,
        ) -> Result<()> {
            Ok(())
        }
        fn out_raw(
            &self,
            _path: &str,
            _pop: bool,
            _options: &pathspace_core::ReadOptions,
            _expected_type: Option<std::any::TypeId>,
        ) -> Result<Box<dyn std::any::Any + Send + Sync>> {
            Err(Error::no_object_found("empty"))
        }
        fn future_at(&self, _path: &str) -> Result<FutureAny> {
            Err(Error::no_object_found("empty"))
        }
        fn notify(&self, _path: &str) {}
        fn shutdown(&self) {}
        fn adopt(&self, _mount_prefix: String, _sink: Weak<dyn NotificationSink>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn front_only_matching_distinguishes_type_and_emptiness() {
        let mut q = NodeData::new();
        assert!(q.deserialize::<i32>().unwrap_err().is_empty_queue());
        q.push_value(DataCategory::Fundamental, 42i32);
        assert_eq!(q.deserialize::<i32>().unwrap(), 42);
        let err = q.deserialize::<String>().unwrap_err();
        assert_eq!(err.code, pathspace_core::ErrorCode::InvalidType);
    }

    #[test]
    fn pop_removes_only_the_front_entry() {
        let mut q = NodeData::new();
        q.push_value(DataCategory::Fundamental, 1i32);
        q.push_value(DataCategory::Fundamental, 2i32);
        assert_eq!(q.deserialize_pop::<i32>().unwrap(), 1);
        assert_eq!(q.deserialize_pop::<i32>().unwrap(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn queue_interleaves_heterogeneous_entries_in_fifo_order() {
        let mut q = NodeData::new();
        q.push_value(DataCategory::Fundamental, 1i32);
        q.push_nested(Arc::new(FakeNested));
        let runnable: Arc<dyn Runnable> = Arc::new(NoopRunnable { ran: AtomicBool::new(false) });
        let (_promise, future) = pathspace_future::channel::<i32>();
        q.push_task(runnable, FutureAny::new(future));
        q.push_value(DataCategory::Fundamental, 2i32);
        assert_eq!(q.type_summary(), vec!["value", "nested", "task", "value"]);
        assert_eq!(q.value_count(), 2);
        assert_eq!(q.nested_count(), 1);
        assert_eq!(q.task_count(), 1);
    }

    #[test]
    fn borrow_blocks_take_until_released() {
        let mut q = NodeData::new();
        q.push_nested(Arc::new(FakeNested));
        let (_space, guard) = q.borrow_nested_shared(0).unwrap();
        assert!(q.try_take_nested_at(0).unwrap().is_none());
        drop(guard);
        assert!(q.try_take_nested_at(0).unwrap().is_some());
    }

    #[test]
    fn copy_values_only_drops_nested_and_task_entries() {
        let mut q = NodeData::new();
        q.push_value(DataCategory::Fundamental, 7i32);
        q.push_nested(Arc::new(FakeNested));
        let runnable: Arc<dyn Runnable> = Arc::new(NoopRunnable { ran: AtomicBool::new(false) });
        let (_promise, future) = pathspace_future::channel::<i32>();
        q.push_task(runnable, FutureAny::new(future));

        let copy = q.copy_values_only();
        assert_eq!(copy.type_summary(), vec!["value"]);
        assert_eq!(copy.deserialize::<i32>().unwrap(), 7);
    }

    #[test]
    fn snapshot_round_trips_value_entries_and_preserves_fifo_shape() {
        let mut q = NodeData::new();
        q.push_value(DataCategory::Fundamental, 10i32);
        q.push_nested(Arc::new(FakeNested));
        q.push_value(DataCategory::Fundamental, "hi".to_string());

        let bytes = q.serialize_snapshot();
        let restored = NodeData::deserialize_snapshot(&bytes).unwrap();
        assert_eq!(restored.type_summary(), vec!["value", "nested", "value"]);
        assert_eq!(restored.deserialize::<i32>().unwrap(), 10);
    }

    #[test]
    fn truncated_snapshot_is_malformed_input() {
        let bytes = vec![2, 0, 0, 0, 1, 0, 0, 0];
        let err = NodeData::deserialize_snapshot(&bytes).unwrap_err();
        assert_eq!(err.code, pathspace_core::ErrorCode::MalformedInput);
    }
}
