// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The tree itself: a concurrent map of children per node, routing inserts
//! and single-shot reads to the right node along a path. The blocking
//! retry loop, deadline clamping, and wait-registry integration live one
//! layer up in the facade; this module only ever makes one attempt.

use std::any::TypeId;
use std::sync::Arc;

use fnv::FnvHashMap;
use log::trace;
use parking_lot::Mutex;

use pathspace_core::{is_glob, DataCategory, Error, ErrorCode, InsertOptions, PathIterator, Result, Runnable};
use pathspace_future::FutureAny;

use crate::encode::Encode;
use crate::nested::NestedSpace;
use crate::queue::{FrontKind, NodeData};

/// What `insert` places at the final node: a plain value, a nested
/// subspace, or a pending execution task.
pub enum Payload {
    Value(TypeId, DataCategory, Box<dyn Encode>),
    Nested(Arc<dyn NestedSpace>),
    Task(Arc<dyn Runnable>, FutureAny),
}

/// What `out` recovers from the front of a matched node's queue, or from a
/// nested subspace a path was forwarded into.
pub enum Extracted {
    Value(TypeId, Box<dyn Encode>),
    TaskFuture(Arc<dyn Runnable>, FutureAny),
    TaskPopped(Arc<dyn Runnable>, FutureAny),
    Forwarded(Box<dyn std::any::Any + Send + Sync>),
}

/// A single tree vertex: a children map and a payload queue, each under
/// their own lock so a reader of this node's data never blocks a sibling
/// lookup walking through the children map.
pub struct Node {
    children: Mutex<FnvHashMap<String, Arc<Node>>>,
    data: Mutex<NodeData>,
}

impl Node {
    fn new() -> Arc<Node> {
        Arc::new(Node {
            children: Mutex::new(FnvHashMap::default()),
            data: Mutex::new(NodeData::new()),
        })
    }

    fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.lock().get(name).cloned()
    }

    fn get_or_create_child(&self, name: &str) -> Arc<Node> {
        self.children
            .lock()
            .entry(name.to_string())
            .or_insert_with(Node::new)
            .clone()
    }

    fn matching_children(&self, pattern: &str) -> Vec<(String, Arc<Node>)> {
        let children = self.children.lock();
        let mut matches: Vec<(String, Arc<Node>)> = children
            .iter()
            .filter(|(name, _)| match_glob_component(pattern, name))
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches
    }

    /// Invariant I-1: blocked exactly when this node has no children of
    /// its own, no nested subspace, and at least one plain value queued.
    fn is_data_only_leaf(&self) -> bool {
        let has_children = !self.children.lock().is_empty();
        if has_children {
            return false;
        }
        let data = self.data.lock();
        data.nested_count() == 0 && data.value_count() > 0
    }

    fn has_nested(&self) -> bool {
        self.data.lock().nested_count() > 0
    }

    fn has_values(&self) -> bool {
        self.data.lock().value_count() > 0
    }

    fn sorted_children(&self) -> Vec<(String, Arc<Node>)> {
        let mut children: Vec<(String, Arc<Node>)> =
            self.children.lock().iter().map(|(n, c)| (n.clone(), c.clone())).collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    /// Deep-copies this node and every descendant, for `PathSpace::clone`.
    /// Returns the copy plus running (values, spaces, tasks_dropped) tallies.
    fn deep_copy(&self) -> (Arc<Node>, u64, u64, u64) {
        let (data_copy, mut values, mut spaces, mut tasks) = self.data.lock().deep_copy_counted();
        let copy = Arc::new(Node {
            children: Mutex::new(FnvHashMap::default()),
            data: Mutex::new(data_copy),
        });
        for (name, child) in self.children.lock().iter() {
            let (child_copy, cv, cs, ct) = child.deep_copy();
            values += cv;
            spaces += cs;
            tasks += ct;
            copy.children.lock().insert(name.clone(), child_copy);
        }
        (copy, values, spaces, tasks)
    }

    /// Pins slot 0's nested subspace for the duration of the returned
    /// guard — held by the caller across the forwarded `in`/`out` call so
    /// a concurrent `take_nested_at` cannot observe the slot as idle while
    /// this node is mid-forward.
    fn first_live_nested(&self) -> Option<(Arc<dyn NestedSpace>, crate::queue::NestedBorrow)> {
        let data = self.data.lock();
        if data.nested_count() == 0 {
            return None;
        }
        data.borrow_nested_shared(0).ok()
    }
}

fn match_glob_component(pattern: &str, name: &str) -> bool {
    if is_glob(pattern) {
        pathspace_core::match_names(pattern, name)
    } else {
        pattern == name
    }
}

/// The root handle of a tree. Children map lookups and payload-queue
/// mutations are routed through `Node`; `Tree` only owns the root and
/// exposes the two single-shot entry points insert/out describes in
/// terms of.
pub struct Tree {
    root: Arc<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Tree { root: Node::new() }
    }

    pub fn insert(&self, path: &str, payload: Payload, options: &InsertOptions) -> pathspace_core::InsertReturn {
        let mut ret = pathspace_core::InsertReturn::new();
        let mut iter = PathIterator::new(path);
        if iter.is_empty() {
            ret.errors.push(Error::invalid_path("path has no components"));
            return ret;
        }
        insert_at(&self.root, &mut iter, payload, options, &mut ret);
        ret
    }

    /// Single-shot read or pop. Never blocks; the facade retries this on a
    /// timed loop when `doBlock` is requested. `expected_type`, when given,
    /// is checked against a candidate child's front value entry *before*
    /// that child is committed to — both for a final glob (so a read skips
    /// past a wrong-typed child instead of stopping on it) and for a plain
    /// path (so a destructive pop never removes an entry of the wrong
    /// type: the check and the pop happen under the same node-data lock).
    pub fn out(&self, path: &str, pop: bool, expected_type: Option<TypeId>) -> Result<Extracted> {
        let mut iter = PathIterator::new(path);
        if iter.is_empty() {
            return Err(Error::invalid_path("path has no components"));
        }
        out_at(&self.root, &mut iter, pop, expected_type)
    }

    /// Names of the immediate children of the node at `path` (`"/"` for the
    /// root), lexicographically sorted.
    pub fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let node = self.find_node(path)?;
        Ok(node.sorted_children().into_iter().map(|(name, _)| name).collect())
    }

    fn find_node(&self, path: &str) -> Result<Arc<Node>> {
        let mut iter = PathIterator::new(path);
        if iter.is_empty() {
            return Ok(self.root.clone());
        }
        find_node_at(&self.root, &mut iter)
    }

    /// DFS from the node at `root`, reporting each visited path to
    /// `on_path` (depth-first, children visited in lexicographic order).
    /// `on_path` returning `false` stops the traversal early. A node whose
    /// only content is a nested subspace is skipped when `include_nested`
    /// is false; a node whose only content is plain values is skipped when
    /// `include_values` is false. Nested subspaces are reported as opaque
    /// mount points — `Tree` has no way to see inside one.
    pub fn visit(
        &self,
        root: &str,
        max_depth: Option<usize>,
        max_children: Option<usize>,
        include_nested: bool,
        include_values: bool,
        on_path: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        let node = self.find_node(root)?;
        let base = match root {
            "" | "/" => String::new(),
            other => other.trim_end_matches('/').to_string(),
        };
        visit_node(&node, &base, 0, max_depth, max_children, include_nested, include_values, on_path);
        Ok(())
    }

    /// Deep copy of the whole tree: values are cloned, nested subspaces
    /// are carried forward by reference (Invariant I-4 applies to
    /// `NodeData`'s own copy constructor; an opaque nested handle can't be
    /// cloned any more deeply than that), tasks are dropped. Returns the
    /// copy plus (values_copied, spaces_copied, tasks_dropped).
    pub fn deep_copy(&self) -> (Tree, (u64, u64, u64)) {
        let (root, values, spaces, tasks) = self.root.deep_copy();
        (Tree { root }, (values, spaces, tasks))
    }
}

fn find_node_at(node: &Arc<Node>, iter: &mut PathIterator) -> Result<Arc<Node>> {
    let name = match iter.component() {
        Some(n) => n,
        None => return Ok(node.clone()),
    };
    if is_glob(name) {
        return Err(Error::invalid_path_subcomponent("path must be concrete here"));
    }
    let child = node
        .child(name)
        .ok_or_else(|| Error::no_such_path(format!("no child named {:?}", name)))?;
    if iter.is_at_final_component() {
        return Ok(child);
    }
    let mut sub_iter = iter.clone();
    sub_iter.next();
    find_node_at(&child, &mut sub_iter)
}

#[allow(clippy::too_many_arguments)]
fn visit_node(
    node: &Arc<Node>,
    path: &str,
    depth: usize,
    max_depth: Option<usize>,
    max_children: Option<usize>,
    include_nested: bool,
    include_values: bool,
    on_path: &mut dyn FnMut(&str) -> bool,
) -> bool {
    let has_nested = node.has_nested();
    let has_values = node.has_values();
    let excluded = (has_nested && !include_nested) || (has_values && !include_values && !has_nested);
    if !excluded {
        let display = if path.is_empty() { "/" } else { path };
        if !on_path(display) {
            return false;
        }
    }
    if max_depth.map_or(false, |limit| depth >= limit) {
        return true;
    }
    let mut children = node.sorted_children();
    if let Some(limit) = max_children {
        children.truncate(limit);
    }
    for (name, child) in children {
        let child_path = format!("{}/{}", path, name);
        if !visit_node(&child, &child_path, depth + 1, max_depth, max_children, include_nested, include_values, on_path) {
            return false;
        }
    }
    true
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

fn insert_at(
    node: &Arc<Node>,
    iter: &mut PathIterator,
    payload: Payload,
    options: &InsertOptions,
    ret: &mut pathspace_core::InsertReturn,
) {
    let name = match iter.component() {
        Some(n) => n,
        None => return,
    };

    if iter.is_at_final_component() {
        if is_glob(name) {
            insert_final_glob(node, name, payload, ret);
        } else {
            insert_final_concrete(node, name, payload, ret);
        }
        return;
    }

    if is_glob(name) {
        for (_child_name, child) in node.matching_children(name) {
            if let Some((nested, _guard)) = child.first_live_nested() {
                forward_nested_insert(&nested, iter, &payload, options, ret);
                continue;
            }
            if child.is_data_only_leaf() {
                continue;
            }
            let mut sub_iter = iter.clone();
            sub_iter.next();
            insert_at(&child, &mut sub_iter, clone_payload_for_fanout(&payload), options, ret);
        }
    } else {
        let existing = node.child(name);
        if let Some(child) = existing {
            if let Some((nested, _guard)) = child.first_live_nested() {
                forward_nested_insert(&nested, iter, &payload, options, ret);
                return;
            }
            if child.is_data_only_leaf() {
                trace!("insert blocked at data-only leaf {:?}", name);
                return;
            }
            let mut sub_iter = iter.clone();
            sub_iter.next();
            insert_at(&child, &mut sub_iter, payload, options, ret);
        } else {
            let child = node.get_or_create_child(name);
            let mut sub_iter = iter.clone();
            sub_iter.next();
            insert_at(&child, &mut sub_iter, payload, options, ret);
        }
    }
}

/// Glob fan-out at an intermediate component re-submits the identical
/// payload into each matching branch; a task or nested payload addressed
/// through an intermediate glob degrades to whichever branch reaches its
/// final component first, since only one of them can actually own it.
fn clone_payload_for_fanout(payload: &Payload) -> Payload {
    match payload {
        Payload::Value(type_id, category, value) => Payload::Value(*type_id, *category, value.clone_box()),
        Payload::Nested(space) => Payload::Nested(space.clone()),
        Payload::Task(task, future) => Payload::Task(task.clone(), future.clone()),
    }
}

fn insert_final_glob(node: &Arc<Node>, pattern: &str, payload: Payload, ret: &mut pathspace_core::InsertReturn) {
    if matches!(payload, Payload::Nested(_)) {
        ret.errors
            .push(Error::invalid_type("cannot insert a nested subspace through a glob destination"));
        return;
    }
    for (_name, child) in node.matching_children(pattern) {
        apply_payload(&child, clone_payload_for_fanout(&payload), ret);
    }
}

fn insert_final_concrete(node: &Arc<Node>, name: &str, payload: Payload, ret: &mut pathspace_core::InsertReturn) {
    let child = node.get_or_create_child(name);
    apply_payload(&child, payload, ret);
}

fn apply_payload(child: &Arc<Node>, payload: Payload, ret: &mut pathspace_core::InsertReturn) {
    match payload {
        Payload::Value(type_id, category, value) => {
            child.data.lock().push_value_boxed(type_id, category, value);
            ret.values_inserted += 1;
        }
        Payload::Nested(space) => {
            if child.has_nested() {
                ret.errors.push(Error::new(
                    ErrorCode::CapabilityMismatch,
                    "node already owns a live nested subspace",
                ));
                return;
            }
            child.data.lock().push_nested(space);
            ret.spaces_inserted += 1;
        }
        Payload::Task(task, future) => {
            child.data.lock().push_task(task, future);
            ret.tasks_inserted += 1;
        }
    }
}

fn forward_nested_insert(
    nested: &Arc<dyn NestedSpace>,
    iter: &PathIterator,
    payload: &Payload,
    options: &InsertOptions,
    ret: &mut pathspace_core::InsertReturn,
) {
    let suffix = iter.current_to_end();
    let boxed: Box<dyn std::any::Any + Send + Sync> = match payload {
        Payload::Value(_, _, value) => Box::new(value.clone_box()),
        Payload::Nested(space) => Box::new(space.clone()),
        Payload::Task(task, future) => Box::new((task.clone(), future.clone())),
    };
    match nested.insert_raw(suffix, boxed, options) {
        Ok(()) => ret.values_inserted += 1,
        Err(e) => ret.errors.push(e),
    }
}

fn out_at(node: &Arc<Node>, iter: &mut PathIterator, pop: bool, expected_type: Option<TypeId>) -> Result<Extracted> {
    let name = match iter.component() {
        Some(n) => n,
        None => return Err(Error::invalid_path("path has no components")),
    };

    if iter.is_at_final_component() {
        if is_glob(name) {
            return out_final_glob(node, name, pop, expected_type);
        }
        return out_final_concrete(node, name, pop, expected_type);
    }

    if is_glob(name) {
        return Err(Error::no_such_path("glob components are not allowed mid-path on read"));
    }

    let child = node
        .child(name)
        .ok_or_else(|| Error::no_such_path(format!("no child named {:?}", name)))?;

    if let Some((nested, _guard)) = child.first_live_nested() {
        let mut sub_iter = iter.clone();
        sub_iter.next();
        let suffix = sub_iter.current_to_end();
        let read_opts = pathspace_core::ReadOptions::non_blocking();
        return nested.out_raw(suffix, pop, &read_opts, expected_type).map(Extracted::Forwarded);
    }

    if child.is_data_only_leaf() {
        return Err(Error::invalid_path_subcomponent(format!(
            "{:?} is a data leaf and cannot be descended into",
            name
        )));
    }

    let mut sub_iter = iter.clone();
    sub_iter.next();
    out_at(&child, &mut sub_iter, pop, expected_type)
}

/// Final-glob read: tries each matching child, front to back in
/// lexicographic order, and commits to the **first** whose front entry
/// actually matches `expected_type` — a child whose front entry is data of
/// some other type is skipped, never mistaken for a match (spec: "return
/// on the first child whose front entry matches the requested type").
fn out_final_glob(node: &Arc<Node>, pattern: &str, pop: bool, expected_type: Option<TypeId>) -> Result<Extracted> {
    let matches = node.matching_children(pattern);
    let mut saw_data = false;
    for (_name, child) in matches {
        match extract_front(&child, pop, expected_type) {
            Ok(extracted) => return Ok(extracted),
            Err(e) if e.is_empty_queue() => continue,
            Err(e) => {
                if e.code == ErrorCode::InvalidType {
                    saw_data = true;
                    continue;
                }
                return Err(e);
            }
        }
    }
    if saw_data {
        Err(Error::invalid_type("no matching child's front entry had the requested type"))
    } else {
        Err(Error::no_such_path(format!("no child matched {:?}", pattern)))
    }
}

fn out_final_concrete(node: &Arc<Node>, name: &str, pop: bool, expected_type: Option<TypeId>) -> Result<Extracted> {
    let child = node
        .child(name)
        .ok_or_else(|| Error::no_such_path(format!("no child named {:?}", name)))?;
    extract_front(&child, pop, expected_type)
}

/// Checks the front entry's kind (and, for a value, its `TypeId` against
/// `expected_type`) and only then peeks or pops it — all under the one
/// `data` lock acquired here, so a concurrent writer can never slip a
/// different entry in between the check and the pop, and a pop can never
/// destroy an entry whose type didn't actually match. A `Nested` front
/// entry (there can be at most one live one, per Invariant I-2) is never
/// a valid target for `out` and falls through to `InvalidType`. A `Task`
/// front entry is only ever returned when `expected_type` is `None` — a
/// caller that asked for a specific value type never wants its pop to
/// consume (and thereby destroy) a pending task instead.
fn extract_front(child: &Arc<Node>, pop: bool, expected_type: Option<TypeId>) -> Result<Extracted> {
    let mut data = child.data.lock();
    let kind = match data.front_kind() {
        Some(kind) => kind,
        None => return Err(Error::no_such_path("node holds no data")),
    };
    match kind {
        FrontKind::Value(type_id) => {
            if let Some(expected) = expected_type {
                if type_id != expected {
                    return Err(Error::invalid_type("front entry does not hold the requested type"));
                }
            }
            if pop {
                data.pop_front_value().map(|(type_id, value)| Extracted::Value(type_id, value))
            } else {
                data.peek_front_value().map(|(type_id, value)| Extracted::Value(type_id, value))
            }
        }
        FrontKind::Task if expected_type.is_some() => {
            Err(Error::invalid_type("front entry is a pending task, not the requested value type"))
        }
        FrontKind::Task => {
            if pop {
                data.pop_front_task().map(|(task, future)| Extracted::TaskPopped(task, future))
            } else {
                data.peek_front_task().map(|(task, future)| Extracted::TaskFuture(task, future))
            }
        }
        FrontKind::Nested => Err(Error::invalid_type("front entry is a nested subspace, not readable data")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(tree: &Tree, path: &str, type_id: TypeId, value: Box<dyn Encode>) {
        let payload = Payload::Value(type_id, DataCategory::Fundamental, value);
        let ret = tree.insert(path, payload, &InsertOptions::default());
        assert!(ret.errors.is_empty(), "insert at {:?} failed: {:?}", path, ret.errors);
    }

    #[test]
    fn glob_read_skips_children_whose_front_entry_is_the_wrong_type() {
        let tree = Tree::new();
        put(&tree, "/x/a", TypeId::of::<i32>(), Box::new(7i32));
        put(&tree, "/x/b", TypeId::of::<String>(), Box::new("hi".to_string()));

        match tree.out("/x/*", false, Some(TypeId::of::<String>())) {
            Ok(Extracted::Value(type_id, value)) => {
                assert_eq!(type_id, TypeId::of::<String>());
                let s = value.as_any().downcast_ref::<String>().unwrap();
                assert_eq!(s, "hi");
            }
            other => panic!("expected the String-typed child, got {:?}", other.err()),
        }
    }

    #[test]
    fn glob_read_with_no_matching_type_reports_invalid_type_not_the_first_child() {
        let tree = Tree::new();
        put(&tree, "/y/a", TypeId::of::<i32>(), Box::new(7i32));
        put(&tree, "/y/b", TypeId::of::<i32>(), Box::new(8i32));

        let err = tree.out("/y/*", false, Some(TypeId::of::<String>())).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidType);
    }

    #[test]
    fn typed_pop_never_destroys_a_wrong_typed_entry() {
        let tree = Tree::new();
        put(&tree, "/z/a", TypeId::of::<i32>(), Box::new(7i32));

        let err = tree.out("/z/a", true, Some(TypeId::of::<String>())).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidType);

        match tree.out("/z/a", true, Some(TypeId::of::<i32>())).unwrap() {
            Extracted::Value(type_id, value) => {
                assert_eq!(type_id, TypeId::of::<i32>());
                assert_eq!(*value.as_any().downcast_ref::<i32>().unwrap(), 7);
            }
            other => panic!("expected the untouched i32 entry, got {:?}", other.err()),
        }
    }

    #[test]
    fn list_children_reports_every_inserted_sibling_regardless_of_insertion_order() {
        let _ = env_logger::try_init();
        let tree = Tree::new();
        put(&tree, "/w/banana", TypeId::of::<i32>(), Box::new(1i32));
        put(&tree, "/w/apple", TypeId::of::<i32>(), Box::new(2i32));
        put(&tree, "/w/cherry", TypeId::of::<i32>(), Box::new(3i32));

        let names: std::collections::HashSet<String> = tree.list_children("/w").unwrap().into_iter().collect();
        assert_eq!(names, maplit::hashset! { "apple".to_string(), "banana".to_string(), "cherry".to_string() });
    }
}
