// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A fan-in layer: reads at an enabled output path are served from a list
//! of source paths in a backing space instead of the output path's own
//! queue. Configured at runtime through two control paths,
//! `/_system/trellis/enable` and `/_system/trellis/disable`, each carrying
//! a structured command rather than a plain value.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use pathspace_core::{
    validate_path, Error, ErrorCode, InsertOptions, InsertReturn, NotificationSink, ReadOptions, Result, ValidationLevel,
};
use pathspace_future::FutureAny;
use pathspace_tree::NestedSpace;

use crate::base::{Children, PathSpaceBase, PathVisitor, VisitOptions};

const ENABLE_PATH: &str = "/_system/trellis/enable";
const DISABLE_PATH: &str = "/_system/trellis/disable";
const RESERVED_STATE_PREFIX: &str = "/_system/trellis/state";

/// How sources are consumed for an enabled output path. `Latest` from the
/// original design is parsed and rejected with `NotSupported` rather than
/// represented here, so every `TrellisState` that exists is a queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrellisMode {
    Queue,
}

/// Which source a queue-mode read tries first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrellisPolicy {
    /// Starts from wherever the last successful read left off and wraps.
    RoundRobin,
    /// Always starts from the first source in list order.
    Priority,
}

/// The payload `/_system/trellis/enable` expects.
#[derive(Clone, Debug)]
pub struct EnableTrellisCommand {
    pub name: String,
    pub sources: Vec<String>,
    pub mode: String,
    pub policy: String,
}

/// The payload `/_system/trellis/disable` expects.
#[derive(Clone, Debug)]
pub struct DisableTrellisCommand {
    pub name: String,
}

struct TrellisState {
    mode: TrellisMode,
    policy: TrellisPolicy,
    sources: Vec<String>,
    round_robin_cursor: AtomicUsize,
    shutting_down: AtomicBool,
}

pub struct PathSpaceTrellis {
    backing: Arc<dyn PathSpaceBase>,
    mount_prefix: Mutex<String>,
    sink: Mutex<Option<Weak<dyn NotificationSink>>>,
    states: Mutex<FnvHashMap<String, Arc<TrellisState>>>,
}

impl PathSpaceTrellis {
    pub fn new(backing: Arc<dyn PathSpaceBase>) -> Arc<PathSpaceTrellis> {
        Arc::new(PathSpaceTrellis {
            backing,
            mount_prefix: Mutex::new(String::new()),
            sink: Mutex::new(None),
            states: Mutex::new(FnvHashMap::default()),
        })
    }

    fn notify_local(&self, path: &str) {
        if let Some(sink) = self.sink.lock().as_ref().and_then(Weak::upgrade) {
            sink.notify(path);
        }
    }

    fn canonicalize(path: &str) -> Result<String> {
        validate_path(path, ValidationLevel::Full)?;
        Ok(path.to_string())
    }

    fn canonicalize_sources(sources: &[String]) -> Result<Vec<String>> {
        if sources.is_empty() {
            return Err(Error::malformed_input("source list must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        let mut canonical = Vec::with_capacity(sources.len());
        for raw in sources {
            let entry = Self::canonicalize(raw)?;
            if !seen.insert(entry.clone()) {
                return Err(Error::malformed_input("source list must not contain duplicate entries"));
            }
            canonical.push(entry);
        }
        Ok(canonical)
    }

    fn handle_enable(&self, command: &EnableTrellisCommand) -> InsertReturn {
        let mut ret = InsertReturn::new();
        match self.parse_enable(command) {
            Ok((output_path, state)) => {
                let mut states = self.states.lock();
                if states.contains_key(&output_path) {
                    ret.errors.push(Error::invalid_path("trellis already enabled for path"));
                    return ret;
                }
                states.insert(output_path.clone(), Arc::new(state));
                drop(states);
                self.notify_local(&output_path);
            }
            Err(e) => ret.errors.push(e),
        }
        ret
    }

    fn parse_enable(&self, command: &EnableTrellisCommand) -> Result<(String, TrellisState)> {
        let output_path = Self::canonicalize(&command.name)?;
        if output_path.starts_with(RESERVED_STATE_PREFIX) {
            return Err(Error::invalid_path("output path is reserved for trellis state"));
        }
        let sources = Self::canonicalize_sources(&command.sources)?;
        if sources.iter().any(|s| s == &output_path) {
            return Err(Error::invalid_path("output path cannot also be used as a source"));
        }

        let mode = match command.mode.to_lowercase().as_str() {
            "queue" => TrellisMode::Queue,
            "latest" => return Err(Error::not_supported("latest mode is not yet supported")),
            other => return Err(Error::malformed_input(format!("unsupported trellis mode: {}", other))),
        };
        let policy = match command.policy.to_lowercase().as_str() {
            "round_robin" => TrellisPolicy::RoundRobin,
            "priority" => TrellisPolicy::Priority,
            other => return Err(Error::malformed_input(format!("unsupported trellis policy: {}", other))),
        };

        Ok((
            output_path,
            TrellisState {
                mode,
                policy,
                sources,
                round_robin_cursor: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
            },
        ))
    }

    fn handle_disable(&self, command: &DisableTrellisCommand) -> InsertReturn {
        let mut ret = InsertReturn::new();
        let canonical = match Self::canonicalize(&command.name) {
            Ok(p) => p,
            Err(e) => {
                ret.errors.push(e);
                return ret;
            }
        };
        let removed = self.states.lock().remove(&canonical);
        match removed {
            Some(state) => {
                state.shutting_down.store(true, Ordering::SeqCst);
                self.notify_local(&canonical);
            }
            None => ret.errors.push(Error::new(ErrorCode::NotFound, "trellis not found for path")),
        }
        ret
    }

    /// One non-blocking pass over `state`'s sources, starting from the
    /// round-robin cursor (queue mode) or always from the front (priority),
    /// advancing the cursor only on a successful read.
    fn try_serve_queue(&self, state: &TrellisState, pop: bool, expected_type: Option<TypeId>) -> Result<Box<dyn Any + Send + Sync>> {
        if state.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::timeout("trellis is shutting down"));
        }
        if state.sources.is_empty() {
            return Err(Error::new(ErrorCode::NotFound, "no sources configured"));
        }
        let start = match state.policy {
            TrellisPolicy::RoundRobin => state.round_robin_cursor.load(Ordering::SeqCst) % state.sources.len(),
            TrellisPolicy::Priority => 0,
        };
        let attempt = ReadOptions::non_blocking();
        let mut last_error = None;
        for offset in 0..state.sources.len() {
            let index = (start + offset) % state.sources.len();
            match self.backing.out_raw(&state.sources[index], pop, &attempt, expected_type) {
                Ok(value) => {
                    if state.policy == TrellisPolicy::RoundRobin {
                        state.round_robin_cursor.store((index + 1) % state.sources.len(), Ordering::SeqCst);
                    }
                    return Ok(value);
                }
                Err(e) if is_empty_source_error(&e) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::new(ErrorCode::NoObjectFound, "no data available in sources")))
    }
}

fn is_empty_source_error(e: &Error) -> bool {
    matches!(e.code, ErrorCode::NoObjectFound | ErrorCode::NotFound | ErrorCode::NoSuchPath)
}

impl PathSpaceBase for PathSpaceTrellis {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> InsertReturn {
        if path == ENABLE_PATH {
            return match payload.downcast::<EnableTrellisCommand>() {
                Ok(command) => self.handle_enable(&command),
                Err(_) => {
                    let mut ret = InsertReturn::new();
                    ret.errors.push(Error::invalid_type("enable trellis command requires an EnableTrellisCommand payload"));
                    ret
                }
            };
        }
        if path == DISABLE_PATH {
            return match payload.downcast::<DisableTrellisCommand>() {
                Ok(command) => self.handle_disable(&command),
                Err(_) => {
                    let mut ret = InsertReturn::new();
                    ret.errors.push(Error::invalid_type("disable trellis command requires a DisableTrellisCommand payload"));
                    ret
                }
            };
        }
        self.backing.insert_raw(path, payload, options)
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        let canonical = Self::canonicalize(path)?;
        let state = self.states.lock().get(&canonical).cloned();
        let state = match state {
            Some(state) => state,
            None => return self.backing.out_raw(path, pop, options, expected_type),
        };

        match self.try_serve_queue(&state, pop, expected_type) {
            Ok(value) => Ok(value),
            Err(e) => {
                if !options.do_block {
                    return Err(e);
                }
                self.wait_and_serve_queue(&state, pop, options, expected_type)
            }
        }
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        self.backing.future_at(path)
    }

    fn notify(&self, path: &str) {
        self.notify_local(path);
        self.backing.notify(path);
    }

    fn shutdown(&self) {
        let snapshot: Vec<Arc<TrellisState>> = {
            let mut states = self.states.lock();
            let values = states.values().cloned().collect();
            states.clear();
            values
        };
        for state in snapshot {
            state.shutting_down.store(true, Ordering::SeqCst);
        }
        self.backing.shutdown();
    }

    fn visit(&self, visitor: &mut PathVisitor, options: &VisitOptions) -> Result<()> {
        self.backing.visit(visitor, options)
    }

    fn adopt_context_and_prefix(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        *self.mount_prefix.lock() = mount_prefix;
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn list_children(&self, path: &str) -> Result<Children> {
        self.backing.list_children(path)
    }
}

impl NestedSpace for PathSpaceTrellis {
    fn insert_raw(&self, path: &str, payload: Box<dyn Any + Send + Sync>, options: &InsertOptions) -> Result<()> {
        match PathSpaceBase::insert_raw(self, path, payload, options).errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn out_raw(
        &self,
        path: &str,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        PathSpaceBase::out_raw(self, path, pop, options, expected_type)
    }

    fn future_at(&self, path: &str) -> Result<FutureAny> {
        PathSpaceBase::future_at(self, path)
    }

    fn notify(&self, path: &str) {
        PathSpaceBase::notify(self, path)
    }

    fn shutdown(&self) {
        PathSpaceBase::shutdown(self)
    }

    fn adopt(&self, mount_prefix: String, sink: Weak<dyn NotificationSink>) -> Result<()> {
        PathSpaceBase::adopt_context_and_prefix(self, mount_prefix, sink)
    }
}

impl PathSpaceTrellis {
    /// Blocks until either a source yields something or `options`'
    /// deadline passes. Mirrors the single-attempt-then-retry-loop shape
    /// `PathSpace::out_blocking` uses for its own queues, except the wait
    /// here is a plain sleep: trellis sources live in an arbitrary backing
    /// space this layer has no wait registry for.
    fn wait_and_serve_queue(
        &self,
        state: &TrellisState,
        pop: bool,
        options: &ReadOptions,
        expected_type: Option<TypeId>,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        use std::thread;
        use std::time::{Duration, Instant};

        let deadline = Instant::now() + options.timeout.unwrap_or(Duration::from_secs(3600));
        let mut slice = Duration::from_millis(1);
        loop {
            if state.shutting_down.load(Ordering::SeqCst) {
                return Err(Error::timeout("trellis is shutting down"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout("trellis wait timed out"));
            }
            match self.try_serve_queue(state, pop, expected_type) {
                Ok(value) => return Ok(value),
                Err(_) => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(slice.min(remaining));
            slice = (slice * 2).min(Duration::from_millis(8));
        }
    }

    /// Convenience wrapper over `insert_raw` for enabling a trellis.
    pub fn enable(&self, command: EnableTrellisCommand) -> InsertReturn {
        self.insert_raw(ENABLE_PATH, Box::new(command), &InsertOptions::default())
    }

    /// Convenience wrapper over `insert_raw` for disabling a trellis.
    pub fn disable(&self, command: DisableTrellisCommand) -> InsertReturn {
        self.insert_raw(DISABLE_PATH, Box::new(command), &InsertOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::PathSpace;
    use pathspace_tree::Encode;

    fn insert_value<T: Encode + Clone + 'static>(backing: &Arc<dyn PathSpaceBase>, path: &str, value: T) {
        let payload: Box<dyn Any + Send + Sync> = Box::new(Box::new(value) as Box<dyn Encode>);
        backing.insert_raw(path, payload, &InsertOptions::default());
    }

    fn read_value(trellis: &PathSpaceTrellis, path: &str) -> Result<i32> {
        let boxed = trellis.out_raw(path, true, &ReadOptions::non_blocking(), Some(TypeId::of::<i32>()))?;
        let value = boxed
            .downcast::<Box<dyn Encode>>()
            .map_err(|_| Error::invalid_type("unexpected payload shape"))?;
        value
            .as_any()
            .downcast_ref::<i32>()
            .cloned()
            .ok_or_else(|| Error::invalid_type("not an i32"))
    }

    #[test]
    fn round_robin_reads_cycle_across_sources() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        insert_value(&backing, "/src/a", 1i32);
        insert_value(&backing, "/src/b", 2i32);
        let trellis = PathSpaceTrellis::new(backing);

        trellis.enable(EnableTrellisCommand {
            name: "/out".to_string(),
            sources: vec!["/src/a".to_string(), "/src/b".to_string()],
            mode: "queue".to_string(),
            policy: "round_robin".to_string(),
        });

        assert_eq!(read_value(&trellis, "/out").unwrap(), 1);
        assert_eq!(read_value(&trellis, "/out").unwrap(), 2);
    }

    #[test]
    fn priority_reads_always_prefer_the_first_source_with_data() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        insert_value(&backing, "/src/b", 9i32);
        let trellis = PathSpaceTrellis::new(backing);

        trellis.enable(EnableTrellisCommand {
            name: "/out".to_string(),
            sources: vec!["/src/a".to_string(), "/src/b".to_string()],
            mode: "queue".to_string(),
            policy: "priority".to_string(),
        });

        assert_eq!(read_value(&trellis, "/out").unwrap(), 9);
    }

    #[test]
    fn latest_mode_is_rejected_as_not_supported() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        let trellis = PathSpaceTrellis::new(backing);

        let ret = trellis.enable(EnableTrellisCommand {
            name: "/out".to_string(),
            sources: vec!["/src/a".to_string()],
            mode: "latest".to_string(),
            policy: "round_robin".to_string(),
        });
        assert_eq!(ret.errors[0].code, ErrorCode::NotSupported);
    }

    #[test]
    fn reserved_state_paths_are_rejected_as_destinations() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        let trellis = PathSpaceTrellis::new(backing);

        let ret = trellis.enable(EnableTrellisCommand {
            name: "/_system/trellis/state/x".to_string(),
            sources: vec!["/src/a".to_string()],
            mode: "queue".to_string(),
            policy: "round_robin".to_string(),
        });
        assert_eq!(ret.errors[0].code, ErrorCode::InvalidPath);
    }

    #[test]
    fn disable_shuts_the_entry_down() {
        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        let trellis = PathSpaceTrellis::new(backing);
        trellis.enable(EnableTrellisCommand {
            name: "/out".to_string(),
            sources: vec!["/src/a".to_string()],
            mode: "queue".to_string(),
            policy: "round_robin".to_string(),
        });
        let ret = trellis.disable(DisableTrellisCommand { name: "/out".to_string() });
        assert!(ret.errors.is_empty());
        let missing = trellis.disable(DisableTrellisCommand { name: "/out".to_string() });
        assert_eq!(missing.errors[0].code, ErrorCode::NotFound);
    }

    /// Several readers hammer a round-robin trellis fed from three sources,
    /// each sleeping a random handful of microseconds between attempts so
    /// the interleaving isn't the same attempt-after-attempt pattern every
    /// run. Every entry placed in a source must come out through the
    /// trellis exactly once, and the full multiset of values read back must
    /// match what was planted, regardless of which reader happened to win
    /// which cursor advance.
    #[test]
    fn jittered_concurrent_readers_drain_every_source_exactly_once() {
        use rand::Rng;
        use std::collections::HashSet;
        use std::thread;
        use std::time::Duration;

        const PER_SOURCE: i32 = 40;
        let sources = maplit::hashset! {"/src/a", "/src/b", "/src/c"};

        let backing: Arc<dyn PathSpaceBase> = PathSpace::new();
        let mut planted = HashSet::new();
        let mut next_id = 0i32;
        for source in &sources {
            for _ in 0..PER_SOURCE {
                insert_value(&backing, source, next_id);
                planted.insert(next_id);
                next_id += 1;
            }
        }

        let trellis = PathSpaceTrellis::new(backing);
        trellis.enable(EnableTrellisCommand {
            name: "/out".to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            mode: "queue".to_string(),
            policy: "round_robin".to_string(),
        });

        let total = sources.len() * PER_SOURCE as usize;
        let collected: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let trellis = trellis.clone();
            let collected = collected.clone();
            readers.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                loop {
                    match read_value(&trellis, "/out") {
                        Ok(value) => collected.lock().push(value),
                        Err(_) => {
                            if collected.lock().len() >= total {
                                return;
                            }
                            thread::sleep(Duration::from_micros(rng.gen_range(0, 200)));
                        }
                    }
                }
            }));
        }
        for reader in readers {
            reader.join().unwrap();
        }

        let got: HashSet<i32> = collected.lock().iter().cloned().collect();
        assert_eq!(collected.lock().len(), total, "no entry should be read twice or lost");
        assert_eq!(got, planted);
    }
}
