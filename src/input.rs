// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    attributes::AttributesId,
    morton::{Morton, Morton192},
    storage::{PointCloudHeader, StorageLocation},
};
use rustc_hash::FxHashMap;
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Marks the `sub` of a LOD-synthesized node; everything without it is a
/// leaf input chunk.
pub const LOD_SUB_BIT: u32 = 0x8000_0000;

/// Reference to one input, or one size-bounded chunk of one (`sub > 0`).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InputId {
    pub data: u32,
    pub sub: u32,
}

impl InputId {
    /// `true` for nodes synthesized by the LOD generator.
    #[must_use]
    pub const fn is_lod_synthetic(&self) -> bool {
        self.sub & LOD_SUB_BIT != 0
    }
}

impl std::fmt::Display for InputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.data, self.sub)
    }
}

/// What the scheduler hands to a reader worker.
#[derive(Clone, Debug)]
pub struct NextInput {
    pub id: InputId,
    pub path: PathBuf,
    pub approximate_point_count: u64,
    pub approximate_point_size_bytes: u8,
}

#[derive(Debug)]
struct InputSourceState {
    path: PathBuf,
    attributes_id: Option<AttributesId>,
    public_header: Option<PointCloudHeader>,

    morton_min: Morton192,
    morton_max: Morton192,

    /// Scheduling key: Morton code of the pre-init AABB minimum; inputs with
    /// no known minimum sort last.
    input_order: Morton192,

    pre_init_done: bool,
    read_started: bool,
    read_finished: bool,
    failed: bool,

    approximate_point_count: u64,
    approximate_point_size_bytes: u8,

    sub_count: u32,
    inserted_into_tree: u32,
}

impl InputSourceState {
    fn is_done(&self) -> bool {
        self.read_finished && self.inserted_into_tree == self.sub_count
    }
}

struct Inner {
    registry: FxHashMap<u32, InputSourceState>,
    locations: FxHashMap<InputId, (AttributesId, Vec<StorageLocation>)>,

    next_data_id: u32,
    next_lod_id: u32,

    /// Pre-inited but not yet dispatched, min-heap by Morton order
    unsorted: BinaryHeap<Reverse<(Morton192, u32)>>,

    /// Dispatch order
    sorted: Vec<u32>,
}

/// Tracks the lifecycle of every registered input: pre-init results, the
/// Morton-ordered dispatch schedule, per-chunk storage locations, and the
/// completion watermark that gates LOD generation.
///
/// Consulted from reader workers and the tree loop concurrently.
pub struct InputRegistry {
    inner: Mutex<Inner>,
}

impl Default for InputRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
impl InputRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                registry: FxHashMap::default(),
                locations: FxHashMap::default(),
                next_data_id: 0,
                next_lod_id: 0,
                unsorted: BinaryHeap::new(),
                sorted: Vec::new(),
            }),
        }
    }

    /// Registers an input file, assigning its id.
    pub fn register_file(&self, path: &Path) -> InputId {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let data = inner.next_data_id;
        inner.next_data_id += 1;

        inner.registry.insert(
            data,
            InputSourceState {
                path: path.into(),
                attributes_id: None,
                public_header: None,
                morton_min: Morton192::MAX,
                morton_max: Morton192::ZERO,
                input_order: Morton192::MAX,
                pre_init_done: false,
                read_started: false,
                read_finished: false,
                failed: false,
                approximate_point_count: 0,
                approximate_point_size_bytes: 0,
                sub_count: 0,
                inserted_into_tree: 0,
            },
        );

        InputId { data, sub: 0 }
    }

    /// Records a pre-init result and schedules the input.
    pub fn register_pre_init_result(
        &self,
        id: InputId,
        input_order: Morton192,
        approximate_point_count: u64,
        approximate_point_size_bytes: u8,
    ) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        state.pre_init_done = true;
        state.input_order = input_order;
        state.approximate_point_count = approximate_point_count;
        state.approximate_point_size_bytes = approximate_point_size_bytes;

        inner.unsorted.push(Reverse((input_order, id.data)));
    }

    /// Records the header produced by the reader's `init`.
    pub fn handle_input_init(
        &self,
        id: InputId,
        attributes_id: AttributesId,
        public_header: PointCloudHeader,
    ) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        state.attributes_id = Some(attributes_id);
        state.public_header = Some(public_header);
    }

    /// Allocates the next chunk id of an input.
    pub fn handle_sub_added(&self, id: InputId) -> InputId {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        let sub = state.sub_count;
        state.sub_count += 1;

        InputId { data: id.data, sub }
    }

    /// Widens the input's Morton bounds by a sorted batch.
    pub fn handle_sorted_points(&self, id: InputId, min: Morton192, max: Morton192) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        state.morton_min = state.morton_min.min(min);
        state.morton_max = state.morton_max.max(max);
    }

    /// Marks an input's read loop as exhausted.
    pub fn handle_reading_done(&self, id: InputId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        state.read_finished = true;
    }

    /// Marks one chunk of an input as inserted into the tree.
    pub fn handle_tree_done_with_input(&self, id: InputId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        state.inserted_into_tree += 1;
        debug_assert!(state.inserted_into_tree <= state.sub_count);
    }

    /// Marks an input as failed; it no longer participates in completion.
    pub fn mark_failed(&self, id: InputId) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let state = inner.registry.get_mut(&id.data).expect("input is registered");
        state.failed = true;
        state.read_finished = true;
    }

    /// Pops the Morton-least input that has not started reading yet.
    pub fn next_input_to_process(&self) -> Option<NextInput> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let Reverse((_, data)) = inner.unsorted.pop()?;

        inner.sorted.push(data);

        let state = inner.registry.get_mut(&data).expect("input is registered");
        debug_assert!(!state.read_started);
        state.read_started = true;

        Some(NextInput {
            id: InputId { data, sub: 0 },
            path: state.path.clone(),
            approximate_point_count: state.approximate_point_count,
            approximate_point_size_bytes: state.approximate_point_size_bytes,
        })
    }

    /// The LOD watermark: the Morton minimum of the most recent input in
    /// dispatch order whose chunks are all read and inserted. Returns the
    /// all-ones code once every dispatched input is done.
    pub fn get_done_morton(&self) -> Option<Morton192> {
        let inner = self.inner.lock().expect("lock is poisoned");

        let mut watermark = None;

        for data in &inner.sorted {
            let state = &inner.registry[data];
            if state.failed {
                continue;
            }
            if !state.is_done() {
                return watermark;
            }
            watermark = Some(state.morton_min.min(state.input_order));
        }

        // Everything known is done and nothing is waiting on pre-init.
        let all_scheduled = inner
            .registry
            .values()
            .all(|state| state.failed || state.read_started);

        if watermark.is_some() && inner.unsorted.is_empty() && all_scheduled {
            return Some(Morton192::MAX);
        }

        watermark
    }

    /// `true` once every registered input is read and inserted.
    pub fn all_inserted_into_tree(&self) -> bool {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner
            .registry
            .values()
            .all(|state| state.failed || (state.pre_init_done && state.read_started && state.is_done()))
    }

    /// Allocates an id for a LOD-synthesized node.
    pub fn next_lod_id(&self) -> InputId {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let id = inner.next_lod_id;
        inner.next_lod_id += 1;

        InputId {
            data: id,
            sub: LOD_SUB_BIT,
        }
    }

    /// Records where a chunk's attribute blobs live.
    pub fn add_storage_locations(
        &self,
        id: InputId,
        attributes_id: AttributesId,
        locations: Vec<StorageLocation>,
    ) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.locations.insert(id, (attributes_id, locations));
    }

    /// Resolves a chunk to its attribute blobs.
    pub fn storage_locations(&self, id: InputId) -> Option<(AttributesId, Vec<StorageLocation>)> {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.locations.get(&id).cloned()
    }

    /// Removes a chunk's location entry (when its blobs were replaced by a
    /// coarser LOD), returning what was stored.
    pub fn remove_storage_locations(
        &self,
        id: InputId,
    ) -> Option<(AttributesId, Vec<StorageLocation>)> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.locations.remove(&id)
    }

    /// Dumps the location table for serialization.
    pub fn snapshot_locations(&self) -> Vec<(InputId, AttributesId, Vec<StorageLocation>)> {
        let inner = self.inner.lock().expect("lock is poisoned");

        let mut entries = inner
            .locations
            .iter()
            .map(|(id, (attributes_id, locations))| (*id, *attributes_id, locations.clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(id, ..)| *id);
        entries
    }

    /// Restores the location table from a deserialized registry.
    pub fn restore_locations(
        &self,
        entries: Vec<(InputId, AttributesId, Vec<StorageLocation>)>,
    ) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        for (id, attributes_id, locations) in entries {
            if id.is_lod_synthetic() {
                inner.next_lod_id = inner.next_lod_id.max(id.data + 1);
            } else {
                inner.next_data_id = inner.next_data_id.max(id.data + 1);
            }
            inner.locations.insert(id, (attributes_id, locations));
        }
    }

    /// Number of registered inputs.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total approximate point count over all registered inputs.
    pub fn approximate_total_points(&self) -> u64 {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner
            .registry
            .values()
            .map(|state| state.approximate_point_count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn order(words: [u64; 3]) -> Morton192 {
        Morton::<3>(words)
    }

    #[test]
    fn inputs_dispatch_in_morton_order() {
        let registry = InputRegistry::new();

        let a = registry.register_file(Path::new("a.las"));
        let b = registry.register_file(Path::new("b.las"));
        let c = registry.register_file(Path::new("c.las"));

        registry.register_pre_init_result(a, order([500, 0, 0]), 10, 16);
        registry.register_pre_init_result(b, order([100, 0, 0]), 10, 16);
        registry.register_pre_init_result(c, order([300, 0, 0]), 10, 16);

        let first = registry.next_input_to_process().expect("has input");
        let second = registry.next_input_to_process().expect("has input");
        let third = registry.next_input_to_process().expect("has input");

        assert_eq!(first.id, b);
        assert_eq!(second.id, c);
        assert_eq!(third.id, a);
        assert!(registry.next_input_to_process().is_none());
    }

    #[test]
    fn watermark_advances_over_done_prefix() {
        let registry = InputRegistry::new();

        let a = registry.register_file(Path::new("a.las"));
        let b = registry.register_file(Path::new("b.las"));

        registry.register_pre_init_result(a, order([100, 0, 0]), 10, 16);
        registry.register_pre_init_result(b, order([900, 0, 0]), 10, 16);

        let _ = registry.next_input_to_process();
        let _ = registry.next_input_to_process();

        assert_eq!(registry.get_done_morton(), None);

        // finish input a (one chunk)
        let sub = registry.handle_sub_added(a);
        assert_eq!(sub.sub, 0);
        registry.handle_sorted_points(a, order([100, 0, 0]), order([200, 0, 0]));
        registry.handle_reading_done(a);
        registry.handle_tree_done_with_input(a);

        assert_eq!(registry.get_done_morton(), Some(order([100, 0, 0])));

        // finish input b
        registry.handle_sub_added(b);
        registry.handle_sorted_points(b, order([900, 0, 0]), order([950, 0, 0]));
        registry.handle_reading_done(b);
        registry.handle_tree_done_with_input(b);

        assert_eq!(registry.get_done_morton(), Some(Morton192::MAX));
        assert!(registry.all_inserted_into_tree());
    }

    #[test]
    fn chunk_ids_count_up_and_lod_ids_are_marked() {
        let registry = InputRegistry::new();
        let a = registry.register_file(Path::new("a.las"));

        assert_eq!(registry.handle_sub_added(a).sub, 0);
        assert_eq!(registry.handle_sub_added(a).sub, 1);

        let lod = registry.next_lod_id();
        assert!(lod.is_lod_synthetic());
        assert!(!a.is_lod_synthetic());
    }

    #[test]
    fn locations_roundtrip() {
        let registry = InputRegistry::new();
        let a = registry.register_file(Path::new("a.las"));
        let chunk = registry.handle_sub_added(a);

        registry.add_storage_locations(
            chunk,
            AttributesId(3),
            vec![StorageLocation::new(128, 100)],
        );

        let snapshot = registry.snapshot_locations();
        assert_eq!(snapshot.len(), 1);

        let other = InputRegistry::new();
        other.restore_locations(snapshot);
        let (attributes_id, locations) = other.storage_locations(chunk).expect("restored");
        assert_eq!(attributes_id, AttributesId(3));
        assert_eq!(locations, vec![StorageLocation::new(128, 100)]);
    }
}
