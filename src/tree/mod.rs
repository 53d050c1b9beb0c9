// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The Morton-coded hierarchical octree.
//!
//! A tree covers five levels of detail; level 0 is the coarsest. Each level
//! holds three parallel vectors: `nodes` (8-bit child masks), `skips`
//! (prefix offsets into the next level, or into `sub_trees` for level 4) and
//! `data` (referenced point subsets). Trees finer than level 4 hang off
//! `sub_trees` by id; the registry is the single owner.

pub mod handler;
pub mod insert;
pub mod lod;
pub mod serialize;
pub mod walker;

use crate::{
    input::InputId,
    morton::{magnitude_to_lod, Morton192},
    storage::{deserialize_points, StorageHandler},
    InputRegistry,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Id of a tree inside the registry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub u32);

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A window into one stored chunk's points.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PointsSubset {
    pub input_id: InputId,

    /// First point of the window inside the blob
    pub offset: u64,

    /// Number of points in the window
    pub count: u64,
}

/// The points referenced by one tree node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PointsCollection {
    pub point_count: u64,
    pub morton_min: Morton192,
    pub morton_max: Morton192,

    /// Smallest LOD span over the member subsets
    pub min_lod: u8,

    /// Subsets in insertion order
    pub data: Vec<PointsSubset>,
}

impl PointsCollection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a subset, widening the collection bounds.
    pub fn add(&mut self, subset: PointsSubset, min: Morton192, max: Morton192, lod_span: u8) {
        if self.is_empty() {
            self.morton_min = min;
            self.morton_max = max;
            self.min_lod = lod_span;
        } else {
            self.morton_min = self.morton_min.min(min);
            self.morton_max = self.morton_max.max(max);
            self.min_lod = self.min_lod.min(lod_span);
        }

        self.point_count += subset.count;
        self.data.push(subset);
    }
}

/// A batch of point references on its way into a tree.
#[derive(Copy, Clone, Debug)]
pub struct TreePoints {
    pub subset: PointsSubset,
    pub morton_min: Morton192,
    pub morton_max: Morton192,
    pub lod_span: u8,
}

/// One five-level tree of the forest.
#[derive(Clone, Debug, Default)]
pub struct Tree {
    pub id: TreeId,

    /// Magnitude `n` covers LODs `[5n, 5n + 4]`
    pub magnitude: u32,

    /// Aligned cell bounds of the root node
    pub morton_min: Morton192,
    pub morton_max: Morton192,

    pub nodes: [Vec<u8>; 5],
    pub skips: [Vec<u32>; 5],
    pub data: [Vec<PointsCollection>; 5],

    /// Trees of magnitude - 1 hanging off level 4, in child order
    pub sub_trees: Vec<TreeId>,
}

impl Tree {
    /// The lattice LOD of nodes at `level` of this tree.
    #[must_use]
    pub fn level_lod(&self, level: usize) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let level = level as u32;
        crate::morton::tree_level_to_lod(self.magnitude, level)
    }

    /// Total points referenced from leaf collections of this tree (not
    /// counting sub-trees or synthetic LOD data).
    #[must_use]
    pub fn leaf_point_count(&self) -> u64 {
        let mut total = 0;
        for level in 0..5 {
            for (mask, collection) in self.nodes[level].iter().zip(&self.data[level]) {
                if *mask == 0 {
                    total += collection.point_count;
                }
            }
        }
        total
    }

    /// Verifies the skip/popcount bookkeeping.
    #[cfg(test)]
    pub(crate) fn debug_validate(&self) {
        for level in 0..5 {
            debug_assert_eq!(self.nodes[level].len(), self.skips[level].len());
            debug_assert_eq!(self.nodes[level].len(), self.data[level].len());

            let mut prefix = 0u32;
            for (idx, mask) in self.nodes[level].iter().enumerate() {
                debug_assert_eq!(
                    self.skips[level][idx], prefix,
                    "skips[{level}][{idx}] inconsistent"
                );
                prefix += u32::from(mask.count_ones());
            }

            if level < 4 {
                debug_assert_eq!(prefix as usize, self.nodes[level + 1].len());
            } else {
                debug_assert_eq!(prefix as usize, self.sub_trees.len());
            }
        }
    }
}

/// Construction parameters of the forest.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TreeConfig {
    /// World scale of the lattice
    pub scale: f64,

    /// World offset of the lattice
    pub offset: [f64; 3],

    /// Point budget of one node before it splits
    pub node_limit: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            scale: 0.001,
            offset: [0.0; 3],
            node_limit: 100_000,
        }
    }
}

/// Owner of every tree. `sub_trees` and the root are ids into this registry,
/// so there are no ownership cycles.
pub struct TreeRegistry {
    pub config: TreeConfig,
    trees: FxHashMap<u32, Tree>,
    next_id: u32,
    root: Option<TreeId>,
}

impl TreeRegistry {
    #[must_use]
    pub fn new(config: TreeConfig) -> Self {
        Self {
            config,
            trees: FxHashMap::default(),
            next_id: 0,
            root: None,
        }
    }

    /// The root tree, if any points were inserted yet.
    #[must_use]
    pub fn root(&self) -> Option<TreeId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, id: TreeId) {
        self.root = Some(id);
    }

    #[must_use]
    pub fn get(&self, id: TreeId) -> Option<&Tree> {
        self.trees.get(&id.0)
    }

    pub(crate) fn get_mut(&mut self, id: TreeId) -> Option<&mut Tree> {
        self.trees.get_mut(&id.0)
    }

    pub(crate) fn alloc_id(&mut self) -> TreeId {
        let id = TreeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert_tree(&mut self, tree: Tree) {
        self.next_id = self.next_id.max(tree.id.0 + 1);
        self.trees.insert(tree.id.0, tree);
    }

    /// Iterates over all trees in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Tree> {
        let mut ids = self.trees.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids.into_iter().map(|id| &self.trees[&id])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

/// Computes the aligned cell bounds of a tree of magnitude `magnitude`
/// containing `code`.
#[must_use]
pub fn aligned_cell(code: Morton192, magnitude: u32) -> (Morton192, Morton192) {
    let mask = Morton192::mask_for_lod(magnitude_to_lod(magnitude));
    let min = code & !mask;
    let max = min | mask;
    (min, max)
}

/// Access to the sorted Morton columns of stored chunks.
///
/// Splitting a node partitions subset windows at child-cell boundaries,
/// which needs the actual sorted codes of the referenced blobs.
pub trait PointsReader {
    /// The full sorted Morton column of a chunk, widened to 192 bits.
    fn morton_column(&self, input_id: InputId) -> crate::Result<Arc<Vec<Morton192>>>;
}

/// [`PointsReader`] backed by the storage handler and the input registry's
/// location table.
pub struct StoragePointsReader<'a> {
    storage: &'a StorageHandler,
    inputs: &'a InputRegistry,
    cache: std::cell::RefCell<FxHashMap<InputId, Arc<Vec<Morton192>>>>,
}

impl<'a> StoragePointsReader<'a> {
    #[must_use]
    pub fn new(storage: &'a StorageHandler, inputs: &'a InputRegistry) -> Self {
        Self {
            storage,
            inputs,
            cache: std::cell::RefCell::new(FxHashMap::default()),
        }
    }
}

impl PointsReader for StoragePointsReader<'_> {
    fn morton_column(&self, input_id: InputId) -> crate::Result<Arc<Vec<Morton192>>> {
        if let Some(column) = self.cache.borrow().get(&input_id) {
            return Ok(column.clone());
        }

        let (_, locations) = self
            .inputs
            .storage_locations(input_id)
            .ok_or(crate::Error::Unrecoverable)?;

        let location = *locations.first().ok_or(crate::Error::Unrecoverable)?;
        let blob = self.storage.read_sync(location)?;
        let (header, data) = deserialize_points(&blob)?;

        let column = Arc::new(decode_morton_column(&header, &data)?);
        self.cache.borrow_mut().insert(input_id, column.clone());

        Ok(column)
    }
}

/// Decodes the position column of a stored blob into 192-bit codes.
pub fn decode_morton_column(
    header: &crate::storage::StorageHeader,
    data: &[u8],
) -> crate::Result<Vec<Morton192>> {
    use crate::format::ScalarType;
    use crate::morton::Morton;
    use byteorder::{LittleEndian, ReadBytesExt};

    let count = header.public_header.point_count as usize;
    let mut column = Vec::with_capacity(count);
    let mut reader = data;

    match header.point_format.scalar {
        ScalarType::Morton32 => {
            for _ in 0..count {
                let word = u64::from(reader.read_u32::<LittleEndian>()?);
                column.push(Morton::<1>([word]).upcast(&header.morton_min));
            }
        }
        ScalarType::Morton64 => {
            for _ in 0..count {
                let word = reader.read_u64::<LittleEndian>()?;
                column.push(Morton::<1>([word]).upcast(&header.morton_min));
            }
        }
        ScalarType::Morton128 => {
            for _ in 0..count {
                let w0 = reader.read_u64::<LittleEndian>()?;
                let w1 = reader.read_u64::<LittleEndian>()?;
                column.push(Morton::<2>([w0, w1]).upcast(&header.morton_min));
            }
        }
        ScalarType::Morton192 => {
            for _ in 0..count {
                let w0 = reader.read_u64::<LittleEndian>()?;
                let w1 = reader.read_u64::<LittleEndian>()?;
                let w2 = reader.read_u64::<LittleEndian>()?;
                column.push(Morton::<3>([w0, w1, w2]));
            }
        }
        _ => {
            return Err(crate::Error::Decode(crate::coding::DecodeError::InvalidTag((
                "morton column",
                header.point_format.scalar as u8,
            ))))
        }
    }

    Ok(column)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{PointsReader, TreePoints};
    use crate::{input::InputId, morton::Morton192, tree::PointsSubset};
    use rustc_hash::FxHashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory [`PointsReader`] for tree tests.
    #[derive(Default)]
    pub struct FakePointsReader {
        columns: Mutex<FxHashMap<InputId, Arc<Vec<Morton192>>>>,
    }

    impl FakePointsReader {
        /// Registers a chunk with a sorted column of codes; returns the
        /// matching insertion batch.
        pub fn add_batch(&self, input_id: InputId, mut codes: Vec<Morton192>) -> TreePoints {
            codes.sort_unstable();

            let min = *codes.first().expect("batch is non-empty");
            let max = *codes.last().expect("batch is non-empty");

            let points = TreePoints {
                subset: PointsSubset {
                    input_id,
                    offset: 0,
                    count: codes.len() as u64,
                },
                morton_min: min,
                morton_max: max,
                #[allow(clippy::cast_possible_truncation)]
                lod_span: min.first_differing_lod(&max) as u8,
            };

            self.columns
                .lock()
                .expect("lock is poisoned")
                .insert(input_id, Arc::new(codes));

            points
        }
    }

    impl PointsReader for FakePointsReader {
        fn morton_column(&self, input_id: InputId) -> crate::Result<Arc<Vec<Morton192>>> {
            self.columns
                .lock()
                .expect("lock is poisoned")
                .get(&input_id)
                .cloned()
                .ok_or(crate::Error::Unrecoverable)
        }
    }
}
