// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree insertion: append, split, reparent and sub-tree spawn.
//!
//! Every public operation either completes fully or panics on a broken
//! invariant; transient allocations are undone on I/O errors.

use super::{
    aligned_cell, PointsCollection, PointsReader, PointsSubset, Tree, TreeId, TreePoints,
    TreeRegistry,
};
use crate::morton::{magnitude_from_lod, Morton, Morton192};

/// Creates the forest's first tree from the first inserted batch and makes
/// it the root.
pub fn initialize(registry: &mut TreeRegistry, points: TreePoints) -> TreeId {
    let id = create_tree(registry, points);
    registry.set_root(id);
    id
}

/// Inserts a batch into the tree, reparenting the root first if the batch
/// falls outside its cell.
///
/// Returns the synthetic LOD subsets invalidated by the insertion (interior
/// collections the descent passed through); their blobs are due for
/// reclamation and their nodes for regeneration.
pub fn add_points(
    registry: &mut TreeRegistry,
    reader: &dyn PointsReader,
    tree_id: TreeId,
    points: TreePoints,
) -> crate::Result<Vec<PointsSubset>> {
    let mut stale = Vec::new();
    add_points_collect_stale(registry, reader, tree_id, points, &mut stale)?;
    Ok(stale)
}

fn add_points_collect_stale(
    registry: &mut TreeRegistry,
    reader: &dyn PointsReader,
    tree_id: TreeId,
    points: TreePoints,
    stale: &mut Vec<PointsSubset>,
) -> crate::Result<()> {
    reparent_if_needed(registry, tree_id, &points);

    let cell_min = registry
        .get(tree_id)
        .unwrap_or_else(|| unreachable!("tree exists"))
        .morton_min;

    insert_at(registry, reader, tree_id, 0, 0, cell_min, points, stale)
}

/// Creates a tree sized to the batch's Morton span, without touching the
/// registry root.
fn create_tree(registry: &mut TreeRegistry, points: TreePoints) -> TreeId {
    let id = registry.alloc_id();

    let magnitude = magnitude_from_lod(u32::from(points.lod_span));
    let (cell_min, cell_max) = aligned_cell(points.morton_min, magnitude);

    let mut tree = empty_tree(id, magnitude, cell_min, cell_max);
    tree.data[0][0].add(
        points.subset,
        points.morton_min,
        points.morton_max,
        points.lod_span,
    );

    registry.insert_tree(tree);
    id
}

fn empty_tree(id: TreeId, magnitude: u32, morton_min: Morton192, morton_max: Morton192) -> Tree {
    let mut tree = Tree {
        id,
        magnitude,
        morton_min,
        morton_max,
        ..Tree::default()
    };

    tree.nodes[0].push(0);
    tree.skips[0].push(0);
    tree.data[0].push(PointsCollection::default());

    tree
}

/// Grows the tree upward until its cell encloses the batch. The tree keeps
/// its id (all references to it stay valid); the old root moves to a fresh
/// id and is attached at its child position in the new root.
fn reparent_if_needed(registry: &mut TreeRegistry, tree_id: TreeId, points: &TreePoints) {
    let (old_min, old_max) = {
        let tree = registry
            .get(tree_id)
            .unwrap_or_else(|| unreachable!("tree exists"));
        (tree.morton_min, tree.morton_max)
    };

    if points.morton_min >= old_min && points.morton_max <= old_max {
        return;
    }

    let combined_min = old_min.min(points.morton_min);
    let combined_max = old_max.max(points.morton_max);
    let new_magnitude = magnitude_from_lod(combined_min.first_differing_lod(&combined_max));

    let old_id = registry.alloc_id();

    let mut old_tree = registry
        .get_mut(tree_id)
        .map(std::mem::take)
        .unwrap_or_else(|| unreachable!("tree exists"));
    old_tree.id = old_id;

    debug_assert!(new_magnitude > old_tree.magnitude);

    log::debug!(
        "reparenting {tree_id}: magnitude {} -> {new_magnitude}",
        old_tree.magnitude,
    );

    let (cell_min, cell_max) = aligned_cell(combined_min, new_magnitude);
    let new_root = empty_tree(tree_id, new_magnitude, cell_min, cell_max);

    *registry
        .get_mut(tree_id)
        .unwrap_or_else(|| unreachable!("tree exists")) = new_root;

    registry.insert_tree(old_tree);
    attach_tree(registry, tree_id, old_id);
}

/// Hangs `child_id` into `parent_id` at the node path derived from its
/// Morton minimum. Inserts an intermediate tree when the magnitudes are more
/// than one step apart.
fn attach_tree(registry: &mut TreeRegistry, parent_id: TreeId, child_id: TreeId) {
    let parent_magnitude = registry
        .get(parent_id)
        .unwrap_or_else(|| unreachable!("tree exists"))
        .magnitude;
    let (child_magnitude, child_min) = {
        let child = registry
            .get(child_id)
            .unwrap_or_else(|| unreachable!("tree exists"));
        (child.magnitude, child.morton_min)
    };

    debug_assert!(child_magnitude < parent_magnitude);

    if child_magnitude + 1 < parent_magnitude {
        let intermediate_id = registry.alloc_id();
        let (cell_min, cell_max) = aligned_cell(child_min, parent_magnitude - 1);
        registry.insert_tree(empty_tree(
            intermediate_id,
            parent_magnitude - 1,
            cell_min,
            cell_max,
        ));

        attach_tree(registry, intermediate_id, child_id);
        attach_tree(registry, parent_id, intermediate_id);
        return;
    }

    let tree = registry
        .get_mut(parent_id)
        .unwrap_or_else(|| unreachable!("tree exists"));

    let mut skip = 0usize;

    for level in 0..5 {
        let lod = tree.level_lod(level);
        let child = child_min.child_at(lod);
        let mask = tree.nodes[level][skip];
        let rank = rank_of(mask, child);
        let pos = tree.skips[level][skip] as usize + rank;

        if mask & (1u8 << child) != 0 {
            debug_assert!(level < 4, "sub-tree slot already occupied");
            skip = pos;
        } else {
            tree.nodes[level][skip] |= 1u8 << child;
            bump_skips_after(tree, level, skip, 1);

            if level < 4 {
                insert_row(tree, level + 1, pos);
                skip = pos;
            } else {
                tree.sub_trees.insert(pos, child_id);
            }
        }
    }
}

fn rank_of(mask: u8, child: u8) -> usize {
    (mask & ((1u16 << child) - 1) as u8).count_ones() as usize
}

/// Adds `count` to the skip of every row after `skip` on `level`.
fn bump_skips_after(tree: &mut Tree, level: usize, skip: usize, count: u32) {
    for value in tree.skips[level].iter_mut().skip(skip + 1) {
        *value += count;
    }
}

/// Inserts an empty row at `pos` of `level`, keeping the prefix-sum skips
/// consistent (an empty row contributes no children).
fn insert_row(tree: &mut Tree, level: usize, pos: usize) {
    let skip_value = if pos < tree.skips[level].len() {
        tree.skips[level][pos]
    } else if let (Some(last_skip), Some(last_mask)) =
        (tree.skips[level].last(), tree.nodes[level].last())
    {
        *last_skip + last_mask.count_ones()
    } else {
        0
    };

    tree.nodes[level].insert(pos, 0);
    tree.skips[level].insert(pos, skip_value);
    tree.data[level].insert(pos, PointsCollection::default());
}

#[allow(clippy::too_many_arguments)]
fn insert_at(
    registry: &mut TreeRegistry,
    reader: &dyn PointsReader,
    tree_id: TreeId,
    mut level: usize,
    mut skip: usize,
    mut cell_min: Morton192,
    points: TreePoints,
    stale: &mut Vec<PointsSubset>,
) -> crate::Result<()> {
    let node_limit = registry.config.node_limit;

    loop {
        let tree = registry
            .get(tree_id)
            .ok_or(crate::Error::Unrecoverable)?;
        let lod = tree.level_lod(level);
        let mask = tree.nodes[level][skip];
        debug_assert!(u32::from(points.lod_span) <= lod);

        if mask == 0 {
            let current = tree.data[level][skip].point_count;

            // Cells at LOD 0 cannot split further.
            let at_bottom = tree.magnitude == 0 && level == 4;

            if current + points.subset.count <= node_limit || at_bottom {
                let tree = registry
                    .get_mut(tree_id)
                    .unwrap_or_else(|| unreachable!("tree exists"));
                tree.data[level][skip].add(
                    points.subset,
                    points.morton_min,
                    points.morton_max,
                    points.lod_span,
                );
                return Ok(());
            }

            return split_node(registry, reader, tree_id, level, skip, cell_min, points, stale);
        }

        // Descending through an interior node invalidates any synthetic LOD
        // collection it carries.
        if !tree.data[level][skip].is_empty() {
            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            let collection = std::mem::take(&mut tree.data[level][skip]);
            debug_assert!(collection
                .data
                .iter()
                .all(|subset| subset.input_id.is_lod_synthetic()));
            stale.extend(collection.data);
        }

        let tree = registry
            .get(tree_id)
            .unwrap_or_else(|| unreachable!("tree exists"));

        if u32::from(points.lod_span) == lod {
            // The batch straddles child boundaries of this node; split the
            // window per child and insert the pieces separately.
            let pieces = partition_subset(reader, points.subset, lod, cell_min)?;
            for (_, piece) in pieces {
                insert_at(registry, reader, tree_id, level, skip, cell_min, piece, stale)?;
            }
            return Ok(());
        }

        let child = points.morton_min.child_at(lod);
        let rank = rank_of(mask, child);
        let pos = tree.skips[level][skip] as usize + rank;

        if mask & (1u8 << child) != 0 {
            if level == 4 {
                let sub_id = tree.sub_trees[pos];
                return add_points_collect_stale(registry, reader, sub_id, points, stale);
            }

            cell_min.set_child_at(lod, child);
            level += 1;
            skip = pos;
        } else if level == 4 {
            // Spawn a sub-tree one magnitude finer for this child.
            let sub_id = create_tree(registry, points);

            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            tree.nodes[4][skip] |= 1u8 << child;
            bump_skips_after(tree, 4, skip, 1);
            tree.sub_trees.insert(pos, sub_id);

            return Ok(());
        } else {
            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            tree.nodes[level][skip] |= 1u8 << child;
            bump_skips_after(tree, level, skip, 1);
            insert_row(tree, level + 1, pos);

            cell_min.set_child_at(lod, child);
            level += 1;
            skip = pos;
        }
    }
}

/// Splits a full leaf: partitions its subsets (plus the incoming batch) at
/// the node's child boundaries and pushes everything one level down.
#[allow(clippy::too_many_arguments)]
fn split_node(
    registry: &mut TreeRegistry,
    reader: &dyn PointsReader,
    tree_id: TreeId,
    level: usize,
    skip: usize,
    cell_min: Morton192,
    incoming: TreePoints,
    stale: &mut Vec<PointsSubset>,
) -> crate::Result<()> {
    let lod = registry
        .get(tree_id)
        .ok_or(crate::Error::Unrecoverable)?
        .level_lod(level);

    let existing = {
        let tree = registry
            .get_mut(tree_id)
            .unwrap_or_else(|| unreachable!("tree exists"));
        std::mem::take(&mut tree.data[level][skip])
    };

    // Partition every subset before touching the tree shape, so an I/O error
    // leaves the node intact.
    let partitioned = (|| -> crate::Result<Vec<Vec<TreePoints>>> {
        let mut per_child: Vec<Vec<TreePoints>> = (0..8).map(|_| Vec::new()).collect();

        for subset in &existing.data {
            for (child, piece) in partition_subset(reader, *subset, lod, cell_min)? {
                per_child[usize::from(child)].push(piece);
            }
        }
        for (child, piece) in partition_subset(reader, incoming.subset, lod, cell_min)? {
            per_child[usize::from(child)].push(piece);
        }

        Ok(per_child)
    })();

    let per_child = match partitioned {
        Ok(per_child) => per_child,
        Err(e) => {
            // Put the old collection back; the node is unchanged.
            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            tree.data[level][skip] = existing;
            return Err(e);
        }
    };

    let mut child_mask = 0u8;
    for (child, pieces) in per_child.iter().enumerate() {
        if !pieces.is_empty() {
            child_mask |= 1u8 << child;
        }
    }
    debug_assert_ne!(child_mask, 0);

    let magnitude = registry
        .get(tree_id)
        .unwrap_or_else(|| unreachable!("tree exists"))
        .magnitude;

    if level < 4 {
        let base = {
            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            debug_assert_eq!(tree.nodes[level][skip], 0);

            tree.nodes[level][skip] = child_mask;
            let base = tree.skips[level][skip] as usize;

            bump_skips_after(tree, level, skip, child_mask.count_ones());

            for offset in 0..child_mask.count_ones() as usize {
                insert_row(tree, level + 1, base + offset);
            }

            base
        };

        let mut rank = 0usize;
        for (child, pieces) in per_child.into_iter().enumerate() {
            if pieces.is_empty() {
                continue;
            }

            #[allow(clippy::cast_possible_truncation)]
            let mut child_cell = cell_min;
            child_cell.set_child_at(lod, child as u8);

            for piece in pieces {
                insert_at(
                    registry,
                    reader,
                    tree_id,
                    level + 1,
                    base + rank,
                    child_cell,
                    piece,
                    stale,
                )?;
            }

            rank += 1;
        }
    } else {
        debug_assert!(magnitude > 0, "level-4 nodes of magnitude 0 never split");

        let base = {
            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            debug_assert_eq!(tree.nodes[4][skip], 0);

            tree.nodes[4][skip] = child_mask;
            let base = tree.skips[4][skip] as usize;
            bump_skips_after(tree, 4, skip, child_mask.count_ones());
            base
        };

        let mut rank = 0usize;
        for pieces in per_child.into_iter() {
            let mut pieces = pieces.into_iter();
            let Some(first) = pieces.next() else {
                continue;
            };

            let sub_id = create_tree(registry, first);

            let tree = registry
                .get_mut(tree_id)
                .unwrap_or_else(|| unreachable!("tree exists"));
            tree.sub_trees.insert(base + rank, sub_id);

            for piece in pieces {
                add_points_collect_stale(registry, reader, sub_id, piece, stale)?;
            }

            rank += 1;
        }
    }

    Ok(())
}

/// Splits a subset window at the child boundaries of the cell at `lod`.
///
/// The boundaries are found by binary search on the sorted Morton column, so
/// the storage blob stays whole; only the tree's `(offset, count)` windows
/// narrow.
fn partition_subset(
    reader: &dyn PointsReader,
    subset: PointsSubset,
    lod: u32,
    cell_min: Morton192,
) -> crate::Result<Vec<(u8, TreePoints)>> {
    let column = reader.morton_column(subset.input_id)?;

    let start = subset.offset as usize;
    let end = start + subset.count as usize;
    debug_assert!(end <= column.len());
    let window = &column[start..end];

    let mut out = Vec::new();
    let mut piece_start = 0usize;

    for child in 0u8..8 {
        let piece_end = if child == 7 {
            window.len()
        } else {
            let mut bound = cell_min;
            bound.set_child_at(lod, child + 1);
            piece_start + window[piece_start..].partition_point(|code| *code < bound)
        };

        if piece_end > piece_start {
            let min = window[piece_start];
            let max = window[piece_end - 1];

            #[allow(clippy::cast_possible_truncation)]
            out.push((
                child,
                TreePoints {
                    subset: PointsSubset {
                        input_id: subset.input_id,
                        offset: subset.offset + piece_start as u64,
                        count: (piece_end - piece_start) as u64,
                    },
                    morton_min: min,
                    morton_max: max,
                    lod_span: min.first_differing_lod(&max) as u8,
                },
            ));
        }

        piece_start = piece_end;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputId;
    use crate::tree::test_support::FakePointsReader;
    use crate::tree::TreeConfig;
    use test_log::test;

    fn registry(node_limit: u64) -> TreeRegistry {
        TreeRegistry::new(TreeConfig {
            node_limit,
            ..TreeConfig::default()
        })
    }

    fn input(data: u32) -> InputId {
        InputId { data, sub: 0 }
    }

    fn codes(range: std::ops::Range<u64>, count: u64) -> Vec<Morton192> {
        let span = range.end - range.start;
        (0..count)
            .map(|idx| Morton::<3>([range.start + idx * span / count, 0, 0]))
            .collect()
    }

    #[test]
    fn initialize_creates_magnitude_zero_root() {
        let mut registry = registry(100_000);
        let reader = FakePointsReader::default();

        let points = reader.add_batch(input(0), codes(0..32_768, 256));
        let root = initialize(&mut registry, points);

        let tree = registry.get(root).expect("tree exists");
        assert_eq!(tree.magnitude, 0);
        assert_eq!(tree.morton_min, Morton192::ZERO);
        assert_eq!(tree.morton_max, Morton::<3>([32_767, 0, 0]));
        assert_eq!(tree.nodes[0], vec![0]);
        assert_eq!(tree.data[0][0].data.len(), 1);
        assert_eq!(tree.data[0][0].point_count, 256);
        tree.debug_validate();
    }

    #[test]
    fn second_batch_is_included_in_the_leaf() {
        let mut registry = registry(100_000);
        let reader = FakePointsReader::default();

        let first = reader.add_batch(input(0), codes(0..32_768, 256));
        let root = initialize(&mut registry, first);

        let second = reader.add_batch(input(1), codes(16_383..32_768, 128));
        add_points(&mut registry, &reader, root, second).expect("insert succeeds");

        let tree = registry.get(root).expect("tree exists");
        assert_eq!(tree.nodes[0][0], 0, "still a leaf");
        assert_eq!(tree.data[0][0].data.len(), 2);
        assert_eq!(tree.data[0][0].point_count, 384);
        tree.debug_validate();
    }

    #[test]
    fn overflow_splits_into_children() {
        let mut registry = registry(256);
        let reader = FakePointsReader::default();

        let first = reader.add_batch(input(0), codes(0..32_768, 256));
        let root = initialize(&mut registry, first);

        let second = reader.add_batch(input(1), codes(0..32_768, 256));
        add_points(&mut registry, &reader, root, second).expect("insert succeeds");

        let tree = registry.get(root).expect("tree exists");
        assert_ne!(tree.nodes[0][0], 0, "root node has children");
        assert!(tree.data[0][0].is_empty(), "root data moved down");
        assert!(!tree.nodes[1].is_empty());

        // all 512 points live in the children now
        let level1_total: u64 = tree.data[1].iter().map(|c| c.point_count).sum();
        assert_eq!(level1_total, 512);

        // subsets were cut at child boundaries (I3)
        let lod = tree.level_lod(1);
        for (mask, collection) in tree.nodes[1].iter().zip(&tree.data[1]) {
            assert_eq!(*mask, 0);
            assert!(!collection.is_empty());
            assert_eq!(
                collection.morton_min.child_at(tree.level_lod(0)),
                collection.morton_max.child_at(tree.level_lod(0)),
                "collection stays within one child cell at lod {lod}"
            );
        }

        tree.debug_validate();
    }

    #[test]
    fn reparent_attaches_old_root_at_nonzero_child_slot() {
        let mut registry = registry(100_000);
        let reader = FakePointsReader::default();

        // Magnitude-0 tree at an offset cell: min 2^27, max 2^27 + 2^15 - 1
        let base = 1u64 << 27;
        let first = reader.add_batch(
            input(0),
            (0..64).map(|idx| Morton::<3>([base + idx * 512, 0, 0])).collect(),
        );
        let root = initialize(&mut registry, first);
        assert_eq!(registry.get(root).expect("tree exists").magnitude, 0);

        // A batch at Morton 0 forces a reparent
        let second = reader.add_batch(input(1), codes(0..32_768, 64));
        add_points(&mut registry, &reader, root, second).expect("insert succeeds");

        let tree = registry.get(root).expect("tree exists");
        assert_eq!(tree.magnitude, 1, "new root is one magnitude up");
        assert_eq!(tree.morton_min, Morton192::ZERO);

        // The old root hangs at child slot 1 of the new root (bit 27 is the
        // x bit of lod 9).
        assert_eq!(tree.nodes[0][0] & 0b10, 0b10);
        assert_eq!(registry.root(), Some(root));

        // Old data and new data are both reachable as sub-trees.
        assert_eq!(tree.sub_trees.len(), 2);
        let total: u64 = tree
            .sub_trees
            .iter()
            .map(|id| registry.get(*id).expect("sub-tree exists").leaf_point_count())
            .sum();
        assert_eq!(total, 128);

        tree.debug_validate();
        for id in &tree.sub_trees {
            registry.get(*id).expect("sub-tree exists").debug_validate();
        }
    }

    #[test]
    fn deep_overflow_spawns_sub_tree_at_level_four() {
        let mut registry = registry(64);
        let reader = FakePointsReader::default();

        // 64 clustered codes plus one far outlier: the span reaches lod 9,
        // so the root tree covers a whole extra magnitude.
        let mut cluster = (0..64u64).map(|c| Morton::<3>([c, 0, 0])).collect::<Vec<_>>();
        cluster.push(Morton::<3>([(1 << 30) - 1, 0, 0]));

        let first = reader.add_batch(input(0), cluster);
        let root = initialize(&mut registry, first);
        assert_eq!(registry.get(root).expect("tree exists").magnitude, 1);

        // A second cluster overflows the node chain down to level 4, which
        // must spawn a magnitude-0 sub-tree rather than a sixth level.
        let second = reader.add_batch(
            input(1),
            (32..96u64).map(|c| Morton::<3>([c, 0, 0])).collect(),
        );
        add_points(&mut registry, &reader, root, second).expect("insert succeeds");

        let tree = registry.get(root).expect("tree exists");
        assert!(tree.data[0][0].is_empty());
        assert_ne!(tree.nodes[0][0], 0);
        assert_eq!(tree.nodes[4].len(), 1, "one level-4 node on the cluster path");
        assert_eq!(tree.sub_trees.len(), 1);
        tree.debug_validate();

        let sub = registry
            .get(tree.sub_trees[0])
            .expect("sub-tree exists");
        assert_eq!(sub.magnitude, 0);
        sub.debug_validate();

        // 128 clustered points moved into the sub-tree, the outlier stayed
        // in a shallow leaf of the root tree.
        assert_eq!(sub.leaf_point_count(), 128);
        assert_eq!(tree.leaf_point_count(), 1);
    }

    #[test]
    fn magnitude_zero_bottom_never_splits() {
        let mut registry = registry(4);
        let reader = FakePointsReader::default();

        // 64 identical codes: everything lands in the same lod-0 cell.
        let first = reader.add_batch(input(0), vec![Morton::<3>([5, 0, 0]); 32]);
        let root = initialize(&mut registry, first);

        let second = reader.add_batch(input(1), vec![Morton::<3>([5, 0, 0]); 32]);
        add_points(&mut registry, &reader, root, second).expect("insert succeeds");

        let tree = registry.get(root).expect("tree exists");
        assert_eq!(tree.leaf_point_count(), 64);
        tree.debug_validate();
    }

    #[test]
    fn skips_match_popcount_prefix_sums_after_many_inserts() {
        let mut registry = registry(64);
        let reader = FakePointsReader::default();

        let first = reader.add_batch(input(0), codes(0..32_768, 64));
        let root = initialize(&mut registry, first);

        for idx in 1..16u32 {
            let batch = reader.add_batch(
                input(idx),
                codes(u64::from(idx) * 2_048..32_768, 64),
            );
            add_points(&mut registry, &reader, root, batch).expect("insert succeeds");
        }

        let tree = registry.get(root).expect("tree exists");
        tree.debug_validate();

        // count conservation over the whole forest
        let mut total = tree.leaf_point_count();
        let mut stack = tree.sub_trees.clone();
        while let Some(id) = stack.pop() {
            let sub = registry.get(id).expect("sub-tree exists");
            sub.debug_validate();
            total += sub.leaf_point_count();
            stack.extend(&sub.sub_trees);
        }
        assert_eq!(total, 64 * 16);
    }
}
