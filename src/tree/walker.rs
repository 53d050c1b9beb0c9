// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Frustum-culled tree walk producing the per-frame draw groups.

use super::{Tree, TreeId, TreeRegistry};
use crate::{
    aabb::Aabb,
    frustum::{Containment, Frustum},
    input::InputId,
    morton::Morton192,
    storage::StorageLocation,
    InputRegistry,
};
use cgmath::Matrix4;

/// Primitive kind a draw group renders as.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DrawType {
    AabbTriangleMesh,
    SkyboxTriangle,
    FlatPoints,
    DynPoints1,
    DynPoints3,
}

/// One renderable subset of a visible node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DrawEntry {
    pub tree_id: TreeId,
    pub level: u8,
    pub index: u32,
    pub input_id: InputId,
    pub offset: u64,
    pub count: u64,
}

/// A buffer the renderer must have resident to draw a group.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferRef {
    pub input_id: InputId,

    /// Which attribute column of the chunk
    pub attribute_index: u32,

    pub location: StorageLocation,
}

/// A batch of draw entries sharing one draw type.
#[derive(Clone, Debug)]
pub struct DrawGroup {
    pub draw_type: DrawType,
    pub entries: Vec<DrawEntry>,

    /// Union of buffers referenced by the entries
    pub buffers: Vec<BufferRef>,

    /// Total number of points drawn by the group
    pub draw_size: u64,
}

/// Result of one frustum walk.
#[derive(Clone, Debug, Default)]
pub struct WalkResult {
    pub groups: Vec<DrawGroup>,

    /// World box of the root tree (identity if the forest is empty)
    pub tree_aabb: Aabb,
}

/// Walks the forest depth-first, emitting draw groups for every node whose
/// cell intersects the view frustum.
#[must_use]
pub fn walk_tree(
    registry: &TreeRegistry,
    inputs: &InputRegistry,
    view_projection: &Matrix4<f64>,
) -> WalkResult {
    let mut result = WalkResult::default();

    let Some(root) = registry.root() else {
        return result;
    };
    let Some(tree) = registry.get(root) else {
        return result;
    };

    let frustum = Frustum::from_view_projection(view_projection);
    let scale = registry.config.scale;
    let offset = registry.config.offset;

    result.tree_aabb = Aabb::from_morton_range(tree.morton_min, tree.morton_max, scale, offset);

    let mut entries = Vec::new();
    let mut buffers = Vec::new();
    walk_one_tree(registry, inputs, &frustum, tree, &mut entries, &mut buffers);

    if !entries.is_empty() {
        let draw_size = entries.iter().map(|entry| entry.count).sum();

        buffers.sort_by_key(|buffer: &BufferRef| (buffer.input_id, buffer.attribute_index));
        buffers.dedup();

        result.groups.push(DrawGroup {
            draw_type: DrawType::FlatPoints,
            entries,
            buffers,
            draw_size,
        });
    }

    result
}

fn walk_one_tree(
    registry: &TreeRegistry,
    inputs: &InputRegistry,
    frustum: &Frustum,
    tree: &Tree,
    entries: &mut Vec<DrawEntry>,
    buffers: &mut Vec<BufferRef>,
) {
    if tree.nodes[0].is_empty() {
        return;
    }

    let scale = registry.config.scale;
    let offset = registry.config.offset;

    let aabb = Aabb::from_morton_range(tree.morton_min, tree.morton_max, scale, offset);
    let containment = frustum.classify_aabb(&aabb);
    if containment == Containment::Outside {
        return;
    }

    // (level, row, cell_min, cull)
    let mut stack: Vec<(usize, usize, Morton192, bool)> =
        vec![(0, 0, tree.morton_min, containment == Containment::Intersects)];

    while let Some((level, skip, cell_min, cull)) = stack.pop() {
        let lod = tree.level_lod(level);

        let mut cull = cull;
        if cull {
            let cell_max = cell_min | Morton192::mask_for_lod(lod);
            let cell_aabb = Aabb::from_morton_range(cell_min, cell_max, scale, offset);

            match frustum.classify_aabb(&cell_aabb) {
                Containment::Outside => continue,
                Containment::Inside => cull = false,
                Containment::Intersects => {}
            }
        }

        emit_node(inputs, tree, level, skip, entries, buffers);

        let mask = tree.nodes[level][skip];
        if mask == 0 {
            continue;
        }

        let mut rank = 0usize;
        for child in 0u8..8 {
            if mask & (1u8 << child) == 0 {
                continue;
            }

            let pos = tree.skips[level][skip] as usize + rank;
            rank += 1;

            let mut child_min = cell_min;
            child_min.set_child_at(lod, child);

            if level < 4 {
                stack.push((level + 1, pos, child_min, cull));
            } else if let Some(sub_tree) = registry.get(tree.sub_trees[pos]) {
                walk_one_tree(registry, inputs, frustum, sub_tree, entries, buffers);
            }
        }
    }
}

fn emit_node(
    inputs: &InputRegistry,
    tree: &Tree,
    level: usize,
    skip: usize,
    entries: &mut Vec<DrawEntry>,
    buffers: &mut Vec<BufferRef>,
) {
    let collection = &tree.data[level][skip];
    if collection.is_empty() {
        return;
    }

    for subset in &collection.data {
        #[allow(clippy::cast_possible_truncation)]
        entries.push(DrawEntry {
            tree_id: tree.id,
            level: level as u8,
            index: skip as u32,
            input_id: subset.input_id,
            offset: subset.offset,
            count: subset.count,
        });

        if let Some((_, locations)) = inputs.storage_locations(subset.input_id) {
            for (attribute_index, location) in locations.into_iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                buffers.push(BufferRef {
                    input_id: subset.input_id,
                    attribute_index: attribute_index as u32,
                    location,
                });
            }
        }
    }
}
