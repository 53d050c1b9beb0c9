// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background LOD generation.
//!
//! Once the ingestion watermark passes a node's cell, the node's children
//! are final and a down-sampled copy of their points can be synthesized.
//! Work proceeds in waves from the leaves up: a node becomes eligible only
//! when every child is materialized (has leaf data or an already generated
//! LOD), so a parent LOD is never published before its descendants'.

use super::{PointsCollection, PointsSubset, Tree, TreeConfig, TreeId, TreeRegistry};
use crate::{
    aabb::morton_to_pos,
    attributes::{AttributesId, AttributesRegistry},
    format::{PointFormat, ScalarType},
    input::InputId,
    morton::{Morton, Morton192},
    storage::{deserialize_points, PointCloudHeader, StorageHandler, StorageHeader},
    InputRegistry, Slice,
};
use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashSet;

/// One node whose LOD can be synthesized now.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LodWork {
    pub tree_id: TreeId,
    pub level: usize,
    pub skip: usize,

    /// Lattice LOD of the target node
    pub target_lod: u32,

    /// The children's subsets, in child order (their concatenation is
    /// Morton-sorted)
    pub sources: Vec<PointsSubset>,
}

/// Key identifying an in-flight generation.
pub type LodPendingKey = (TreeId, usize, usize);

/// Walks the forest from the watermark and collects every node that is
/// ready for LOD generation this wave.
#[must_use]
pub fn collect_work(
    registry: &TreeRegistry,
    watermark: Morton192,
    pending: &FxHashSet<LodPendingKey>,
) -> Vec<LodWork> {
    let mut work = Vec::new();

    if let Some(root) = registry.root() {
        if let Some(tree) = registry.get(root) {
            collect_in_tree(registry, tree, 0, 0, tree.morton_min, watermark, pending, &mut work);
        }
    }

    work
}

/// Returns `true` if the node already carries data (leaf points or a
/// generated LOD); pushes work for nodes that can be generated this wave.
#[allow(clippy::too_many_arguments)]
fn collect_in_tree(
    registry: &TreeRegistry,
    tree: &Tree,
    level: usize,
    skip: usize,
    cell_min: Morton192,
    watermark: Morton192,
    pending: &FxHashSet<LodPendingKey>,
    work: &mut Vec<LodWork>,
) -> bool {
    let mask = tree.nodes[level][skip];
    let lod = tree.level_lod(level);

    if mask == 0 {
        return true;
    }

    let mut children_ready = true;
    let mut sources = Vec::new();
    let mut rank = 0usize;

    for child in 0u8..8 {
        if mask & (1u8 << child) == 0 {
            continue;
        }

        let pos = tree.skips[level][skip] as usize + rank;
        rank += 1;

        let mut child_min = cell_min;
        child_min.set_child_at(lod, child);

        let child_ready = if level < 4 {
            let ready = collect_in_tree(
                registry,
                tree,
                level + 1,
                pos,
                child_min,
                watermark,
                pending,
                work,
            );
            if ready {
                sources.extend(tree.data[level + 1][pos].data.iter().copied());
            }
            ready
        } else if let Some(sub_tree) = registry.get(tree.sub_trees[pos]) {
            let ready = collect_in_tree(
                registry,
                sub_tree,
                0,
                0,
                sub_tree.morton_min,
                watermark,
                pending,
                work,
            );
            if ready {
                sources.extend(sub_tree.data[0][0].data.iter().copied());
            }
            ready
        } else {
            false
        };

        children_ready &= child_ready;
    }

    if !tree.data[level][skip].is_empty() {
        return true;
    }

    let cell_max = cell_min | Morton192::mask_for_lod(lod);

    if children_ready
        && cell_max < watermark
        && !sources.is_empty()
        && !pending.contains(&(tree.id, level, skip))
    {
        work.push(LodWork {
            tree_id: tree.id,
            level,
            skip,
            target_lod: lod,
            sources,
        });
    }

    false
}

struct LoadedChunk {
    codes: std::sync::Arc<Vec<Morton192>>,
    attributes_id: AttributesId,
    formats: Vec<PointFormat>,
    buffers: Vec<Slice>,
}

fn load_chunk(
    input_id: InputId,
    storage: &StorageHandler,
    inputs: &InputRegistry,
    attributes: &AttributesRegistry,
) -> crate::Result<LoadedChunk> {
    let (attributes_id, locations) = inputs
        .storage_locations(input_id)
        .ok_or(crate::Error::Unrecoverable)?;

    let position_blob = storage.read_sync(*locations.first().ok_or(crate::Error::Unrecoverable)?)?;
    let (header, position_data) = deserialize_points(&position_blob)?;

    let codes = std::sync::Arc::new(super::decode_morton_column(&header, &position_data)?);

    let attribute_set = attributes.get(attributes_id);
    let formats = attribute_set
        .attributes
        .iter()
        .map(|attribute| attribute.format)
        .collect::<Vec<_>>();

    let mut buffers = vec![position_data];
    for location in locations.iter().skip(1) {
        buffers.push(storage.read_sync(*location)?);
    }

    Ok(LoadedChunk {
        codes,
        attributes_id,
        formats,
        buffers,
    })
}

fn read_component(buffer: &[u8], format: PointFormat, row: usize, component: usize) -> f64 {
    let stride = format.stride();
    let offset = row * stride + component * format.scalar.size();
    let bytes = &buffer[offset..offset + format.scalar.size()];

    match format.scalar {
        ScalarType::U8 => f64::from(bytes[0]),
        #[allow(clippy::cast_possible_wrap)]
        ScalarType::I8 => f64::from(bytes[0] as i8),
        ScalarType::U16 => f64::from(LittleEndian::read_u16(bytes)),
        ScalarType::I16 => f64::from(LittleEndian::read_i16(bytes)),
        ScalarType::U32 => f64::from(LittleEndian::read_u32(bytes)),
        ScalarType::I32 => f64::from(LittleEndian::read_i32(bytes)),
        ScalarType::F32 => f64::from(LittleEndian::read_f32(bytes)),
        #[allow(clippy::cast_precision_loss)]
        ScalarType::U64 => LittleEndian::read_u64(bytes) as f64,
        #[allow(clippy::cast_precision_loss)]
        ScalarType::I64 => LittleEndian::read_i64(bytes) as f64,
        ScalarType::F64 => LittleEndian::read_f64(bytes),
        _ => 0.0,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn write_component(out: &mut Vec<u8>, scalar: ScalarType, value: f64) {
    match scalar {
        ScalarType::U8 => out.push(value.round().clamp(0.0, f64::from(u8::MAX)) as u8),
        ScalarType::I8 => out.push(
            (value.round().clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8) as u8,
        ),
        ScalarType::U16 => {
            let mut bytes = [0u8; 2];
            LittleEndian::write_u16(
                &mut bytes,
                value.round().clamp(0.0, f64::from(u16::MAX)) as u16,
            );
            out.extend_from_slice(&bytes);
        }
        ScalarType::I16 => {
            let mut bytes = [0u8; 2];
            LittleEndian::write_i16(
                &mut bytes,
                value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16,
            );
            out.extend_from_slice(&bytes);
        }
        ScalarType::U32 => {
            let mut bytes = [0u8; 4];
            LittleEndian::write_u32(
                &mut bytes,
                value.round().clamp(0.0, f64::from(u32::MAX)) as u32,
            );
            out.extend_from_slice(&bytes);
        }
        ScalarType::I32 => {
            let mut bytes = [0u8; 4];
            LittleEndian::write_i32(
                &mut bytes,
                value.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32,
            );
            out.extend_from_slice(&bytes);
        }
        ScalarType::F32 => {
            let mut bytes = [0u8; 4];
            LittleEndian::write_f32(&mut bytes, value as f32);
            out.extend_from_slice(&bytes);
        }
        ScalarType::U64 => {
            let mut bytes = [0u8; 8];
            LittleEndian::write_u64(&mut bytes, value.round().max(0.0) as u64);
            out.extend_from_slice(&bytes);
        }
        ScalarType::I64 => {
            let mut bytes = [0u8; 8];
            LittleEndian::write_i64(&mut bytes, value.round() as i64);
            out.extend_from_slice(&bytes);
        }
        ScalarType::F64 => {
            let mut bytes = [0u8; 8];
            LittleEndian::write_f64(&mut bytes, value);
            out.extend_from_slice(&bytes);
        }
        _ => {}
    }
}

/// The boundaries of the `target` stride windows over `total` source rows.
#[must_use]
pub fn stride_windows(total: u64, target: u64) -> Vec<(u64, u64)> {
    debug_assert!(target >= 1 && target <= total);
    (0..target)
        .map(|idx| (idx * total / target, (idx + 1) * total / target))
        .collect()
}

/// Synthesizes the down-sampled buffers of one LOD node.
///
/// Runs on a worker thread; reads the source blobs through the storage
/// loop, stride-samples the merged Morton column and aggregates or samples
/// the remaining attributes per target cell.
pub fn generate(
    work: &LodWork,
    target_input: InputId,
    storage: &StorageHandler,
    inputs: &InputRegistry,
    attributes: &AttributesRegistry,
    config: TreeConfig,
) -> crate::Result<(StorageHeader, AttributesId, Vec<Slice>)> {
    // Load every distinct source chunk once.
    let mut chunk_ids = Vec::new();
    for subset in &work.sources {
        if !chunk_ids.contains(&subset.input_id) {
            chunk_ids.push(subset.input_id);
        }
    }

    let mut chunks = Vec::with_capacity(chunk_ids.len());
    for input_id in &chunk_ids {
        chunks.push(load_chunk(*input_id, storage, inputs, attributes)?);
    }

    let chunk_index = |input_id: InputId| {
        chunk_ids
            .iter()
            .position(|candidate| *candidate == input_id)
            .unwrap_or_else(|| unreachable!("chunk was loaded"))
    };

    // Global row table over all source windows, merge-sorted by code.
    // Sibling subsets may overlap (a leaf keeps included batches whole), so
    // plain concatenation in child order is not enough.
    let mut rows = Vec::new();
    for subset in &work.sources {
        let chunk_idx = chunk_index(subset.input_id);
        for row in subset.offset..subset.offset + subset.count {
            let row = row as usize;
            rows.push((chunks[chunk_idx].codes[row], chunk_idx, row));
        }
    }
    rows.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let total = rows.len() as u64;
    debug_assert!(total > 0);

    let target = (total / 8).clamp(1, config.node_limit).min(total);
    let windows = stride_windows(total, target);

    let locate = |global_row: u64| -> (usize, usize) {
        let (_, chunk_idx, row) = rows[global_row as usize];
        (chunk_idx, row)
    };

    // Sample the position column.
    let sampled = windows
        .iter()
        .map(|(start, _)| rows[*start as usize].0)
        .collect::<Vec<_>>();

    debug_assert!(sampled.windows(2).all(|pair| pair[0] <= pair[1]));

    let morton_min = *sampled.first().unwrap_or_else(|| unreachable!("target >= 1"));
    let morton_max = *sampled.last().unwrap_or_else(|| unreachable!("target >= 1"));

    let position_scalar = ScalarType::morton_for_msb(morton_max.msb());

    let source_ids = chunks
        .iter()
        .map(|chunk| chunk.attributes_id)
        .collect::<Vec<_>>();
    let mapping = attributes.lod_mapping(position_scalar, &source_ids);
    let extra_info = attributes.extra_info(mapping.destination_id);

    // Position buffer, truncated to the narrowest covering Morton width.
    let mut position_bytes = Vec::with_capacity(sampled.len() * position_scalar.size());
    for code in &sampled {
        let mut bytes = [0u8; 24];
        match position_scalar {
            ScalarType::Morton32 => {
                #[allow(clippy::cast_possible_truncation)]
                LittleEndian::write_u32(&mut bytes[0..4], code.0[0] as u32);
            }
            ScalarType::Morton64 => LittleEndian::write_u64(&mut bytes[0..8], code.0[0]),
            ScalarType::Morton128 => {
                LittleEndian::write_u64(&mut bytes[0..8], code.0[0]);
                LittleEndian::write_u64(&mut bytes[8..16], code.0[1]);
            }
            _ => {
                LittleEndian::write_u64(&mut bytes[0..8], code.0[0]);
                LittleEndian::write_u64(&mut bytes[8..16], code.0[1]);
                LittleEndian::write_u64(&mut bytes[16..24], code.0[2]);
            }
        }
        position_bytes.extend_from_slice(&bytes[0..position_scalar.size()]);
    }

    let mut buffers = vec![Slice::from(position_bytes)];

    // Remaining attributes: first sample per window, or the window average
    // for accumulative attributes.
    for (dest_index, dest_format) in mapping.destination.iter().enumerate().skip(1) {
        let accumulative = extra_info
            .get(dest_index)
            .is_some_and(|info| info.is_accumulative);

        let mut column = Vec::with_capacity(windows.len() * dest_format.stride());

        for (start, end) in &windows {
            for component in 0..usize::from(dest_format.components) {
                let value = if accumulative {
                    let mut sum = 0.0;
                    let mut n = 0u64;
                    for global_row in *start..*end {
                        let (chunk_idx, row) = locate(global_row);
                        let chunk = &chunks[chunk_idx];
                        if let Some(Some(source)) = mapping
                            .source_mapping(chunk.attributes_id)
                            .map(|m| m.attributes.get(dest_index).cloned().flatten())
                        {
                            sum += read_component(
                                &chunk.buffers[source.index],
                                chunk.formats[source.index],
                                row,
                                component,
                            );
                            n += 1;
                        }
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let average = if n == 0 { 0.0 } else { sum / n as f64 };
                    average
                } else {
                    let (chunk_idx, row) = locate(*start);
                    let chunk = &chunks[chunk_idx];
                    mapping
                        .source_mapping(chunk.attributes_id)
                        .and_then(|m| m.attributes.get(dest_index).cloned().flatten())
                        .map_or(0.0, |source| {
                            read_component(
                                &chunk.buffers[source.index],
                                chunk.formats[source.index],
                                row,
                                component,
                            )
                        })
                };

                write_component(&mut column, dest_format.scalar, value);
            }
        }

        buffers.push(Slice::from(column));
    }

    let header = StorageHeader::new(
        target_input,
        PointCloudHeader {
            point_count: target,
            offset: config.offset,
            scale: [config.scale; 3],
            min: morton_to_pos(config.scale, config.offset, morton_min),
            max: morton_to_pos(config.scale, config.offset, morton_max),
        },
        morton_min,
        morton_max,
        PointFormat::new(position_scalar, 1),
    );

    log::trace!(
        "generated lod node {}@{}/{}: {} -> {} points",
        work.tree_id,
        work.level,
        work.skip,
        total,
        target,
    );

    Ok((header, mapping.destination_id, buffers))
}

/// Grafts a completed LOD write into its node.
pub fn graft(
    registry: &mut TreeRegistry,
    work: &LodWork,
    header: &StorageHeader,
) -> crate::Result<()> {
    let tree = registry
        .get_mut(work.tree_id)
        .ok_or(crate::Error::Unrecoverable)?;

    let mut collection = PointsCollection::default();
    collection.add(
        PointsSubset {
            input_id: header.input_id,
            offset: 0,
            count: header.public_header.point_count,
        },
        header.morton_min,
        header.morton_max,
        header.lod_span,
    );

    // An insertion may have raced the generation and invalidated the node;
    // in that case the fresh LOD is already stale and is dropped by the
    // caller.
    if !tree.data[work.level][work.skip].is_empty() {
        return Err(crate::Error::Unrecoverable);
    }

    tree.data[work.level][work.skip] = collection;
    Ok(())
}
