// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sort worker: Morton-encodes a batch, sorts it and reorders the
//! attribute columns to match.

use crate::{
    aabb::{morton_to_pos, pos_to_morton},
    attributes::{Attributes, AttributesId, AttributesRegistry},
    format::{PointFormat, ScalarType},
    input::InputId,
    morton::Morton192,
    storage::{PointCloudHeader, StorageHeader},
    tree::TreeConfig,
    Slice,
};
use byteorder::{ByteOrder, LittleEndian};

use super::source::AttributeBuffers;

/// A Morton-sorted batch ready for the storage handler.
#[derive(Clone, Debug)]
pub struct SortedBatch {
    pub header: StorageHeader,
    pub attributes_id: AttributesId,
    pub buffers: Vec<Slice>,
}

fn world_position(
    buffer: &[u8],
    row: usize,
    format: PointFormat,
    header: &PointCloudHeader,
) -> crate::Result<[f64; 3]> {
    debug_assert_eq!(format.components, 3);
    let stride = format.stride();
    let component_size = format.scalar.size();
    let base = row * stride;

    let mut pos = [0.0f64; 3];
    for (axis, value) in pos.iter_mut().enumerate() {
        let bytes = &buffer[base + axis * component_size..base + (axis + 1) * component_size];
        let raw = match format.scalar {
            ScalarType::I32 => f64::from(LittleEndian::read_i32(bytes)),
            ScalarType::U32 => f64::from(LittleEndian::read_u32(bytes)),
            ScalarType::I64 => {
                #[allow(clippy::cast_precision_loss)]
                let raw = LittleEndian::read_i64(bytes) as f64;
                raw
            }
            ScalarType::F64 => LittleEndian::read_f64(bytes),
            ScalarType::F32 => f64::from(LittleEndian::read_f32(bytes)),
            _ => {
                return Err(crate::Error::Decode(
                    crate::coding::DecodeError::InvalidTag((
                        "position column",
                        format.scalar as u8,
                    )),
                ))
            }
        };
        *value = raw * header.scale[axis] + header.offset[axis];
    }

    Ok(pos)
}

/// Morton-encodes, sorts and repacks one batch.
///
/// The position column is rewritten into the narrowest Morton format that
/// covers the batch; every other column is permuted into the sorted order.
/// The batch's attribute set (with the rewritten position format) is
/// interned so equal input schemas share one id.
pub fn sort_batch(
    chunk_id: InputId,
    public_header: &PointCloudHeader,
    attributes: &Attributes,
    buffers: &AttributeBuffers,
    registry: &AttributesRegistry,
    lattice: &TreeConfig,
) -> crate::Result<SortedBatch> {
    let position_format = attributes.attributes[0].format;
    let position_buffer = &buffers.buffers[0];

    let count = position_buffer.len() / position_format.stride();
    debug_assert!(count > 0);

    // Encode into the store's fixed lattice.
    let mut codes = Vec::with_capacity(count);
    for row in 0..count {
        let pos = world_position(position_buffer, row, position_format, public_header)?;
        #[allow(clippy::cast_possible_truncation)]
        codes.push((
            pos_to_morton(lattice.scale, lattice.offset, pos),
            row as u32,
        ));
    }

    codes.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let morton_min = codes[0].0;
    let morton_max = codes[count - 1].0;
    let position_scalar = ScalarType::morton_for_msb(morton_max.msb());

    // Rewrite the position column in sorted Morton order.
    let mut position_bytes = Vec::with_capacity(count * position_scalar.size());
    for (code, _) in &codes {
        let mut bytes = [0u8; 24];
        LittleEndian::write_u64(&mut bytes[0..8], code.0[0]);
        LittleEndian::write_u64(&mut bytes[8..16], code.0[1]);
        LittleEndian::write_u64(&mut bytes[16..24], code.0[2]);
        position_bytes.extend_from_slice(&bytes[0..position_scalar.size()]);
    }

    let mut out_buffers = Vec::with_capacity(buffers.buffers.len());
    out_buffers.push(Slice::from(position_bytes));

    // Permute the remaining columns.
    for (attribute, buffer) in attributes
        .attributes
        .iter()
        .zip(&buffers.buffers)
        .skip(1)
    {
        let stride = attribute.format.stride();
        debug_assert_eq!(buffer.len(), count * stride);

        let mut column = Vec::with_capacity(buffer.len());
        for (_, source_row) in &codes {
            let base = *source_row as usize * stride;
            column.extend_from_slice(&buffer[base..base + stride]);
        }
        out_buffers.push(Slice::from(column));
    }

    let attributes_id = registry.intern(attributes.with_position_format(position_scalar));

    let mut sorted_header = *public_header;
    sorted_header.point_count = count as u64;
    sorted_header.min = morton_to_pos(lattice.scale, lattice.offset, morton_min);
    sorted_header.max = morton_to_pos(lattice.scale, lattice.offset, morton_max);

    let header = StorageHeader::new(
        chunk_id,
        sorted_header,
        morton_min,
        morton_max,
        PointFormat::new(position_scalar, 1),
    );

    Ok(SortedBatch {
        header,
        attributes_id,
        buffers: out_buffers,
    })
}
