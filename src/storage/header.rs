// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    format::PointFormat,
    input::InputId,
    morton::{Morton, Morton192},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// The public per-input header filled by the reader's `init` callback.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PointCloudHeader {
    pub point_count: u64,

    /// World offset `o` of the lattice: `pos = decoded * scale + offset`
    pub offset: [f64; 3],

    /// World scale `s` of the lattice
    pub scale: [f64; 3],

    /// World-space bounding box
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for PointCloudHeader {
    fn default() -> Self {
        Self {
            point_count: 0,
            offset: [0.0; 3],
            scale: [0.0; 3],
            min: [f64::MAX; 3],
            max: [f64::MIN; 3],
        }
    }
}

fn write_vec3<W: Write>(writer: &mut W, v: &[f64; 3]) -> Result<(), EncodeError> {
    for component in v {
        writer.write_f64::<LittleEndian>(*component)?;
    }
    Ok(())
}

fn read_vec3<R: Read>(reader: &mut R) -> Result<[f64; 3], DecodeError> {
    let mut v = [0.0; 3];
    for component in &mut v {
        *component = reader.read_f64::<LittleEndian>()?;
    }
    Ok(v)
}

/// Header persisted in front of every point blob.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StorageHeader {
    pub input_id: InputId,
    pub public_header: PointCloudHeader,
    pub morton_min: Morton192,
    pub morton_max: Morton192,
    pub point_format: PointFormat,

    /// `msb(morton_max ^ morton_min) / 3`
    pub lod_span: u8,
}

impl StorageHeader {
    /// Creates a header over a sorted batch's Morton range.
    #[must_use]
    pub fn new(
        input_id: InputId,
        public_header: PointCloudHeader,
        morton_min: Morton192,
        morton_max: Morton192,
        point_format: PointFormat,
    ) -> Self {
        let mut header = Self {
            input_id,
            public_header,
            morton_min,
            morton_max,
            point_format,
            lod_span: 0,
        };
        header.recompute_lod_span();
        header
    }

    /// Recomputes the LOD span from the Morton range.
    pub fn recompute_lod_span(&mut self) {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.lod_span = self.morton_min.first_differing_lod(&self.morton_max) as u8;
        }
    }

    #[must_use]
    pub const fn serialized_len() -> usize {
        // input id
        2 * std::mem::size_of::<u32>()
        // point count
            + std::mem::size_of::<u64>()
        // offset, scale, min, max
            + 4 * 3 * std::mem::size_of::<f64>()
        // morton min, max
            + 2 * 24
        // point format
            + 2
        // lod span
            + 1
    }
}

impl Encode for StorageHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.input_id.data)?;
        writer.write_u32::<LittleEndian>(self.input_id.sub)?;

        writer.write_u64::<LittleEndian>(self.public_header.point_count)?;
        write_vec3(writer, &self.public_header.offset)?;
        write_vec3(writer, &self.public_header.scale)?;
        write_vec3(writer, &self.public_header.min)?;
        write_vec3(writer, &self.public_header.max)?;

        self.morton_min.encode_into(writer)?;
        self.morton_max.encode_into(writer)?;

        self.point_format.encode_into(writer)?;
        writer.write_u8(self.lod_span)?;

        Ok(())
    }
}

impl Decode for StorageHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let data = reader.read_u32::<LittleEndian>()?;
        let sub = reader.read_u32::<LittleEndian>()?;

        let point_count = reader.read_u64::<LittleEndian>()?;
        let offset = read_vec3(reader)?;
        let scale = read_vec3(reader)?;
        let min = read_vec3(reader)?;
        let max = read_vec3(reader)?;

        let morton_min = Morton192::decode_from(reader)?;
        let morton_max = Morton192::decode_from(reader)?;

        let point_format = PointFormat::decode_from(reader)?;
        let lod_span = reader.read_u8()?;

        Ok(Self {
            input_id: InputId { data, sub },
            public_header: PointCloudHeader {
                point_count,
                offset,
                scale,
                min,
                max,
            },
            morton_min,
            morton_max,
            point_format,
            lod_span,
        })
    }
}
