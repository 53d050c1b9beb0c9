// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Scalar storage type of one attribute component.
///
/// The `Morton*` tags mark Morton-coded position columns; decoders interpret
/// the leading attribute of a blob differently for these.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ScalarType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    Morton32 = 6,
    F32 = 7,
    U64 = 8,
    I64 = 9,
    Morton64 = 10,
    F64 = 11,
    Morton128 = 12,
    Morton192 = 13,
}

impl ScalarType {
    /// Size in bytes of one component.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::Morton32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::Morton64 | Self::F64 => 8,
            Self::Morton128 => 16,
            Self::Morton192 => 24,
        }
    }

    /// Whether this type stores an interleaved Morton position.
    #[must_use]
    pub const fn is_morton(self) -> bool {
        matches!(
            self,
            Self::Morton32 | Self::Morton64 | Self::Morton128 | Self::Morton192
        )
    }

    /// The narrowest Morton storage type whose bit width covers `msb`.
    #[must_use]
    pub const fn morton_for_msb(msb: u32) -> Self {
        if msb < 32 {
            Self::Morton32
        } else if msb < 64 {
            Self::Morton64
        } else if msb < 128 {
            Self::Morton128
        } else {
            Self::Morton192
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::Morton32,
            7 => Self::F32,
            8 => Self::U64,
            9 => Self::I64,
            10 => Self::Morton64,
            11 => Self::F64,
            12 => Self::Morton128,
            13 => Self::Morton192,
            _ => return None,
        })
    }
}

/// Storage format of one attribute: scalar type and component count.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PointFormat {
    pub scalar: ScalarType,
    pub components: u8,
}

impl PointFormat {
    #[must_use]
    pub const fn new(scalar: ScalarType, components: u8) -> Self {
        Self { scalar, components }
    }

    /// Size in bytes of one point's worth of this attribute.
    #[must_use]
    pub const fn stride(self) -> usize {
        self.scalar.size() * self.components as usize
    }
}

impl Encode for PointFormat {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.scalar as u8)?;
        writer.write_u8(self.components)?;
        Ok(())
    }
}

impl Decode for PointFormat {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        let scalar =
            ScalarType::from_u8(tag).ok_or(DecodeError::InvalidTag(("ScalarType", tag)))?;
        let components = reader.read_u8()?;
        Ok(Self { scalar, components })
    }
}
