// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Address of one blob inside the backing file.
///
/// `file_id` is reserved for a future multi-file extension and is always 0.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct StorageLocation {
    pub file_id: u32,
    pub size: u32,
    pub offset: u64,
}

impl StorageLocation {
    #[must_use]
    pub const fn new(offset: u64, size: u32) -> Self {
        Self {
            file_id: 0,
            size,
            offset,
        }
    }

    /// A location that addresses nothing.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.size == 0 && self.offset == 0 && self.file_id == 0
    }

    #[must_use]
    pub const fn serialized_len() -> usize {
        std::mem::size_of::<u32>() + std::mem::size_of::<u32>() + std::mem::size_of::<u64>()
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.file_id, self.offset, self.size)
    }
}

impl Encode for StorageLocation {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.file_id)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u64::<LittleEndian>(self.offset)?;
        Ok(())
    }
}

impl Decode for StorageLocation {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let file_id = reader.read_u32::<LittleEndian>()?;
        let size = reader.read_u32::<LittleEndian>()?;
        let offset = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            file_id,
            size,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn location_roundtrip() {
        let location = StorageLocation::new(1234, 56);
        let bytes = location.encode_into_vec();
        assert_eq!(bytes.len(), StorageLocation::serialized_len());

        let back = StorageLocation::decode_from(&mut &bytes[..]).expect("decodes");
        assert_eq!(back, location);
        assert!(!back.is_null());
        assert!(StorageLocation::default().is_null());
    }
}
