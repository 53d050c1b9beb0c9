// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::location::StorageLocation;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};

pub const MAGIC_BYTES: [u8; 4] = [b'J', b'L', b'P', 0];

/// Serialized size of the root record at offset 0.
pub const ROOT_RECORD_SIZE: usize = 128;

/// Each location slot in the record is padded to this width.
const LOCATION_SLOT_SIZE: usize = 24;

/// The fixed-size record at offset 0 pointing at the three top-level
/// structures of the store.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RootIndex {
    /// Location of the serialized free-space map
    pub free_space_map: StorageLocation,

    /// Location of the attribute-config table
    pub attributes: StorageLocation,

    /// Location of the tree registry
    pub tree_registry: StorageLocation,
}

impl RootIndex {
    /// `true` once all three top-level structures have been written.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        !self.free_space_map.is_null() && !self.attributes.is_null() && !self.tree_registry.is_null()
    }
}

fn write_slot<W: Write>(writer: &mut W, location: &StorageLocation) -> Result<(), EncodeError> {
    location.encode_into(writer)?;

    let padding = [0u8; LOCATION_SLOT_SIZE - StorageLocation::serialized_len()];
    writer.write_all(&padding)?;

    Ok(())
}

fn read_slot<R: Read>(reader: &mut R) -> Result<StorageLocation, DecodeError> {
    let location = StorageLocation::decode_from(reader)?;

    let mut padding = [0u8; LOCATION_SLOT_SIZE - StorageLocation::serialized_len()];
    reader.read_exact(&mut padding)?;

    Ok(location)
}

impl Encode for RootIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;

        write_slot(writer, &self.free_space_map)?;
        write_slot(writer, &self.attributes)?;
        write_slot(writer, &self.tree_registry)?;

        let reserved = [0u8; ROOT_RECORD_SIZE - MAGIC_BYTES.len() - 3 * LOCATION_SLOT_SIZE];
        writer.write_all(&reserved)?;

        Ok(())
    }
}

impl Decode for RootIndex {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("RootIndex"));
        }

        let free_space_map = read_slot(reader)?;
        let attributes = read_slot(reader)?;
        let tree_registry = read_slot(reader)?;

        let mut reserved = [0u8; ROOT_RECORD_SIZE - MAGIC_BYTES.len() - 3 * LOCATION_SLOT_SIZE];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            free_space_map,
            attributes,
            tree_registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn record_is_128_bytes() {
        let record = RootIndex {
            free_space_map: StorageLocation::new(128, 40),
            attributes: StorageLocation::new(168, 24),
            tree_registry: StorageLocation::new(192, 300),
        };

        let bytes = record.encode_into_vec();
        assert_eq!(bytes.len(), ROOT_RECORD_SIZE);
        assert_eq!(&bytes[0..4], b"JLP\0");

        let back = RootIndex::decode_from(&mut &bytes[..]).expect("decodes");
        assert_eq!(back, record);
        assert!(back.is_complete());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = RootIndex::default().encode_into_vec();
        bytes[0] = b'X';
        assert!(matches!(
            RootIndex::decode_from(&mut &bytes[..]),
            Err(DecodeError::InvalidHeader("RootIndex"))
        ));
    }

    #[test]
    fn empty_record_is_incomplete() {
        assert!(!RootIndex::default().is_complete());
    }
}
