// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk form of trees and the tree registry.
//!
//! Each tree serializes into its own blob; the registry blob carries the
//! tree config, the root id, the per-tree blob locations and the
//! chunk-location table the subsets reference.

use super::{PointsCollection, PointsSubset, Tree, TreeConfig, TreeId, TreeRegistry};
use crate::{
    attributes::AttributesId,
    coding::{Decode, DecodeError, Encode, EncodeError},
    input::InputId,
    morton::{Morton, Morton192},
    storage::{StorageHandler, StorageLocation},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const NO_ROOT: u32 = u32::MAX;

impl Encode for PointsCollection {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.point_count)?;
        self.morton_min.encode_into(writer)?;
        self.morton_max.encode_into(writer)?;
        writer.write_u8(self.min_lod)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.data.len() as u32)?;

        for subset in &self.data {
            writer.write_u32::<LittleEndian>(subset.input_id.data)?;
            writer.write_u32::<LittleEndian>(subset.input_id.sub)?;
            writer.write_u64::<LittleEndian>(subset.offset)?;
            writer.write_u64::<LittleEndian>(subset.count)?;
        }

        Ok(())
    }
}

impl Decode for PointsCollection {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let point_count = reader.read_u64::<LittleEndian>()?;
        let morton_min = Morton192::decode_from(reader)?;
        let morton_max = Morton192::decode_from(reader)?;
        let min_lod = reader.read_u8()?;

        let subset_count = reader.read_u32::<LittleEndian>()?;
        let mut data = Vec::with_capacity(subset_count as usize);

        for _ in 0..subset_count {
            let input_data = reader.read_u32::<LittleEndian>()?;
            let input_sub = reader.read_u32::<LittleEndian>()?;
            let offset = reader.read_u64::<LittleEndian>()?;
            let count = reader.read_u64::<LittleEndian>()?;

            data.push(PointsSubset {
                input_id: InputId {
                    data: input_data,
                    sub: input_sub,
                },
                offset,
                count,
            });
        }

        Ok(Self {
            point_count,
            morton_min,
            morton_max,
            min_lod,
            data,
        })
    }
}

impl Encode for Tree {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.id.0)?;
        writer.write_u32::<LittleEndian>(self.magnitude)?;
        self.morton_min.encode_into(writer)?;
        self.morton_max.encode_into(writer)?;

        for level in 0..5 {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<LittleEndian>(self.nodes[level].len() as u32)?;

            writer.write_all(&self.nodes[level])?;

            for skip in &self.skips[level] {
                writer.write_u32::<LittleEndian>(*skip)?;
            }

            for collection in &self.data[level] {
                collection.encode_into(writer)?;
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.sub_trees.len() as u32)?;
        for sub_tree in &self.sub_trees {
            writer.write_u32::<LittleEndian>(sub_tree.0)?;
        }

        Ok(())
    }
}

impl Decode for Tree {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let id = TreeId(reader.read_u32::<LittleEndian>()?);
        let magnitude = reader.read_u32::<LittleEndian>()?;
        let morton_min = Morton192::decode_from(reader)?;
        let morton_max = Morton192::decode_from(reader)?;

        let mut tree = Tree {
            id,
            magnitude,
            morton_min,
            morton_max,
            ..Tree::default()
        };

        for level in 0..5 {
            let row_count = reader.read_u32::<LittleEndian>()? as usize;

            let mut nodes = vec![0u8; row_count];
            reader.read_exact(&mut nodes)?;
            tree.nodes[level] = nodes;

            let mut skips = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                skips.push(reader.read_u32::<LittleEndian>()?);
            }
            tree.skips[level] = skips;

            let mut data = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                data.push(PointsCollection::decode_from(reader)?);
            }
            tree.data[level] = data;
        }

        let sub_tree_count = reader.read_u32::<LittleEndian>()?;
        for _ in 0..sub_tree_count {
            tree.sub_trees
                .push(TreeId(reader.read_u32::<LittleEndian>()?));
        }

        Ok(tree)
    }
}

/// The registry blob: config, root id, tree-blob locations and the
/// chunk-location table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeRegistryBlob {
    pub config: Option<TreeConfig>,
    pub root: Option<TreeId>,
    pub trees: Vec<(TreeId, StorageLocation)>,
    pub chunk_locations: Vec<(InputId, AttributesId, Vec<StorageLocation>)>,
}

impl Encode for TreeRegistryBlob {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let config = self.config.unwrap_or_default();
        writer.write_u8(u8::from(self.config.is_some()))?;
        writer.write_f64::<LittleEndian>(config.scale)?;
        for component in &config.offset {
            writer.write_f64::<LittleEndian>(*component)?;
        }
        writer.write_u64::<LittleEndian>(config.node_limit)?;

        writer.write_u32::<LittleEndian>(self.root.map_or(NO_ROOT, |root| root.0))?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.trees.len() as u32)?;
        for (id, location) in &self.trees {
            writer.write_u32::<LittleEndian>(id.0)?;
            location.encode_into(writer)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.chunk_locations.len() as u32)?;
        for (input_id, attributes_id, locations) in &self.chunk_locations {
            writer.write_u32::<LittleEndian>(input_id.data)?;
            writer.write_u32::<LittleEndian>(input_id.sub)?;
            writer.write_u32::<LittleEndian>(attributes_id.0)?;

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<LittleEndian>(locations.len() as u32)?;
            for location in locations {
                location.encode_into(writer)?;
            }
        }

        Ok(())
    }
}

impl Decode for TreeRegistryBlob {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let has_config = reader.read_u8()? != 0;
        let scale = reader.read_f64::<LittleEndian>()?;
        let mut offset = [0.0; 3];
        for component in &mut offset {
            *component = reader.read_f64::<LittleEndian>()?;
        }
        let node_limit = reader.read_u64::<LittleEndian>()?;

        let config = has_config.then_some(TreeConfig {
            scale,
            offset,
            node_limit,
        });

        let root = match reader.read_u32::<LittleEndian>()? {
            NO_ROOT => None,
            id => Some(TreeId(id)),
        };

        let tree_count = reader.read_u32::<LittleEndian>()?;
        let mut trees = Vec::with_capacity(tree_count as usize);
        for _ in 0..tree_count {
            let id = TreeId(reader.read_u32::<LittleEndian>()?);
            let location = StorageLocation::decode_from(reader)?;
            trees.push((id, location));
        }

        let chunk_count = reader.read_u32::<LittleEndian>()?;
        let mut chunk_locations = Vec::with_capacity(chunk_count as usize);
        for _ in 0..chunk_count {
            let data = reader.read_u32::<LittleEndian>()?;
            let sub = reader.read_u32::<LittleEndian>()?;
            let attributes_id = AttributesId(reader.read_u32::<LittleEndian>()?);

            let location_count = reader.read_u32::<LittleEndian>()?;
            let mut locations = Vec::with_capacity(location_count as usize);
            for _ in 0..location_count {
                locations.push(StorageLocation::decode_from(reader)?);
            }

            chunk_locations.push((InputId { data, sub }, attributes_id, locations));
        }

        Ok(Self {
            config,
            root,
            trees,
            chunk_locations,
        })
    }
}

/// Reconstructs the in-memory registry from a deserialized registry blob by
/// reading every tree blob.
pub fn load_registry(
    storage: &StorageHandler,
    blob: &TreeRegistryBlob,
    fallback_config: TreeConfig,
) -> crate::Result<TreeRegistry> {
    let mut registry = TreeRegistry::new(blob.config.unwrap_or(fallback_config));

    for (id, location) in &blob.trees {
        let bytes = storage.read_sync(*location)?;
        let tree = Tree::decode_from(&mut &bytes[..]).map_err(crate::Error::Decode)?;
        debug_assert_eq!(tree.id, *id);
        registry.insert_tree(tree);
    }

    if let Some(root) = blob.root {
        registry.set_root(root);
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{insert, test_support::FakePointsReader};
    use test_log::test;

    #[test]
    fn tree_roundtrip() {
        let mut registry = TreeRegistry::new(TreeConfig {
            node_limit: 64,
            ..TreeConfig::default()
        });
        let reader = FakePointsReader::default();

        let first = reader.add_batch(
            InputId { data: 0, sub: 0 },
            (0..128u64).map(|c| Morton::<3>([c * 256, 0, 0])).collect(),
        );
        let root = insert::initialize(&mut registry, first);

        let second = reader.add_batch(
            InputId { data: 1, sub: 0 },
            (0..128u64).map(|c| Morton::<3>([c * 128, 0, 0])).collect(),
        );
        insert::add_points(&mut registry, &reader, root, second).expect("insert succeeds");

        let tree = registry.get(root).expect("tree exists");
        let bytes = tree.encode_into_vec();
        let back = Tree::decode_from(&mut &bytes[..]).expect("decodes");

        assert_eq!(back.id, tree.id);
        assert_eq!(back.magnitude, tree.magnitude);
        assert_eq!(back.morton_min, tree.morton_min);
        assert_eq!(back.morton_max, tree.morton_max);
        for level in 0..5 {
            assert_eq!(back.nodes[level], tree.nodes[level]);
            assert_eq!(back.skips[level], tree.skips[level]);
            assert_eq!(back.data[level], tree.data[level]);
        }
        assert_eq!(back.sub_trees, tree.sub_trees);
    }

    #[test]
    fn registry_blob_roundtrip() {
        let blob = TreeRegistryBlob {
            config: Some(TreeConfig {
                scale: 0.01,
                offset: [1.0, 2.0, 3.0],
                node_limit: 1_000,
            }),
            root: Some(TreeId(4)),
            trees: vec![
                (TreeId(4), StorageLocation::new(128, 96)),
                (TreeId(5), StorageLocation::new(224, 96)),
            ],
            chunk_locations: vec![(
                InputId { data: 0, sub: 0 },
                AttributesId(1),
                vec![StorageLocation::new(512, 2_048), StorageLocation::new(2_560, 512)],
            )],
        };

        let bytes = blob.encode_into_vec();
        let back = TreeRegistryBlob::decode_from(&mut &bytes[..]).expect("decodes");
        assert_eq!(back, blob);
    }

    #[test]
    fn empty_registry_blob_roundtrip() {
        let blob = TreeRegistryBlob::default();
        let bytes = blob.encode_into_vec();
        let back = TreeRegistryBlob::decode_from(&mut &bytes[..]).expect("decodes");
        assert_eq!(back, blob);
        assert!(back.root.is_none());
    }
}
