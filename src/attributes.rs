// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    format::{PointFormat, ScalarType},
    hash::hash64,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    sync::Mutex,
};

/// Name of the leading position attribute every set carries.
pub const ATTRIBUTE_XYZ: &str = "xyz";

/// Name of the LAS intensity attribute.
pub const ATTRIBUTE_INTENSITY: &str = "intensity";

/// Name of the LAS classification attribute.
pub const ATTRIBUTE_CLASSIFICATION: &str = "classification";

/// Stable id of an interned attribute set.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AttributesId(pub u32);

/// One named attribute column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub format: PointFormat,
}

impl Attribute {
    #[must_use]
    pub fn new(name: impl Into<String>, scalar: ScalarType, components: u8) -> Self {
        Self {
            name: name.into(),
            format: PointFormat::new(scalar, components),
        }
    }
}

/// An ordered attribute set; the first attribute is always the Morton
/// position. Identity is by value: equal names and formats intern to the
/// same [`AttributesId`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Attributes {
    pub attributes: Vec<Attribute>,
}

impl Attributes {
    /// A set holding just a Morton position column.
    #[must_use]
    pub fn position_only(scalar: ScalarType) -> Self {
        Self {
            attributes: vec![Attribute::new(ATTRIBUTE_XYZ, scalar, 1)],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Content hash used as interning quick-reject.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        hash64(&self.encode_into_vec())
    }

    /// Replaces the leading position format, keeping the other attributes.
    #[must_use]
    pub fn with_position_format(&self, scalar: ScalarType) -> Self {
        let mut attributes = self.attributes.clone();
        if let Some(first) = attributes.first_mut() {
            first.format = PointFormat::new(scalar, 1);
        }
        Self { attributes }
    }
}

impl Encode for Attributes {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.attributes.len() as u32)?;

        for attribute in &self.attributes {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<LittleEndian>(attribute.name.len() as u32)?;
            writer.write_all(attribute.name.as_bytes())?;
            attribute.format.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for Attributes {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32::<LittleEndian>()?;

        let mut attributes = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let name_len = reader.read_u32::<LittleEndian>()?;
            let mut name = vec![0u8; name_len as usize];
            reader.read_exact(&mut name)?;
            let name = std::str::from_utf8(&name)?.to_owned();
            let format = PointFormat::decode_from(reader)?;
            attributes.push(Attribute { name, format });
        }

        Ok(Self { attributes })
    }
}

/// Whether an attribute aggregates under coarsening (e.g. intensity
/// averages) or picks a representative sample (e.g. classification).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AttributeExtraInfo {
    pub is_accumulative: bool,
}

/// How one source attribute feeds a destination attribute during LOD
/// generation.
#[derive(Clone, Debug)]
pub struct LodSourceAttribute {
    /// Index into the source set's attributes
    pub index: usize,

    /// Format of the source column
    pub format: PointFormat,
}

/// Per-source-set mapping into a LOD destination set.
#[derive(Clone, Debug)]
pub struct LodSourceMapping {
    pub id: AttributesId,

    /// One entry per destination attribute; `None` if the source set lacks it.
    pub attributes: Vec<Option<LodSourceAttribute>>,
}

/// Full mapping descriptor for synthesizing one coarser node.
#[derive(Clone, Debug)]
pub struct LodMapping {
    pub destination_id: AttributesId,
    pub destination: Vec<PointFormat>,
    pub sources: Vec<LodSourceMapping>,
}

impl LodMapping {
    /// Looks up the mapping for one of the source sets.
    #[must_use]
    pub fn source_mapping(&self, id: AttributesId) -> Option<&LodSourceMapping> {
        self.sources.iter().find(|source| source.id == id)
    }
}

struct AttributeConfig {
    attributes: Attributes,
    content_hash: u64,
    extra_info: Vec<AttributeExtraInfo>,
}

fn extra_info_for(attributes: &Attributes) -> Vec<AttributeExtraInfo> {
    attributes
        .attributes
        .iter()
        .map(|attribute| AttributeExtraInfo {
            is_accumulative: attribute.name == ATTRIBUTE_INTENSITY,
        })
        .collect()
}

/// Interning table for attribute sets.
///
/// Consulted from reader workers and the tree loop concurrently, hence the
/// internal mutex.
pub struct AttributesRegistry {
    configs: Mutex<Vec<AttributeConfig>>,
}

impl Default for AttributesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributesRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Interns an attribute set, returning its stable id.
    #[allow(clippy::expect_used)]
    pub fn intern(&self, attributes: Attributes) -> AttributesId {
        let content_hash = attributes.content_hash();

        let mut configs = self.configs.lock().expect("lock is poisoned");

        for (idx, config) in configs.iter().enumerate() {
            if config.content_hash == content_hash && config.attributes == attributes {
                #[allow(clippy::cast_possible_truncation)]
                return AttributesId(idx as u32);
            }
        }

        let extra_info = extra_info_for(&attributes);

        #[allow(clippy::cast_possible_truncation)]
        let id = AttributesId(configs.len() as u32);

        configs.push(AttributeConfig {
            attributes,
            content_hash,
            extra_info,
        });

        id
    }

    /// Returns a copy of the interned set.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn get(&self, id: AttributesId) -> Attributes {
        let configs = self.configs.lock().expect("lock is poisoned");
        configs[id.0 as usize].attributes.clone()
    }

    /// Per-attribute accumulation flags of the interned set.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn extra_info(&self, id: AttributesId) -> Vec<AttributeExtraInfo> {
        let configs = self.configs.lock().expect("lock is poisoned");
        configs[id.0 as usize].extra_info.clone()
    }

    /// Number of interned sets.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.lock().expect("lock is poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds the LOD mapping that coarsens points from the given source
    /// sets. The destination set is the first source's attributes with the
    /// position column widened to the requested Morton format; remaining
    /// destination attributes map by name.
    #[allow(clippy::expect_used)]
    pub fn lod_mapping(
        &self,
        position_scalar: ScalarType,
        source_ids: &[AttributesId],
    ) -> LodMapping {
        debug_assert!(!source_ids.is_empty());
        debug_assert!(position_scalar.is_morton());

        let destination_attributes = {
            let configs = self.configs.lock().expect("lock is poisoned");
            configs[source_ids[0].0 as usize]
                .attributes
                .with_position_format(position_scalar)
        };

        let destination_id = self.intern(destination_attributes.clone());

        let configs = self.configs.lock().expect("lock is poisoned");

        let sources = source_ids
            .iter()
            .map(|source_id| {
                let source = &configs[source_id.0 as usize].attributes;

                let attributes = destination_attributes
                    .attributes
                    .iter()
                    .enumerate()
                    .map(|(dest_idx, dest)| {
                        if dest_idx == 0 {
                            // Position always maps onto position.
                            return Some(LodSourceAttribute {
                                index: 0,
                                format: source.attributes[0].format,
                            });
                        }

                        source
                            .attributes
                            .iter()
                            .position(|candidate| candidate.name == dest.name)
                            .map(|index| LodSourceAttribute {
                                index,
                                format: source.attributes[index].format,
                            })
                    })
                    .collect();

                LodSourceMapping {
                    id: *source_id,
                    attributes,
                }
            })
            .collect();

        LodMapping {
            destination_id,
            destination: destination_attributes
                .attributes
                .iter()
                .map(|attribute| attribute.format)
                .collect(),
            sources,
        }
    }

    /// Serializes every interned set, count-prefixed.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let configs = self.configs.lock().expect("lock is poisoned");

        let mut out = vec![];

        #[allow(clippy::cast_possible_truncation)]
        out.write_u32::<LittleEndian>(configs.len() as u32)
            .expect("cannot fail");

        for config in configs.iter() {
            config
                .attributes
                .encode_into(&mut out)
                .expect("cannot fail");
        }

        out
    }

    /// Rebuilds the registry from a serialized table.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = bytes;

        let count = reader.read_u32::<LittleEndian>()?;

        let mut configs = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let attributes = Attributes::decode_from(&mut reader)?;
            let content_hash = attributes.content_hash();
            let extra_info = extra_info_for(&attributes);
            configs.push(AttributeConfig {
                attributes,
                content_hash,
                extra_info,
            });
        }

        Ok(Self {
            configs: Mutex::new(configs),
        })
    }
}
