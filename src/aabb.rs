// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::morton::Morton192;

/// Axis-aligned bounding box in world coordinates.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Aabb {
    /// The world-space box of a Morton cell range under the store's lattice
    /// transform `pos = decoded * scale + offset`.
    #[must_use]
    pub fn from_morton_range(
        morton_min: Morton192,
        morton_max: Morton192,
        scale: f64,
        offset: [f64; 3],
    ) -> Self {
        Self {
            min: morton_to_pos(scale, offset, morton_min),
            max: morton_to_pos(scale, offset, morton_max),
        }
    }

    /// The corner of the box maximal along the given direction.
    #[must_use]
    pub fn positive_vertex(&self, direction: [f64; 3]) -> [f64; 3] {
        let mut corner = self.min;
        for axis in 0..3 {
            if direction[axis] >= 0.0 {
                corner[axis] = self.max[axis];
            }
        }
        corner
    }

    /// The corner of the box minimal along the given direction.
    #[must_use]
    pub fn negative_vertex(&self, direction: [f64; 3]) -> [f64; 3] {
        let mut corner = self.max;
        for axis in 0..3 {
            if direction[axis] >= 0.0 {
                corner[axis] = self.min[axis];
            }
        }
        corner
    }
}

/// Decodes a Morton code into a world position.
#[must_use]
pub fn morton_to_pos(scale: f64, offset: [f64; 3], code: Morton192) -> [f64; 3] {
    let decoded = code.decode();
    [
        decoded[0] as f64 * scale + offset[0],
        decoded[1] as f64 * scale + offset[1],
        decoded[2] as f64 * scale + offset[2],
    ]
}

/// Encodes a world position into the lattice (components clamp at zero).
#[must_use]
pub fn pos_to_morton(scale: f64, offset: [f64; 3], pos: [f64; 3]) -> Morton192 {
    let mut lattice = [0u64; 3];
    for axis in 0..3 {
        let value = (pos[axis] - offset[axis]) / scale;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            lattice[axis] = if value <= 0.0 { 0 } else { value as u64 };
        }
    }
    Morton192::encode(lattice)
}
