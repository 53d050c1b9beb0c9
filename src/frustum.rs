// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aabb::Aabb;
use cgmath::{Matrix4, Vector4};

/// A clipping plane `normal . p + d >= 0` (inside half-space).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Plane {
    pub normal: [f64; 3],
    pub d: f64,
}

impl Plane {
    fn from_row(row: Vector4<f64>) -> Self {
        let length = (row.x * row.x + row.y * row.y + row.z * row.z).sqrt();

        // A degenerate projection row keeps everything inside.
        if length == 0.0 {
            return Self {
                normal: [0.0, 0.0, 0.0],
                d: f64::MAX,
            };
        }

        Self {
            normal: [row.x / length, row.y / length, row.z / length],
            d: row.w / length,
        }
    }

    fn signed_distance(&self, point: [f64; 3]) -> f64 {
        self.normal[0] * point[0] + self.normal[1] * point[1] + self.normal[2] * point[2] + self.d
    }
}

/// How an AABB relates to the frustum.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Containment {
    Outside,
    Intersects,
    Inside,
}

/// The six clipping planes of a view-projection matrix in the order
/// left, right, bottom, top, near, far.
#[derive(Copy, Clone, Debug)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    /// Extracts and normalizes the planes from a view-projection matrix.
    #[must_use]
    pub fn from_view_projection(matrix: &Matrix4<f64>) -> Self {
        let row = |idx: usize| Vector4::new(matrix[0][idx], matrix[1][idx], matrix[2][idx], matrix[3][idx]);

        let row0 = row(0);
        let row1 = row(1);
        let row2 = row(2);
        let row3 = row(3);

        Self {
            planes: [
                Plane::from_row(row3 + row0),
                Plane::from_row(row3 - row0),
                Plane::from_row(row3 + row1),
                Plane::from_row(row3 - row1),
                Plane::from_row(row3 + row2),
                Plane::from_row(row3 - row2),
            ],
        }
    }

    /// Classifies a box against all six planes using the p/n-vertex test.
    #[must_use]
    pub fn classify_aabb(&self, aabb: &Aabb) -> Containment {
        let mut result = Containment::Inside;

        for plane in &self.planes {
            if plane.signed_distance(aabb.positive_vertex(plane.normal)) < 0.0 {
                return Containment::Outside;
            }
            if plane.signed_distance(aabb.negative_vertex(plane.normal)) < 0.0 {
                result = Containment::Intersects;
            }
        }

        result
    }
}
