//! Transform and bounding-box math shared across the pipeline.

use glam::{DMat4, DQuat, DVec3};

/// A translation / rotation / scale triple in glTF conventions.
///
/// The rotation is kept normalized. glTF serializes quaternions in
/// `[x, y, z, w]` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trs {
    pub translation: DVec3,
    pub rotation: DQuat,
    pub scale: DVec3,
}

impl Default for Trs {
    fn default() -> Self {
        Self {
            translation: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            scale: DVec3::ONE,
        }
    }
}

impl Trs {
    pub fn matrix(&self) -> DMat4 {
        DMat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Decompose an affine matrix into TRS, normalizing the quaternion.
    ///
    /// Returns `None` when the decomposition yields non-finite components
    /// (degenerate or non-affine input); callers treat that as a data
    /// access failure and drop the node.
    pub fn from_matrix(matrix: &DMat4) -> Option<Self> {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        let rotation = rotation.normalize();
        if !(translation.is_finite() && rotation.is_finite() && scale.is_finite()) {
            return None;
        }
        Some(Self {
            translation,
            rotation,
            scale,
        })
    }
}

/// Axis-aligned bounding box. Starts out inverted (empty) so that merging
/// and point inclusion work without a separate "initialized" flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: DVec3::splat(f64::MAX),
            max: DVec3::splat(f64::MIN),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn include(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn merge(&mut self, other: &Aabb) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Transform the eight corners and rebuild an axis-aligned box around
    /// them.
    pub fn transformed(&self, matrix: &DMat4) -> Aabb {
        if !self.is_valid() {
            return *self;
        }
        let corners = [
            DVec3::new(self.min.x, self.min.y, self.min.z),
            DVec3::new(self.max.x, self.min.y, self.min.z),
            DVec3::new(self.min.x, self.max.y, self.min.z),
            DVec3::new(self.min.x, self.min.y, self.max.z),
            DVec3::new(self.max.x, self.max.y, self.min.z),
            DVec3::new(self.max.x, self.min.y, self.max.z),
            DVec3::new(self.min.x, self.max.y, self.max.z),
            DVec3::new(self.max.x, self.max.y, self.max.z),
        ];
        let mut out = Aabb::empty();
        for corner in corners {
            out.include(matrix.transform_point3(corner));
        }
        out
    }

    /// Two boxes are similar iff min and max differ by at most `tolerance`
    /// on every axis. Invalid boxes are never similar.
    pub fn similar_to(&self, other: &Aabb, tolerance: f64) -> bool {
        if !self.is_valid() || !other.is_valid() {
            return false;
        }
        (self.min.x - other.min.x).abs() <= tolerance
            && (self.min.y - other.min.y).abs() <= tolerance
            && (self.min.z - other.min.z).abs() <= tolerance
            && (self.max.x - other.max.x).abs() <= tolerance
            && (self.max.y - other.max.y).abs() <= tolerance
            && (self.max.z - other.max.z).abs() <= tolerance
    }

    /// The 3D Tiles 12-double box form: center followed by three
    /// axis-aligned half-axis vectors. An invalid box collapses to zeros.
    pub fn to_box_array(&self) -> [f64; 12] {
        if !self.is_valid() {
            return [0.0; 12];
        }
        let center = (self.min + self.max) * 0.5;
        let half = (self.max - self.min) * 0.5;
        [
            center.x, center.y, center.z, //
            half.x, 0.0, 0.0, //
            0.0, half.y, 0.0, //
            0.0, 0.0, half.z,
        ]
    }
}
