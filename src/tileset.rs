//! Hand-off contract for the external 3D Tiles emitter.
//!
//! The pipeline does not serialize tileset JSON itself; it hands the emitter
//! a root bounding volume (already permuted into the tileset's Z-up frame)
//! and a root geometric error per output GLB.

use serde::Serialize;

use crate::math::Aabb;

/// Permute a 12-double glTF Y-up box into the tileset's Z-up frame.
///
/// The center maps as `(x, y, z) → (x, -z, y)`; the Y and Z half-axis rows
/// swap their extents accordingly.
pub fn glb_to_tileset_axes(b: [f64; 12]) -> [f64; 12] {
    [
        b[0], -b[2], b[1], //
        b[3], b[4], b[5], //
        b[6], b[11], b[8], //
        b[9], b[10], b[7],
    ]
}

/// Root bounding volume of a tileset, encoded as the 12-double OBB
/// `[cx, cy, cz, rx, 0, 0, 0, ry, 0, 0, 0, rz]` in the tileset frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RootBoundingVolume {
    #[serde(rename = "box")]
    pub obb: [f64; 12],
}

impl RootBoundingVolume {
    /// `None` when the box is empty (the output contained no geometry).
    pub fn from_bounds(bounds: &Aabb) -> Option<Self> {
        bounds.is_valid().then(|| Self {
            obb: glb_to_tileset_axes(bounds.to_box_array()),
        })
    }
}

/// Root geometric error for a tileset enclosing `bounds`: a tenth of the box
/// diagonal, floored at 1.
pub fn root_geometric_error(bounds: &Aabb) -> f64 {
    if !bounds.is_valid() {
        return 1.0;
    }
    let diagonal = (bounds.max - bounds.min).length();
    (0.1 * diagonal).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    #[test]
    fn axis_permutation_swaps_y_and_z() {
        let input = [
            1.0, 2.0, 3.0, //
            4.0, 0.0, 0.0, //
            0.0, 5.0, 0.0, //
            0.0, 0.0, 6.0,
        ];
        assert_eq!(
            glb_to_tileset_axes(input),
            [
                1.0, -3.0, 2.0, //
                4.0, 0.0, 0.0, //
                0.0, 6.0, 0.0, //
                0.0, 0.0, 5.0,
            ]
        );
    }

    #[test]
    fn volume_from_two_cube_bounds() {
        let bounds = Aabb {
            min: DVec3::new(-0.5, -0.5, -0.5),
            max: DVec3::new(10.5, 0.5, 0.5),
        };
        let volume = RootBoundingVolume::from_bounds(&bounds).unwrap();
        let expected = [
            5.0, 0.0, 0.0, //
            5.5, 0.0, 0.0, //
            0.0, 0.5, 0.0, //
            0.0, 0.0, 0.5,
        ];
        for (got, want) in volume.obb.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
        assert!(RootBoundingVolume::from_bounds(&Aabb::empty()).is_none());
    }

    #[test]
    fn volume_serializes_under_the_box_key() {
        let bounds = Aabb {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        let volume = RootBoundingVolume::from_bounds(&bounds).unwrap();
        let value = serde_json::to_value(volume).unwrap();
        assert!(value.get("box").is_some());
        assert_eq!(value["box"].as_array().unwrap().len(), 12);
    }

    #[test]
    fn geometric_error_scales_with_the_diagonal_and_is_floored() {
        let small = Aabb {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        assert_eq!(root_geometric_error(&small), 1.0);
        let large = Aabb {
            min: DVec3::ZERO,
            max: DVec3::new(300.0, 0.0, 400.0),
        };
        assert!((root_geometric_error(&large) - 50.0).abs() < 1e-9);
        assert_eq!(root_geometric_error(&Aabb::empty()), 1.0);
    }
}
