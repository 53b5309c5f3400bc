//! Uniform buffer layouts.
//!
//! These structures must match the shader uniform blocks exactly. All use
//! `#[repr(C)]` and implement `Pod` so they can be staged as raw bytes.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Vertical field of view of the demo camera, in degrees.
pub const FIELD_OF_VIEW_DEGREES: f32 = 45.0;
pub const NEAR_PLANE: f32 = 0.01;
pub const FAR_PLANE: f32 = 1000.0;
/// The camera sits this far along -Z from the origin.
pub const CAMERA_DISTANCE: f32 = 4.0;

/// Model-view-projection matrix.
///
/// # Memory Layout
///
/// - Offset 0: mvp matrix (64 bytes, column major)
/// - Total size: 64 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TransformUniform {
    pub mvp: Mat4,
}

impl TransformUniform {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(mvp: Mat4) -> Self {
        Self { mvp }
    }

    /// Transform of a model rotated `angle_degrees` about +Y, seen by a
    /// camera [`CAMERA_DISTANCE`] units away with a 45° perspective
    /// projection (depth range 0..1).
    pub fn rotating(angle_degrees: f32, aspect_ratio: f32) -> Self {
        let projection = Mat4::perspective_rh(
            FIELD_OF_VIEW_DEGREES.to_radians(),
            aspect_ratio,
            NEAR_PLANE,
            FAR_PLANE,
        );
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -CAMERA_DISTANCE));
        let model = Mat4::from_rotation_y(angle_degrees.to_radians());
        Self::new(projection * view * model)
    }
}

impl Default for TransformUniform {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY)
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec4;

    use super::*;

    #[test]
    fn test_transform_uniform_size() {
        assert_eq!(TransformUniform::SIZE, 64);
        assert_eq!(bytemuck::bytes_of(&TransformUniform::default()).len(), 64);
    }

    #[test]
    fn test_transform_uniform_alignment() {
        // Mat4 requires 16-byte alignment
        assert_eq!(std::mem::align_of::<TransformUniform>(), 16);
    }

    #[test]
    fn test_rotating_origin_projects_to_center() {
        let uniform = TransformUniform::rotating(30.0, 16.0 / 9.0);
        let clip = uniform.mvp * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;

        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
        assert!((clip.w - CAMERA_DISTANCE).abs() < 1e-4);
    }

    #[test]
    fn test_full_turn_is_identity_rotation() {
        let a = TransformUniform::rotating(0.0, 1.0);
        let b = TransformUniform::rotating(360.0, 1.0);
        assert!(a.mvp.abs_diff_eq(b.mvp, 1e-4));
    }

    #[test]
    fn test_quarter_turn_moves_x_onto_z() {
        let uniform = TransformUniform::rotating(90.0, 1.0);
        let point = uniform.mvp * Vec4::new(1.0, 0.0, 0.0, 1.0);
        // +X rotates to -Z (away from the camera), so it lands farther away.
        assert!((point.w - (CAMERA_DISTANCE + 1.0)).abs() < 1e-4);
    }
}
