//! Camera used for culling the object cache

use crate::core::types::{Mat4, Quat, Vec3};
use crate::math::Frustum;

/// Culling camera with position, rotation, and projection parameters.
///
/// Positions are in the region's local space.
#[derive(Clone, Debug)]
pub struct CullCamera {
    /// Position in region space
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Draw distance (far clip)
    pub far: f32,
    /// Viewport height in pixels
    pub viewport_height: f32,
    /// Camera did not move since the previous frame
    pub is_static: bool,
}

impl CullCamera {
    /// Create a new camera
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32, far: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near: 0.1,
            far,
            viewport_height: 1080.0,
            is_static: false,
        }
    }

    /// Create camera looking at a target
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3, far: f32) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        let rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));

        Self {
            rotation,
            ..Self::new(position, 60.0, 16.0 / 9.0, far)
        }
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        let rotation_matrix = Mat4::from_quat(self.rotation.conjugate());
        let translation_matrix = Mat4::from_translation(-self.position);
        rotation_matrix * translation_matrix
    }

    /// Get projection matrix (camera to clip space)
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Frustum planes for this camera
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// Get forward direction (negative Z in camera space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Screen pixels covered by one meter at unit distance.
    pub fn pixel_meter_ratio(&self) -> f32 {
        let half_tan = (self.fov_y * 0.5).tan();
        if half_tan <= 0.0 {
            return 0.0;
        }
        self.viewport_height / (2.0 * half_tan)
    }
}

impl Default for CullCamera {
    fn default() -> Self {
        Self::new(Vec3::ZERO, 60.0, 16.0 / 9.0, 256.0)
    }
}
