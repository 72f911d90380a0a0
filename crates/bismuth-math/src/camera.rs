// SPDX-License-Identifier: CEPL-1.0
use bismuth_core::{EngineError, Result};
use glam::{EulerRot, Mat3, Mat4, Vec3, Vec4};

/// Projection + view matrices. Depth maps to `[0, 1]` and clip-space Y points
/// down, matching Vulkan's canonical volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    projection: Mat4,
    view: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the box `[left, right] x [top, bottom] x [near, far]` onto
    /// `[-1, 1] x [-1, 1] x [0, 1]`.
    pub fn set_orthographic_projection(
        &mut self,
        left: f32,
        right: f32,
        top: f32,
        bottom: f32,
        near: f32,
        far: f32,
    ) {
        // glam's bottom/top map to -1/+1; ours map top to -1.
        self.projection = Mat4::orthographic_lh(left, right, top, bottom, near, far);
    }

    /// Left-handed perspective projection. `aspect` must be finite and
    /// non-zero; a zero-height viewport is the caller's problem to avoid.
    pub fn set_perspective_projection(
        &mut self,
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Result<()> {
        if aspect == 0.0 || !aspect.is_finite() {
            return Err(EngineError::precondition(format!(
                "perspective aspect ratio must be finite and non-zero (got {aspect})"
            )));
        }
        let tan_half = (fov_y / 2.0).tan();
        let depth = far / (far - near);
        self.projection = Mat4::from_cols(
            Vec4::new(1.0 / (aspect * tan_half), 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0 / tan_half, 0.0, 0.0),
            Vec4::new(0.0, 0.0, depth, 1.0),
            Vec4::new(0.0, 0.0, -near * depth, 0.0),
        );
        Ok(())
    }

    /// Looks from `position` along `direction`. `up` defaults to -Y in
    /// callers since clip-space Y points down.
    pub fn set_view_direction(&mut self, position: Vec3, direction: Vec3, up: Vec3) {
        let w = direction.normalize();
        let u = w.cross(up).normalize();
        let v = w.cross(u);
        self.view = view_from_basis(u, v, w, position);
    }

    pub fn set_view_target(&mut self, position: Vec3, target: Vec3, up: Vec3) {
        self.set_view_direction(position, target - position, up);
    }

    /// View for an eye at `position` oriented by YXZ Tait-Bryan `rotation`,
    /// the same convention as [`crate::Transform`].
    pub fn set_view_yxz(&mut self, position: Vec3, rotation: Vec3) {
        let r = Mat3::from_euler(EulerRot::YXZ, rotation.y, rotation.x, rotation.z);
        self.view = view_from_basis(r.x_axis, r.y_axis, r.z_axis, position);
    }

    pub fn projection(&self) -> &Mat4 {
        &self.projection
    }

    pub fn view(&self) -> &Mat4 {
        &self.view
    }

    pub fn projection_view(&self) -> Mat4 {
        self.projection * self.view
    }
}

// Rows of the rotation part are the camera basis vectors.
fn view_from_basis(u: Vec3, v: Vec3, w: Vec3, position: Vec3) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(u.x, v.x, w.x, 0.0),
        Vec4::new(u.y, v.y, w.y, 0.0),
        Vec4::new(u.z, v.z, w.z, 0.0),
        Vec4::new(-u.dot(position), -v.dot(position), -w.dot(position), 1.0),
    )
}
