// SPDX-License-Identifier: CEPL-1.0
use glam::{EulerRot, Mat2, Mat3, Mat4, Quat, Vec2, Vec3};
use std::f32::consts::TAU;

/// Position, scale and orientation of a scene object.
///
/// `rotation` holds Tait-Bryan angles in radians, composed in Y (yaw), X
/// (pitch), Z (roll) order: `R = Ry * Rx * Rz`. The same convention is used by
/// [`crate::Camera::set_view_yxz`].
///
/// Flat (2D) rendering reads the same record: `translation.xy` is the planar
/// offset, `scale.xy` the planar scale and `rotation.z` the planar angle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub scale: Vec3,
    pub rotation: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            scale: Vec3::ONE,
            rotation: Vec3::ZERO,
        }
    }
}

impl Transform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            self.rotation.y,
            self.rotation.x,
            self.rotation.z,
        )
    }

    /// Model matrix: translate * Ry * Rx * Rz * scale.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.orientation(), self.translation)
    }

    /// Inverse-transpose of the model matrix's upper 3x3, for normals.
    pub fn normal_matrix(&self) -> Mat3 {
        Mat3::from_quat(self.orientation()) * Mat3::from_diagonal(self.scale.recip())
    }

    /// Planar rotation * scale, using `rotation.z` as the angle.
    pub fn planar_matrix(&self) -> Mat2 {
        Mat2::from_angle(self.rotation.z) * Mat2::from_diagonal(self.scale.truncate())
    }

    pub fn planar_offset(&self) -> Vec2 {
        self.translation.truncate()
    }

    /// Adds `delta` to every angle, keeping each one inside `[0, 2π)`.
    pub fn rotate_by(&mut self, delta: Vec3) {
        let r = self.rotation + delta;
        self.rotation = Vec3::new(r.x.rem_euclid(TAU), r.y.rem_euclid(TAU), r.z.rem_euclid(TAU));
    }
}
