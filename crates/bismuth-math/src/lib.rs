// SPDX-License-Identifier: CEPL-1.0
mod camera;
mod transform;

pub use camera::Camera;
pub use glam;
pub use transform::Transform;
