// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic frame core: pipeline state, the presentable image chain,
//! the per-frame orchestrator and the scene data it draws.

pub mod device;
pub mod mesh;
pub mod pipeline;
pub mod render_system;
pub mod renderer;
pub mod scene;
pub mod swapchain;

#[cfg(test)]
mod testing;

pub use device::Device;
pub use mesh::{Mesh, MeshArena, MeshData, MeshHandle, Vertex};
pub use pipeline::{Pipeline, PipelineConfig};
pub use render_system::{PushConstantData, ShaderSource, SimpleRenderSystem, TransformMode};
pub use renderer::{Frame, Renderer};
pub use scene::{ObjectId, ObjectIdAllocator, Scene, SceneObject};
pub use swapchain::ImageChain;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True while the window is minimized or otherwise has no drawable area.
    pub fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width over height, or 0 for a zero-height extent.
    pub fn aspect_ratio(self) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f32 / self.height as f32
    }
}

/// The windowing collaborator as seen by the frame core.
pub trait ExtentSource {
    /// Current drawable size in pixels.
    fn extent(&self) -> RenderSize;

    /// Blocks until at least one window event has been processed.
    fn wait_events(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_extent_detection() {
        assert!(RenderSize::new(0, 600).is_zero());
        assert!(RenderSize::new(800, 0).is_zero());
        assert!(!RenderSize::new(1, 1).is_zero());
    }

    #[test]
    fn aspect_ratio_is_width_over_height() {
        assert_eq!(RenderSize::new(800, 400).aspect_ratio(), 2.0);
    }

    #[test]
    fn zero_height_has_no_aspect_ratio() {
        assert_eq!(RenderSize::new(800, 0).aspect_ratio(), 0.0);
        assert_eq!(RenderSize::default().aspect_ratio(), 0.0);
    }
}
