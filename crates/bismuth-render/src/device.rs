// SPDX-License-Identifier: CEPL-1.0
//! The narrow interface the frame core needs from a graphics backend.
//!
//! Handles are opaque 64-bit values tagged with the kind of object they name,
//! so a `Pipeline` can never be passed where a `RenderPass` is expected. A
//! backend hands them out and interprets them; the core only stores, compares
//! and null-checks them.

use crate::pipeline::PipelineConfig;
use crate::RenderSize;
use bismuth_core::Result;
use std::ffi::CStr;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

pub struct Handle<K> {
    raw: u64,
    kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    pub const NULL: Self = Self::from_raw(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            kind: PhantomData,
        }
    }

    pub const fn as_raw(self) -> u64 {
        self.raw
    }

    pub const fn is_null(self) -> bool {
        self.raw == 0
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<K>();
        let name = name.rsplit("::").next().unwrap_or(name);
        write!(f, "{name}({:#x})", self.raw)
    }
}

pub mod kind {
    pub enum ShaderModule {}
    pub enum Pipeline {}
    pub enum PipelineLayout {}
    pub enum RenderPass {}
    pub enum Framebuffer {}
    pub enum Image {}
    pub enum ImageView {}
    pub enum DeviceMemory {}
    pub enum Swapchain {}
    pub enum Semaphore {}
    pub enum Fence {}
    pub enum CommandBuffer {}
    pub enum Buffer {}
}

pub type ShaderModule = Handle<kind::ShaderModule>;
pub type Pipeline = Handle<kind::Pipeline>;
pub type PipelineLayout = Handle<kind::PipelineLayout>;
pub type RenderPass = Handle<kind::RenderPass>;
pub type Framebuffer = Handle<kind::Framebuffer>;
pub type Image = Handle<kind::Image>;
pub type ImageView = Handle<kind::ImageView>;
pub type DeviceMemory = Handle<kind::DeviceMemory>;
pub type Swapchain = Handle<kind::Swapchain>;
pub type Semaphore = Handle<kind::Semaphore>;
pub type Fence = Handle<kind::Fence>;
pub type CommandBuffer = Handle<kind::CommandBuffer>;
pub type Buffer = Handle<kind::Buffer>;

/// Backend pixel format, carried as the backend's raw enum value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Format(pub i32);

impl Format {
    pub const UNDEFINED: Self = Self(0);
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    pub buffer: Buffer,
    pub memory: DeviceMemory,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthAttachment {
    pub image: Image,
    pub memory: DeviceMemory,
    pub view: ImageView,
}

/// Presentable images as returned by swapchain creation.
#[derive(Clone, Debug)]
pub struct SwapchainImages {
    pub swapchain: Swapchain,
    pub images: Vec<Image>,
    pub format: Format,
    /// Extent actually chosen, which may differ from the requested one.
    pub extent: RenderSize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn covering(extent: RenderSize) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn covering(extent: RenderSize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderPassBegin {
    pub render_pass: RenderPass,
    pub framebuffer: Framebuffer,
    pub extent: RenderSize,
    pub clear: ClearValues,
}

pub struct GraphicsPipelineDesc<'a> {
    pub vertex: ShaderModule,
    pub fragment: ShaderModule,
    pub entry_point: &'a CStr,
    pub config: &'a PipelineConfig,
}

/// Outcome of asking the presentation engine for the next image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentStatus {
    pub fn is_stale(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

/// A logical device with one graphics+present queue and one command pool.
///
/// Every `create_*` has a matching `destroy_*`; the caller owns what it
/// creates and must release it before the device goes away. Recording calls
/// (`cmd_*`) only append to a command buffer that has been begun.
pub trait Device {
    fn max_push_constants_size(&self) -> u32;

    fn create_shader_module(&self, code: &[u8]) -> Result<ShaderModule>;
    fn destroy_shader_module(&self, module: ShaderModule);

    fn create_pipeline_layout(&self, push_constants: &[PushConstantRange]) -> Result<PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayout);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<Pipeline>;
    fn destroy_pipeline(&self, pipeline: Pipeline);

    /// Builds a swapchain for the bound surface. A non-null `old` is handed to
    /// the driver for resource reuse; the caller still destroys it.
    fn create_swapchain(&self, extent: RenderSize, old: Swapchain) -> Result<SwapchainImages>;
    fn destroy_swapchain(&self, swapchain: Swapchain);

    fn create_color_view(&self, image: Image, format: Format) -> Result<ImageView>;
    fn destroy_image_view(&self, view: ImageView);

    fn depth_format(&self) -> Format;
    fn create_depth_attachment(&self, extent: RenderSize, format: Format) -> Result<DepthAttachment>;
    fn destroy_depth_attachment(&self, depth: DepthAttachment);

    fn create_render_pass(&self, color: Format, depth: Format) -> Result<RenderPass>;
    fn destroy_render_pass(&self, render_pass: RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: RenderPass,
        attachments: &[ImageView],
        extent: RenderSize,
    ) -> Result<Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: Framebuffer);

    fn create_semaphore(&self) -> Result<Semaphore>;
    fn destroy_semaphore(&self, semaphore: Semaphore);
    fn create_fence(&self, signaled: bool) -> Result<Fence>;
    fn destroy_fence(&self, fence: Fence);
    fn wait_for_fence(&self, fence: Fence) -> Result<()>;
    fn reset_fence(&self, fence: Fence) -> Result<()>;

    fn acquire_next_image(&self, swapchain: Swapchain, signal: Semaphore) -> Result<Acquire>;
    fn submit(
        &self,
        cmd: CommandBuffer,
        wait: Semaphore,
        signal: Semaphore,
        fence: Fence,
    ) -> Result<()>;
    fn present(&self, swapchain: Swapchain, image_index: u32, wait: Semaphore) -> Result<PresentStatus>;
    fn wait_idle(&self) -> Result<()>;

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[CommandBuffer]);

    fn begin_command_buffer(&self, cmd: CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cmd: CommandBuffer) -> Result<()>;
    fn cmd_begin_render_pass(&self, cmd: CommandBuffer, begin: &RenderPassBegin);
    fn cmd_end_render_pass(&self, cmd: CommandBuffer);
    fn cmd_set_viewport(&self, cmd: CommandBuffer, viewport: Viewport);
    fn cmd_set_scissor(&self, cmd: CommandBuffer, scissor: Rect2D);
    fn cmd_bind_pipeline(&self, cmd: CommandBuffer, pipeline: Pipeline);
    fn cmd_push_constants(
        &self,
        cmd: CommandBuffer,
        layout: PipelineLayout,
        stages: ShaderStages,
        data: &[u8],
    );
    fn cmd_bind_vertex_buffer(&self, cmd: CommandBuffer, buffer: Buffer);
    fn cmd_bind_index_buffer(&self, cmd: CommandBuffer, buffer: Buffer);
    fn cmd_draw(&self, cmd: CommandBuffer, vertex_count: u32);
    fn cmd_draw_indexed(&self, cmd: CommandBuffer, index_count: u32);

    fn create_buffer(&self, usage: BufferUsage, data: &[u8]) -> Result<GpuBuffer>;
    fn destroy_buffer(&self, buffer: GpuBuffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_default_and_null() {
        assert!(Pipeline::NULL.is_null());
        assert_eq!(RenderPass::default(), RenderPass::NULL);
        assert!(!Fence::from_raw(7).is_null());
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", Pipeline::from_raw(0x10)), "Pipeline(0x10)");
    }

    #[test]
    fn present_status_staleness() {
        assert!(!PresentStatus::Optimal.is_stale());
        assert!(PresentStatus::Suboptimal.is_stale());
        assert!(PresentStatus::OutOfDate.is_stale());
    }
}
