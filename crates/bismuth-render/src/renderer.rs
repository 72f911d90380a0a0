// SPDX-License-Identifier: CEPL-1.0
//! Per-frame orchestration: acquire, record, submit, present, and rebuild
//! the image chain when the surface changes under it.

use crate::device::{
    Acquire, ClearValues, CommandBuffer, Device, Rect2D, RenderPass, RenderPassBegin, Viewport,
};
use crate::swapchain::ImageChain;
use crate::{ExtentSource, RenderSize};
use bismuth_core::{EngineError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The frame currently being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command_buffer: CommandBuffer,
    pub image_index: u32,
    pub extent: RenderSize,
}

/// Owns the image chain and one command buffer per chain image.
///
/// A frame is `begin_frame` → `begin_render_pass` → (render systems record)
/// → `end_render_pass` → `end_frame`. `begin_frame` returns `None` when the
/// chain had to be rebuilt first; the caller simply skips that iteration.
pub struct Renderer<D: Device> {
    device: Arc<D>,
    chain: ImageChain<D>,
    command_buffers: Vec<CommandBuffer>,
    current: Option<Frame>,
    resized: bool,
    clear_color: [f32; 4],
    render_pass_generation: u64,
}

impl<D: Device> Renderer<D> {
    /// Blocks until `window` has a drawable area, then builds the chain.
    pub fn new(device: Arc<D>, window: &mut impl ExtentSource) -> Result<Self> {
        let extent = wait_for_extent(window);
        let chain = ImageChain::new(Arc::clone(&device), extent)?;
        let command_buffers = device.allocate_command_buffers(chain.image_count() as u32)?;
        info!("renderer ready with {} command buffers", command_buffers.len());

        Ok(Self {
            device,
            chain,
            command_buffers,
            current: None,
            resized: false,
            clear_color: [0.01, 0.01, 0.01, 1.0],
            render_pass_generation: 0,
        })
    }

    pub fn begin_frame(&mut self, window: &mut impl ExtentSource) -> Result<Option<Frame>> {
        if self.current.is_some() {
            return Err(EngineError::precondition(
                "begin_frame called while a frame is already in progress",
            ));
        }

        let image_index = match self.chain.acquire_next_image()? {
            Acquire::Image { index, .. } => index,
            Acquire::OutOfDate => {
                self.recreate_chain(window)?;
                return Ok(None);
            }
        };

        let command_buffer = self.command_buffers[image_index as usize];
        self.device.begin_command_buffer(command_buffer)?;

        let frame = Frame {
            command_buffer,
            image_index,
            extent: self.chain.extent(),
        };
        self.current = Some(frame);
        Ok(Some(frame))
    }

    /// Begins the chain's render pass on `frame`'s framebuffer, clearing color
    /// to the clear color and depth/stencil to 1.0/0, and covers the extent
    /// with the viewport and scissor.
    pub fn begin_render_pass(&self, frame: &Frame) -> Result<()> {
        self.check_current(frame, "begin_render_pass")?;
        let cmd = frame.command_buffer;
        self.device.cmd_begin_render_pass(
            cmd,
            &RenderPassBegin {
                render_pass: self.chain.render_pass(),
                framebuffer: self.chain.framebuffer(frame.image_index),
                extent: frame.extent,
                clear: ClearValues {
                    color: self.clear_color,
                    depth: 1.0,
                    stencil: 0,
                },
            },
        );
        self.device.cmd_set_viewport(cmd, Viewport::covering(frame.extent));
        self.device.cmd_set_scissor(cmd, Rect2D::covering(frame.extent));
        Ok(())
    }

    pub fn end_render_pass(&self, frame: &Frame) -> Result<()> {
        self.check_current(frame, "end_render_pass")?;
        self.device.cmd_end_render_pass(frame.command_buffer);
        Ok(())
    }

    /// Submits and presents the current frame, then rebuilds the chain if
    /// presentation reported it stale or a resize was signalled.
    pub fn end_frame(&mut self, window: &mut impl ExtentSource) -> Result<()> {
        let frame = self.current.take().ok_or_else(|| {
            EngineError::precondition("end_frame called without a frame in progress")
        })?;

        self.device.end_command_buffer(frame.command_buffer)?;
        let status = self
            .chain
            .submit_and_present(frame.command_buffer, frame.image_index)?;

        if status.is_stale() || self.chain.is_stale() || self.resized {
            self.resized = false;
            self.recreate_chain(window)?;
        }
        Ok(())
    }

    /// Marks the chain for recreation at the end of the next frame.
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    fn recreate_chain(&mut self, window: &mut impl ExtentSource) -> Result<()> {
        let extent = wait_for_extent(window);
        // Idles the device before the superseded chain goes.
        let formats = (self.chain.color_format(), self.chain.depth_format());
        self.chain.recreate(extent)?;

        if self.chain.image_count() != self.command_buffers.len() {
            let old = std::mem::take(&mut self.command_buffers);
            self.device.free_command_buffers(&old);
            self.command_buffers = self
                .device
                .allocate_command_buffers(self.chain.image_count() as u32)?;
            debug!("reallocated {} command buffers", self.command_buffers.len());
        }

        if formats != (self.chain.color_format(), self.chain.depth_format()) {
            self.render_pass_generation += 1;
            info!(
                "attachment formats changed, render pass generation {}",
                self.render_pass_generation
            );
        }
        Ok(())
    }

    fn check_current(&self, frame: &Frame, op: &str) -> Result<()> {
        if self.current.as_ref() != Some(frame) {
            return Err(EngineError::precondition(format!(
                "{op} called for a frame that is not in progress"
            )));
        }
        Ok(())
    }

    /// Blocks until the GPU has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn render_pass(&self) -> RenderPass {
        self.chain.render_pass()
    }

    /// Bumped whenever recreation produced a render pass that pipelines
    /// built against the previous one cannot be used with.
    pub fn render_pass_generation(&self) -> u64 {
        self.render_pass_generation
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.chain.extent_aspect_ratio()
    }

    pub fn extent(&self) -> RenderSize {
        self.chain.extent()
    }

    pub fn image_count(&self) -> usize {
        self.chain.image_count()
    }

    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn is_frame_in_progress(&self) -> bool {
        self.current.is_some()
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }
}

impl<D: Device> Drop for Renderer<D> {
    fn drop(&mut self) {
        // Nothing below may be in use by the GPU; the chain drops after this.
        match self.device.wait_idle() {
            Ok(()) => self.chain.assume_idle(),
            Err(err) => warn!("wait_idle failed during renderer teardown: {err}"),
        }
        if !self.command_buffers.is_empty() {
            self.device.free_command_buffers(&self.command_buffers);
        }
    }
}

/// Blocks on window events while the extent has no area (minimized window).
fn wait_for_extent(window: &mut impl ExtentSource) -> RenderSize {
    let mut extent = window.extent();
    while extent.is_zero() {
        debug!("window extent is {}x{}, waiting", extent.width, extent.height);
        window.wait_events();
        extent = window.extent();
    }
    extent
}
