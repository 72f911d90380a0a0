// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain: swapchain images with their views, depth
//! attachments, framebuffers, one shared render pass and per-frame
//! synchronisation.

use crate::device::{
    Acquire, CommandBuffer, DepthAttachment, Device, Fence, Format, Framebuffer, Image, ImageView,
    PresentStatus, RenderPass, Semaphore, Swapchain,
};
use crate::RenderSize;
use bismuth_core::{EngineError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Synchronisation for one frame-in-flight slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSync {
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
}

/// Swapchain plus everything sized to it.
///
/// Frame slots cycle modulo the image count, independently of which image
/// acquisition returns; `images_in_flight` remembers which slot's fence last
/// used each image so an image is never re-recorded while the GPU reads it.
///
/// Dropping a chain waits for the device to go idle first, unless the owner
/// already did so and said so with [`ImageChain::assume_idle`].
pub struct ImageChain<D: Device> {
    device: Arc<D>,
    swapchain: Swapchain,
    color_format: Format,
    depth_format: Format,
    extent: RenderSize,

    images: Vec<Image>,
    views: Vec<ImageView>,
    depth: Vec<DepthAttachment>,
    render_pass: RenderPass,
    framebuffers: Vec<Framebuffer>,

    frames: Vec<FrameSync>,
    images_in_flight: Vec<Fence>,
    current_frame: usize,
    stale: bool,
    device_idle: bool,
}

impl<D: Device> ImageChain<D> {
    pub fn new(device: Arc<D>, extent: RenderSize) -> Result<Self> {
        Self::build(device, extent, Swapchain::NULL)
    }

    /// Replaces the chain with one sized to `extent`, handing the current
    /// swapchain to the driver so it can recycle its images. Waits for the
    /// device to go idle first; the superseded resources are destroyed once
    /// the new chain exists. On error the current chain is left as it was.
    pub fn recreate(&mut self, extent: RenderSize) -> Result<()> {
        self.device.wait_idle()?;
        let next = Self::build(Arc::clone(&self.device), extent, self.swapchain)?;
        let mut old = std::mem::replace(self, next);
        old.device_idle = true;
        Ok(())
    }

    /// Skips the idle wait on drop. Only valid right after a successful
    /// `wait_idle` with nothing submitted since.
    pub fn assume_idle(&mut self) {
        self.device_idle = true;
    }

    fn build(device: Arc<D>, extent: RenderSize, old: Swapchain) -> Result<Self> {
        if extent.is_zero() {
            return Err(EngineError::precondition(format!(
                "cannot build an image chain for a {}x{} extent",
                extent.width, extent.height
            )));
        }

        // Anything created before an error is released by Drop.
        let mut chain = Self {
            device: Arc::clone(&device),
            swapchain: Swapchain::NULL,
            color_format: Format::UNDEFINED,
            depth_format: Format::UNDEFINED,
            extent,
            images: Vec::new(),
            views: Vec::new(),
            depth: Vec::new(),
            render_pass: RenderPass::NULL,
            framebuffers: Vec::new(),
            frames: Vec::new(),
            images_in_flight: Vec::new(),
            current_frame: 0,
            stale: false,
            device_idle: false,
        };

        let created = device.create_swapchain(extent, old)?;
        chain.swapchain = created.swapchain;
        chain.color_format = created.format;
        chain.extent = created.extent;
        chain.images = created.images;

        for &image in &chain.images {
            chain.views.push(device.create_color_view(image, chain.color_format)?);
        }

        chain.depth_format = device.depth_format();
        for _ in 0..chain.images.len() {
            chain
                .depth
                .push(device.create_depth_attachment(chain.extent, chain.depth_format)?);
        }

        chain.render_pass = device.create_render_pass(chain.color_format, chain.depth_format)?;

        for (view, depth) in chain.views.iter().zip(&chain.depth) {
            chain.framebuffers.push(device.create_framebuffer(
                chain.render_pass,
                &[*view, depth.view],
                chain.extent,
            )?);
        }

        for i in 0..chain.images.len() {
            chain.frames.push(FrameSync::default());
            chain.frames[i].image_available = device.create_semaphore()?;
            chain.frames[i].render_finished = device.create_semaphore()?;
            chain.frames[i].in_flight = device.create_fence(true)?;
        }
        chain.images_in_flight = vec![Fence::NULL; chain.images.len()];

        info!(
            "image chain: {}x{}, {} images, color {:?}, depth {:?}{}",
            chain.extent.width,
            chain.extent.height,
            chain.images.len(),
            chain.color_format,
            chain.depth_format,
            if old.is_null() { "" } else { " (recreated)" }
        );
        Ok(chain)
    }

    /// Waits until the current frame slot is free, then asks for an image.
    /// `OutOfDate` leaves the slot untouched so the frame can be retried on a
    /// new chain.
    pub fn acquire_next_image(&mut self) -> Result<Acquire> {
        let frame = self.frames[self.current_frame];
        self.device.wait_for_fence(frame.in_flight)?;

        let acquired = self
            .device
            .acquire_next_image(self.swapchain, frame.image_available)?;
        match acquired {
            Acquire::Image { index, suboptimal } => {
                let slot = &mut self.images_in_flight[index as usize];
                if !slot.is_null() && *slot != frame.in_flight {
                    self.device.wait_for_fence(*slot)?;
                }
                *slot = frame.in_flight;
                if suboptimal {
                    debug!("acquired image {index} from a suboptimal swapchain");
                    self.stale = true;
                }
            }
            Acquire::OutOfDate => {
                debug!("swapchain out of date at acquisition");
                self.stale = true;
            }
        }
        Ok(acquired)
    }

    /// Submits `cmd` for the current slot and queues `image_index` for
    /// presentation once rendering has finished. Advances the slot.
    pub fn submit_and_present(&mut self, cmd: CommandBuffer, image_index: u32) -> Result<PresentStatus> {
        let frame = self.frames[self.current_frame];

        self.device.reset_fence(frame.in_flight)?;
        self.device
            .submit(cmd, frame.image_available, frame.render_finished, frame.in_flight)?;
        let status = self
            .device
            .present(self.swapchain, image_index, frame.render_finished)?;

        if status.is_stale() {
            debug!("present reported {status:?}");
            self.stale = true;
        }
        self.current_frame = (self.current_frame + 1) % self.frames.len();
        Ok(status)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn render_pass(&self) -> RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> RenderSize {
        self.extent
    }

    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.aspect_ratio()
    }

    pub fn color_format(&self) -> Format {
        self.color_format
    }

    pub fn depth_format(&self) -> Format {
        self.depth_format
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn frame_sync(&self, slot: usize) -> FrameSync {
        self.frames[slot]
    }

    /// Set once acquisition or presentation reported the surface as stale.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Same attachment formats, so pipelines built for one render pass work
    /// with the other.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.color_format == other.color_format && self.depth_format == other.depth_format
    }
}

impl<D: Device> Drop for ImageChain<D> {
    fn drop(&mut self) {
        if !self.device_idle {
            if let Err(err) = self.device.wait_idle() {
                warn!("wait_idle failed during image chain teardown: {err}");
            }
        }
        // Reverse creation order; the swapchain goes last.
        for frame in self.frames.drain(..) {
            if !frame.in_flight.is_null() {
                self.device.destroy_fence(frame.in_flight);
            }
            if !frame.render_finished.is_null() {
                self.device.destroy_semaphore(frame.render_finished);
            }
            if !frame.image_available.is_null() {
                self.device.destroy_semaphore(frame.image_available);
            }
        }
        for framebuffer in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(framebuffer);
        }
        if !self.render_pass.is_null() {
            self.device.destroy_render_pass(self.render_pass);
        }
        for depth in self.depth.drain(..) {
            self.device.destroy_depth_attachment(depth);
        }
        for view in self.views.drain(..) {
            self.device.destroy_image_view(view);
        }
        // Images belong to the swapchain.
        if !self.swapchain.is_null() {
            self.device.destroy_swapchain(self.swapchain);
        }
    }
}
