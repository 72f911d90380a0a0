// SPDX-License-Identifier: CEPL-1.0
//! Recording stand-ins for the GPU and the window, used by unit tests.
//!
//! `MockDevice` hands out sequential handles, keeps a per-command-buffer log
//! of recorded commands and tracks fence states the way a driver would, so
//! synchronisation mistakes show up as panics instead of hangs.

use crate::device::*;
use crate::ExtentSource;
use crate::RenderSize;
use bismuth_core::{EngineError, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

/// Smallest blob the mock accepts as shader bytecode: the SPIR-V magic word
/// followed by a version word.
pub const VALID_SPIRV: &[u8] = &[0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginRenderPass(RenderPassBegin),
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(Rect2D),
    BindPipeline(Pipeline),
    PushConstants {
        layout: PipelineLayout,
        stages: ShaderStages,
        data: Vec<u8>,
    },
    BindVertexBuffer(Buffer),
    BindIndexBuffer(Buffer),
    Draw(u32),
    DrawIndexed(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submission {
    pub cmd: CommandBuffer,
    pub wait: Semaphore,
    pub signal: Semaphore,
    pub fence: Fence,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    calls: usize,
    image_count: u32,
    next_image: HashMap<u64, u32>,
    swapchains: HashMap<u64, u32>,
    swapchain_extents: Vec<RenderSize>,
    old_swapchains: Vec<Swapchain>,
    depth_format: i32,
    acquire_script: VecDeque<Acquire>,
    present_script: VecDeque<PresentStatus>,
    fail_once: HashSet<&'static str>,
    live: HashMap<&'static str, usize>,
    fences: HashMap<u64, FenceState>,
    max_pending: usize,
    cmd_fence: HashMap<u64, u64>,
    recordings: HashMap<u64, Vec<Command>>,
    recording: HashSet<u64>,
    submissions: Vec<Submission>,
    presentations: Vec<(Swapchain, u32)>,
    draws: usize,
    wait_idles: usize,
    log: Vec<&'static str>,
}

impl State {
    fn handle<K>(&mut self, kind: &'static str) -> Handle<K> {
        self.next_handle += 1;
        *self.live.entry(kind).or_default() += 1;
        Handle::from_raw(self.next_handle)
    }

    fn release(&mut self, kind: &'static str, raw: u64) {
        assert_ne!(raw, 0, "destroying a null {kind}");
        let live = self.live.entry(kind).or_default();
        assert!(*live > 0, "double destroy of {kind}");
        *live -= 1;
    }

    fn check(&mut self, op: &'static str) -> Result<()> {
        self.calls += 1;
        if self.fail_once.remove(op) {
            return Err(EngineError::device(op, "ERROR_INITIALIZATION_FAILED"));
        }
        Ok(())
    }

    fn push(&mut self, cmd: CommandBuffer, command: Command) {
        self.calls += 1;
        assert!(
            self.recording.contains(&cmd.as_raw()),
            "{command:?} recorded outside begin/end"
        );
        self.recordings.entry(cmd.as_raw()).or_default().push(command);
    }

    fn pending(&self) -> usize {
        self.fences
            .values()
            .filter(|s| **s == FenceState::Pending)
            .count()
    }
}

pub struct MockDevice {
    state: RefCell<State>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_image_count(3)
    }

    pub fn with_image_count(image_count: u32) -> Self {
        Self {
            state: RefCell::new(State {
                image_count,
                depth_format: 126,
                ..Default::default()
            }),
        }
    }

    /// Image count used by the next swapchain creation.
    pub fn set_image_count(&self, count: u32) {
        self.state.borrow_mut().image_count = count;
    }

    pub fn script_acquire(&self, result: Acquire) {
        self.state.borrow_mut().acquire_script.push_back(result);
    }

    pub fn script_present(&self, status: PresentStatus) {
        self.state.borrow_mut().present_script.push_back(status);
    }

    pub fn set_depth_format(&self, raw: i32) {
        self.state.borrow_mut().depth_format = raw;
    }

    pub fn fail_once(&self, op: &'static str) {
        self.state.borrow_mut().fail_once.insert(op);
    }

    pub fn call_count(&self) -> usize {
        self.state.borrow().calls
    }

    pub fn commands(&self, cmd: CommandBuffer) -> Vec<Command> {
        self.state
            .borrow()
            .recordings
            .get(&cmd.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    pub fn pipeline_binds(&self, cmd: CommandBuffer) -> Vec<Pipeline> {
        self.commands(cmd)
            .into_iter()
            .filter_map(|c| match c {
                Command::BindPipeline(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn push_constant_payloads(&self, cmd: CommandBuffer) -> Vec<Vec<u8>> {
        self.commands(cmd)
            .into_iter()
            .filter_map(|c| match c {
                Command::PushConstants { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn live(&self, kind: &'static str) -> usize {
        self.state.borrow().live.get(kind).copied().unwrap_or(0)
    }

    pub fn live_shader_modules(&self) -> usize {
        self.live("shader_module")
    }

    pub fn live_pipelines(&self) -> usize {
        self.live("pipeline")
    }

    pub fn live_command_buffers(&self) -> usize {
        self.live("command_buffer")
    }

    pub fn live_buffers(&self) -> usize {
        self.live("buffer")
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.borrow().submissions.clone()
    }

    pub fn presentations(&self) -> usize {
        self.state.borrow().presentations.len()
    }

    pub fn draw_calls(&self) -> usize {
        self.state.borrow().draws
    }

    pub fn max_pending_fences(&self) -> usize {
        self.state.borrow().max_pending
    }

    pub fn wait_idles(&self) -> usize {
        self.state.borrow().wait_idles
    }

    pub fn swapchain_extents(&self) -> Vec<RenderSize> {
        self.state.borrow().swapchain_extents.clone()
    }

    pub fn old_swapchains(&self) -> Vec<Swapchain> {
        self.state.borrow().old_swapchains.clone()
    }

    /// Coarse ordering of frame-level operations.
    pub fn log(&self) -> Vec<&'static str> {
        self.state.borrow().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }
}

impl Device for MockDevice {
    fn max_push_constants_size(&self) -> u32 {
        128
    }

    fn create_shader_module(&self, code: &[u8]) -> Result<ShaderModule> {
        let mut s = self.state.borrow_mut();
        s.check("create_shader_module")?;
        if code.len() < 4 || code.len() % 4 != 0 || code[..4] != VALID_SPIRV[..4] {
            return Err(EngineError::device(
                "create_shader_module",
                "ERROR_INVALID_SHADER_NV",
            ));
        }
        Ok(s.handle("shader_module"))
    }

    fn destroy_shader_module(&self, module: ShaderModule) {
        self.state
            .borrow_mut()
            .release("shader_module", module.as_raw());
    }

    fn create_pipeline_layout(&self, push_constants: &[PushConstantRange]) -> Result<PipelineLayout> {
        let mut s = self.state.borrow_mut();
        s.check("create_pipeline_layout")?;
        for range in push_constants {
            assert!(
                range.offset + range.size <= self.max_push_constants_size(),
                "push constant range exceeds device limit"
            );
        }
        Ok(s.handle("pipeline_layout"))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayout) {
        self.state
            .borrow_mut()
            .release("pipeline_layout", layout.as_raw());
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<Pipeline> {
        let mut s = self.state.borrow_mut();
        s.check("create_graphics_pipeline")?;
        assert!(!desc.vertex.is_null() && !desc.fragment.is_null());
        assert!(!desc.config.layout.is_null() && !desc.config.render_pass.is_null());
        assert_eq!(desc.entry_point.to_bytes(), b"main");
        Ok(s.handle("pipeline"))
    }

    fn destroy_pipeline(&self, pipeline: Pipeline) {
        self.state.borrow_mut().release("pipeline", pipeline.as_raw());
    }

    fn create_swapchain(&self, extent: RenderSize, old: Swapchain) -> Result<SwapchainImages> {
        let mut s = self.state.borrow_mut();
        s.check("create_swapchain")?;
        assert!(!extent.is_zero(), "swapchain requested with zero extent");
        if !old.is_null() {
            assert!(s.swapchains.contains_key(&old.as_raw()), "stale old swapchain");
        }
        s.log.push("create_swapchain");
        let swapchain: Swapchain = s.handle("swapchain");
        let count = s.image_count;
        s.swapchains.insert(swapchain.as_raw(), count);
        s.swapchain_extents.push(extent);
        s.old_swapchains.push(old);
        let images: Vec<Image> = (0..count).map(|_| s.handle("image_unowned")).collect();
        Ok(SwapchainImages {
            swapchain,
            images,
            format: Format(44),
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: Swapchain) {
        let mut s = self.state.borrow_mut();
        s.release("swapchain", swapchain.as_raw());
        if let Some(count) = s.swapchains.remove(&swapchain.as_raw()) {
            *s.live.entry("image_unowned").or_default() -= count as usize;
        }
    }

    fn create_color_view(&self, image: Image, _format: Format) -> Result<ImageView> {
        let mut s = self.state.borrow_mut();
        s.check("create_color_view")?;
        assert!(!image.is_null());
        Ok(s.handle("image_view"))
    }

    fn destroy_image_view(&self, view: ImageView) {
        self.state.borrow_mut().release("image_view", view.as_raw());
    }

    fn depth_format(&self) -> Format {
        Format(self.state.borrow().depth_format)
    }

    fn create_depth_attachment(&self, extent: RenderSize, _format: Format) -> Result<DepthAttachment> {
        let mut s = self.state.borrow_mut();
        s.check("create_depth_attachment")?;
        assert!(!extent.is_zero());
        Ok(DepthAttachment {
            image: s.handle("depth"),
            memory: DeviceMemory::from_raw(u64::MAX),
            view: ImageView::from_raw(u64::MAX - 1),
        })
    }

    fn destroy_depth_attachment(&self, depth: DepthAttachment) {
        self.state.borrow_mut().release("depth", depth.image.as_raw());
    }

    fn create_render_pass(&self, _color: Format, _depth: Format) -> Result<RenderPass> {
        let mut s = self.state.borrow_mut();
        s.check("create_render_pass")?;
        Ok(s.handle("render_pass"))
    }

    fn destroy_render_pass(&self, render_pass: RenderPass) {
        self.state
            .borrow_mut()
            .release("render_pass", render_pass.as_raw());
    }

    fn create_framebuffer(
        &self,
        render_pass: RenderPass,
        attachments: &[ImageView],
        extent: RenderSize,
    ) -> Result<Framebuffer> {
        let mut s = self.state.borrow_mut();
        s.check("create_framebuffer")?;
        assert!(!render_pass.is_null());
        assert_eq!(attachments.len(), 2, "color + depth");
        assert!(!extent.is_zero());
        Ok(s.handle("framebuffer"))
    }

    fn destroy_framebuffer(&self, framebuffer: Framebuffer) {
        self.state
            .borrow_mut()
            .release("framebuffer", framebuffer.as_raw());
    }

    fn create_semaphore(&self) -> Result<Semaphore> {
        let mut s = self.state.borrow_mut();
        s.check("create_semaphore")?;
        Ok(s.handle("semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: Semaphore) {
        self.state
            .borrow_mut()
            .release("semaphore", semaphore.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let mut s = self.state.borrow_mut();
        s.check("create_fence")?;
        let fence: Fence = s.handle("fence");
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        s.fences.insert(fence.as_raw(), state);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: Fence) {
        let mut s = self.state.borrow_mut();
        s.release("fence", fence.as_raw());
        let state = s.fences.remove(&fence.as_raw());
        assert_ne!(state, Some(FenceState::Pending), "destroying a fence in use");
    }

    fn wait_for_fence(&self, fence: Fence) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.check("wait_for_fence")?;
        let state = s.fences.get_mut(&fence.as_raw()).expect("unknown fence");
        assert_ne!(
            *state,
            FenceState::Unsignaled,
            "waiting on a fence nothing will signal"
        );
        *state = FenceState::Signaled;
        Ok(())
    }

    fn reset_fence(&self, fence: Fence) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.check("reset_fence")?;
        let state = s.fences.get_mut(&fence.as_raw()).expect("unknown fence");
        assert_ne!(*state, FenceState::Pending, "resetting a fence in use");
        *state = FenceState::Unsignaled;
        Ok(())
    }

    fn acquire_next_image(&self, swapchain: Swapchain, signal: Semaphore) -> Result<Acquire> {
        let mut s = self.state.borrow_mut();
        s.check("acquire_next_image")?;
        assert!(!signal.is_null());
        let count = *s
            .swapchains
            .get(&swapchain.as_raw())
            .expect("acquire on a destroyed swapchain");
        s.log.push("acquire");
        // Scripted results are returned as given and leave the rotation alone.
        if let Some(scripted) = s.acquire_script.pop_front() {
            if let Acquire::Image { index, .. } = scripted {
                assert!(index < count, "scripted image {index} out of {count}");
            }
            return Ok(scripted);
        }
        let next = s.next_image.entry(swapchain.as_raw()).or_insert(0);
        let index = *next % count;
        *next += 1;
        Ok(Acquire::Image {
            index,
            suboptimal: false,
        })
    }

    fn submit(
        &self,
        cmd: CommandBuffer,
        wait: Semaphore,
        signal: Semaphore,
        fence: Fence,
    ) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.check("submit")?;
        assert!(!s.recording.contains(&cmd.as_raw()), "submitting an open command buffer");
        let state = s.fences.get_mut(&fence.as_raw()).expect("unknown fence");
        assert_eq!(*state, FenceState::Unsignaled, "submitting with an unreset fence");
        *state = FenceState::Pending;
        s.cmd_fence.insert(cmd.as_raw(), fence.as_raw());
        let pending = s.pending();
        s.max_pending = s.max_pending.max(pending);
        s.log.push("submit");
        s.submissions.push(Submission {
            cmd,
            wait,
            signal,
            fence,
        });
        Ok(())
    }

    fn present(&self, swapchain: Swapchain, image_index: u32, wait: Semaphore) -> Result<PresentStatus> {
        let mut s = self.state.borrow_mut();
        s.check("present")?;
        assert!(!wait.is_null());
        assert!(s.swapchains.contains_key(&swapchain.as_raw()));
        s.log.push("present");
        s.presentations.push((swapchain, image_index));
        Ok(s.present_script.pop_front().unwrap_or(PresentStatus::Optimal))
    }

    fn wait_idle(&self) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.check("wait_idle")?;
        for state in s.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
        s.wait_idles += 1;
        s.log.push("wait_idle");
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<CommandBuffer>> {
        let mut s = self.state.borrow_mut();
        s.check("allocate_command_buffers")?;
        Ok((0..count).map(|_| s.handle("command_buffer")).collect())
    }

    fn free_command_buffers(&self, buffers: &[CommandBuffer]) {
        let mut s = self.state.borrow_mut();
        for cmd in buffers {
            if let Some(fence) = s.cmd_fence.remove(&cmd.as_raw()) {
                assert_ne!(
                    s.fences.get(&fence),
                    Some(&FenceState::Pending),
                    "freeing a command buffer still in flight"
                );
            }
            s.recordings.remove(&cmd.as_raw());
            s.release("command_buffer", cmd.as_raw());
        }
    }

    fn begin_command_buffer(&self, cmd: CommandBuffer) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.check("begin_command_buffer")?;
        if let Some(fence) = s.cmd_fence.get(&cmd.as_raw()) {
            assert_ne!(
                s.fences.get(fence),
                Some(&FenceState::Pending),
                "re-recording a command buffer still in flight"
            );
        }
        assert!(s.recording.insert(cmd.as_raw()), "command buffer begun twice");
        s.recordings.insert(cmd.as_raw(), Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBuffer) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.check("end_command_buffer")?;
        assert!(s.recording.remove(&cmd.as_raw()), "ending a command buffer never begun");
        Ok(())
    }

    fn cmd_begin_render_pass(&self, cmd: CommandBuffer, begin: &RenderPassBegin) {
        self.state
            .borrow_mut()
            .push(cmd, Command::BeginRenderPass(*begin));
    }

    fn cmd_end_render_pass(&self, cmd: CommandBuffer) {
        self.state.borrow_mut().push(cmd, Command::EndRenderPass);
    }

    fn cmd_set_viewport(&self, cmd: CommandBuffer, viewport: Viewport) {
        self.state
            .borrow_mut()
            .push(cmd, Command::SetViewport(viewport));
    }

    fn cmd_set_scissor(&self, cmd: CommandBuffer, scissor: Rect2D) {
        self.state.borrow_mut().push(cmd, Command::SetScissor(scissor));
    }

    fn cmd_bind_pipeline(&self, cmd: CommandBuffer, pipeline: Pipeline) {
        self.state
            .borrow_mut()
            .push(cmd, Command::BindPipeline(pipeline));
    }

    fn cmd_push_constants(
        &self,
        cmd: CommandBuffer,
        layout: PipelineLayout,
        stages: ShaderStages,
        data: &[u8],
    ) {
        self.state.borrow_mut().push(
            cmd,
            Command::PushConstants {
                layout,
                stages,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(&self, cmd: CommandBuffer, buffer: Buffer) {
        self.state
            .borrow_mut()
            .push(cmd, Command::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(&self, cmd: CommandBuffer, buffer: Buffer) {
        self.state
            .borrow_mut()
            .push(cmd, Command::BindIndexBuffer(buffer));
    }

    fn cmd_draw(&self, cmd: CommandBuffer, vertex_count: u32) {
        let mut s = self.state.borrow_mut();
        s.draws += 1;
        s.push(cmd, Command::Draw(vertex_count));
    }

    fn cmd_draw_indexed(&self, cmd: CommandBuffer, index_count: u32) {
        let mut s = self.state.borrow_mut();
        s.draws += 1;
        s.push(cmd, Command::DrawIndexed(index_count));
    }

    fn create_buffer(&self, _usage: BufferUsage, data: &[u8]) -> Result<GpuBuffer> {
        let mut s = self.state.borrow_mut();
        s.check("create_buffer")?;
        assert!(!data.is_empty());
        Ok(GpuBuffer {
            buffer: s.handle("buffer"),
            memory: DeviceMemory::from_raw(u64::MAX),
            size: data.len() as u64,
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        self.state.borrow_mut().release("buffer", buffer.buffer.as_raw());
    }
}

/// Extent source that replays a queue of extents, one per `wait_events`.
pub struct MockWindow {
    extent: RenderSize,
    pending: VecDeque<RenderSize>,
    waits: usize,
}

impl MockWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: RenderSize { width, height },
            pending: VecDeque::new(),
            waits: 0,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = RenderSize { width, height };
    }

    /// Extents delivered by successive blocking waits.
    pub fn queue_extent(&mut self, width: u32, height: u32) {
        self.pending.push_back(RenderSize { width, height });
    }

    pub fn waits(&self) -> usize {
        self.waits
    }
}

impl ExtentSource for MockWindow {
    fn extent(&self) -> RenderSize {
        self.extent
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        self.extent = self
            .pending
            .pop_front()
            .expect("wait_events would block forever: no more window events queued");
    }
}
