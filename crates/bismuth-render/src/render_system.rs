// SPDX-License-Identifier: CEPL-1.0
use crate::device::{CommandBuffer, Device, PipelineLayout, PushConstantRange, RenderPass, ShaderStages};
use crate::mesh::Vertex;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::renderer::Frame;
use crate::scene::{Scene, SceneObject};
use bismuth_core::{EngineError, Result};
use bismuth_math::Camera;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-draw block pushed into the command stream. Matches the `Push` block in
/// `simple.vert` / `simple.frag`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PushConstantData {
    pub transform: Mat4,
    /// `rgb` tints the vertex color; `a` is unused.
    pub color: Vec4,
}

// Vulkan guarantees at least 128 bytes of push constants.
const _: () = assert!(size_of::<PushConstantData>() <= 128);

const PUSH_STAGES: ShaderStages = ShaderStages::VERTEX.union(ShaderStages::FRAGMENT);

/// How an object's [`bismuth_math::Transform`] reaches clip space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransformMode {
    /// `projection * view * model`.
    #[default]
    Spatial,
    /// Flat: `rotation.z` and `scale.xy` as a 2x2 matrix plus `translation.xy`;
    /// the camera is ignored.
    Planar,
}

impl PushConstantData {
    pub fn for_object(mode: TransformMode, projection_view: Mat4, object: &SceneObject) -> Self {
        let transform = match mode {
            TransformMode::Spatial => projection_view * object.transform.matrix(),
            TransformMode::Planar => {
                let m = object.transform.planar_matrix();
                let offset = object.transform.planar_offset();
                Mat4::from_cols(
                    m.x_axis.extend(0.0).extend(0.0),
                    m.y_axis.extend(0.0).extend(0.0),
                    Vec4::Z,
                    Vec4::new(offset.x, offset.y, 0.0, 1.0),
                )
            }
        };
        Self {
            transform,
            color: object.color.extend(1.0),
        }
    }
}

/// Where the render system gets its SPIR-V from when (re)building.
#[derive(Clone, Debug)]
pub enum ShaderSource {
    Files { vert: PathBuf, frag: PathBuf },
    Bytecode { vert: Vec<u8>, frag: Vec<u8> },
}

impl ShaderSource {
    /// `simple.vert.spv` / `simple.frag.spv` inside `dir`.
    pub fn simple_in(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::Files {
            vert: dir.join("simple.vert.spv"),
            frag: dir.join("simple.frag.spv"),
        }
    }
}

/// Draws every meshed scene object with one pipeline and one push-constant
/// block per object.
pub struct SimpleRenderSystem<D: Device> {
    device: Arc<D>,
    layout: PipelineLayout,
    pipeline: Option<Pipeline<D>>,
    shaders: ShaderSource,
    mode: TransformMode,
    render_pass_generation: u64,
}

impl<D: Device> SimpleRenderSystem<D> {
    pub fn new(
        device: Arc<D>,
        render_pass: RenderPass,
        render_pass_generation: u64,
        shaders: ShaderSource,
        mode: TransformMode,
    ) -> Result<Self> {
        let size = size_of::<PushConstantData>() as u32;
        let limit = device.max_push_constants_size();
        if size > limit {
            return Err(EngineError::precondition(format!(
                "push constant block is {size} bytes, device allows {limit}"
            )));
        }

        let layout = device.create_pipeline_layout(&[PushConstantRange {
            stages: PUSH_STAGES,
            offset: 0,
            size,
        }])?;
        let mut system = Self {
            device,
            layout,
            pipeline: None,
            shaders,
            mode,
            render_pass_generation,
        };
        system.build_pipeline(render_pass)?;
        Ok(system)
    }

    fn build_pipeline(&mut self, render_pass: RenderPass) -> Result<()> {
        // The old pipeline goes first; callers only get here with the device idle.
        self.pipeline = None;

        let config = PipelineConfig {
            vertex_input: Vertex::input_description(),
            layout: self.layout,
            render_pass,
            ..Default::default()
        };
        let pipeline = match &self.shaders {
            ShaderSource::Files { vert, frag } => {
                Pipeline::new(Arc::clone(&self.device), vert, frag, &config)?
            }
            ShaderSource::Bytecode { vert, frag } => {
                Pipeline::from_bytecode(Arc::clone(&self.device), vert, frag, &config)?
            }
        };
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Rebuilds the pipeline if the renderer's render pass was replaced by an
    /// incompatible one.
    pub fn sync_render_pass(&mut self, render_pass: RenderPass, generation: u64) -> Result<()> {
        if generation == self.render_pass_generation && self.pipeline.is_some() {
            return Ok(());
        }
        info!(
            "render pass generation {} -> {generation}, rebuilding pipeline",
            self.render_pass_generation
        );
        self.build_pipeline(render_pass)?;
        self.render_pass_generation = generation;
        Ok(())
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TransformMode) {
        self.mode = mode;
    }

    pub fn pipeline_layout(&self) -> PipelineLayout {
        self.layout
    }

    /// Records one push + bind + draw per meshed object, in scene order.
    /// Objects without a mesh are skipped.
    pub fn render_game_objects(&self, frame: &Frame, scene: &Scene<D>, camera: &Camera) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| EngineError::precondition("render system has no pipeline"))?;
        let cmd = frame.command_buffer;
        pipeline.bind(cmd);

        let projection_view = camera.projection_view();
        let mut drawn = 0usize;
        for object in scene.iter() {
            let Some(handle) = object.mesh() else {
                continue;
            };
            let Some(mesh) = scene.meshes().get(handle) else {
                warn!("object {} refers to a released mesh", object.id());
                continue;
            };
            let push = PushConstantData::for_object(self.mode, projection_view, object);
            self.push(cmd, &push);
            mesh.bind(cmd);
            mesh.draw(cmd);
            drawn += 1;
        }
        debug!("recorded {drawn} draws into image {}", frame.image_index);
        Ok(())
    }

    fn push(&self, cmd: CommandBuffer, data: &PushConstantData) {
        self.device
            .cmd_push_constants(cmd, self.layout, PUSH_STAGES, bytemuck::bytes_of(data));
    }
}

impl<D: Device> Drop for SimpleRenderSystem<D> {
    fn drop(&mut self) {
        self.pipeline = None;
        self.device.destroy_pipeline_layout(self.layout);
    }
}
