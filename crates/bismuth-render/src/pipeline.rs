// SPDX-License-Identifier: CEPL-1.0
use crate::device::{
    self, Device, GraphicsPipelineDesc, PipelineLayout, Rect2D, RenderPass, ShaderModule, Viewport,
};
use bismuth_core::{EngineError, Result};
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point both shader stages are compiled with.
pub const SHADER_ENTRY_POINT: &CStr = c"main";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewportState {
    /// Viewport and scissor are set per command buffer.
    Dynamic,
    Fixed { viewport: Viewport, scissor: Rect2D },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub line_width: f32,
    pub depth_clamp: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MultisampleState {
    /// Samples per pixel; 1 disables multisampling.
    pub samples: u32,
    /// Minimum sample-shading fraction, `None` when sample shading is off.
    pub sample_shading: Option<f32>,
    pub alpha_to_coverage: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ColorWriteMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RGBA = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl ColorBlendAttachment {
    pub fn disabled() -> Self {
        Self {
            blend_enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::RGBA,
        }
    }

    // Transparent geometry must be drawn after opaque geometry.
    pub fn alpha_blending() -> Self {
        Self {
            blend_enable: true,
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            ..Self::disabled()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: CompareOp,
    /// `(min, max)` when the depth-bounds test is enabled.
    pub depth_bounds: Option<(f32, f32)>,
    pub stencil_test: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Vertex buffer layout, supplied by the vertex type rather than the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexInputDescription {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

/// Complete fixed-function state of a graphics pipeline.
///
/// `layout` and `render_pass` start out null and must be filled in by the
/// owner before the config is handed to [`Pipeline::new`].
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub topology: PrimitiveTopology,
    pub primitive_restart: bool,
    pub viewport: ViewportState,
    pub rasterization: RasterizationState,
    pub multisample: MultisampleState,
    pub color_blend: ColorBlendAttachment,
    pub depth_stencil: DepthStencilState,
    pub vertex_input: VertexInputDescription,
    pub layout: PipelineLayout,
    pub render_pass: RenderPass,
    pub subpass: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::TriangleList,
            primitive_restart: false,
            viewport: ViewportState::Dynamic,
            rasterization: RasterizationState {
                polygon_mode: PolygonMode::Fill,
                cull_mode: CullMode::None,
                front_face: FrontFace::Clockwise,
                line_width: 1.0,
                depth_clamp: false,
            },
            multisample: MultisampleState {
                samples: 1,
                sample_shading: None,
                alpha_to_coverage: false,
            },
            color_blend: ColorBlendAttachment::disabled(),
            depth_stencil: DepthStencilState {
                depth_test: true,
                depth_write: true,
                compare_op: CompareOp::Less,
                depth_bounds: None,
                stencil_test: false,
            },
            vertex_input: VertexInputDescription::default(),
            layout: PipelineLayout::NULL,
            render_pass: RenderPass::NULL,
            subpass: 0,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layout.is_null() {
            return Err(EngineError::precondition(
                "cannot create pipeline: no pipeline layout provided in config",
            ));
        }
        if self.render_pass.is_null() {
            return Err(EngineError::precondition(
                "cannot create pipeline: no render pass provided in config",
            ));
        }
        if self.multisample.samples == 0 || !self.multisample.samples.is_power_of_two() {
            return Err(EngineError::precondition(format!(
                "sample count must be a power of two (got {})",
                self.multisample.samples
            )));
        }
        Ok(())
    }
}

/// Shader modules + immutable graphics pipeline. Releases all three handles on
/// drop; the device is shared and outlives it.
pub struct Pipeline<D: Device> {
    device: Arc<D>,
    pipeline: device::Pipeline,
    vert_module: ShaderModule,
    frag_module: ShaderModule,
}

impl<D: Device> Pipeline<D> {
    pub fn new(
        device: Arc<D>,
        vert_path: impl AsRef<Path>,
        frag_path: impl AsRef<Path>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let vert_code = read_bytecode(vert_path.as_ref())?;
        let frag_code = read_bytecode(frag_path.as_ref())?;
        Self::from_bytecode(device, &vert_code, &frag_code, config)
    }

    pub fn from_bytecode(
        device: Arc<D>,
        vert_code: &[u8],
        frag_code: &[u8],
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;

        // Partially built pipelines are released by Drop.
        let mut this = Self {
            device,
            pipeline: device::Pipeline::NULL,
            vert_module: ShaderModule::NULL,
            frag_module: ShaderModule::NULL,
        };
        this.vert_module = this.device.create_shader_module(vert_code)?;
        this.frag_module = this.device.create_shader_module(frag_code)?;
        this.pipeline = this.device.create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex: this.vert_module,
            fragment: this.frag_module,
            entry_point: SHADER_ENTRY_POINT,
            config,
        })?;

        info!(
            "pipeline ready (vert {} bytes, frag {} bytes, subpass {})",
            vert_code.len(),
            frag_code.len(),
            config.subpass
        );
        Ok(this)
    }

    pub fn bind(&self, cmd: device::CommandBuffer) {
        self.device.cmd_bind_pipeline(cmd, self.pipeline);
    }

    pub fn handle(&self) -> device::Pipeline {
        self.pipeline
    }
}

impl<D: Device> Drop for Pipeline<D> {
    fn drop(&mut self) {
        if !self.pipeline.is_null() {
            self.device.destroy_pipeline(self.pipeline);
        }
        if !self.frag_module.is_null() {
            self.device.destroy_shader_module(self.frag_module);
        }
        if !self.vert_module.is_null() {
            self.device.destroy_shader_module(self.vert_module);
        }
    }
}

fn read_bytecode(path: &Path) -> Result<Vec<u8>> {
    let code = std::fs::read(path).map_err(|e| EngineError::io(path, e))?;
    debug!("read {} bytes of shader bytecode from {}", code.len(), path.display());
    Ok(code)
}
