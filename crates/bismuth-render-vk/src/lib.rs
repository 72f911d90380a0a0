// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the frame core.

mod context;
mod convert;
mod device;
mod surface;

use bismuth_render::ShaderSource;
use std::path::PathBuf;

pub use device::VkDevice;
pub use surface::VkVsyncMode;

/// Where `build.rs` wrote the compiled SPIR-V.
pub const SHADER_DIR: &str = env!("OUT_DIR");

const SIMPLE_VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/simple.vert.spv"));
const SIMPLE_FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/simple.frag.spv"));

/// The simple vertex/fragment pair baked into the binary at build time.
pub fn embedded_shaders() -> ShaderSource {
    ShaderSource::Bytecode {
        vert: SIMPLE_VERT_SPV.to_vec(),
        frag: SIMPLE_FRAG_SPV.to_vec(),
    }
}

#[derive(Clone, Debug)]
pub struct VkDeviceConfig {
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
    /// Directory for the on-disk pipeline cache; `None` keeps it in memory.
    pub pipeline_cache_dir: Option<PathBuf>,
}

impl Default for VkDeviceConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            vsync_mode: VkVsyncMode::Fifo,
            pipeline_cache_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_shaders_are_spirv() {
        let ShaderSource::Bytecode { vert, frag } = embedded_shaders() else {
            panic!("expected bytecode");
        };
        for code in [vert, frag] {
            assert_eq!(code.len() % 4, 0);
            assert_eq!(&code[..4], &0x0723_0203u32.to_le_bytes());
        }
    }

    #[test]
    fn default_config_is_vsynced_fifo() {
        let cfg = VkDeviceConfig::default();
        assert!(cfg.vsync);
        assert_eq!(cfg.vsync_mode, VkVsyncMode::Fifo);
        assert!(cfg.pipeline_cache_dir.is_none());
    }
}
