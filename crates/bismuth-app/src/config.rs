// SPDX-License-Identifier: CEPL-1.0
use bismuth_platform::WindowConfig;
use bismuth_render_vk::{VkDeviceConfig, VkVsyncMode};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub camera: CameraCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowCfg {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default = "default_vsync")]
    pub vsync: bool,
    #[serde(default)]
    pub vsync_mode: VsyncMode,
    /// Directory holding `simple.vert.spv` / `simple.frag.spv`. Unset means
    /// the shaders built into the binary.
    #[serde(default)]
    pub shader_dir: Option<PathBuf>,
    #[serde(default)]
    pub pipeline_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CameraCfg {
    #[serde(default = "default_fov")]
    pub fov_y_deg: f32,
    #[serde(default = "default_near")]
    pub near: f32,
    #[serde(default = "default_far")]
    pub far: f32,
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,
    #[serde(default = "default_look_speed")]
    pub look_speed: f32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            width: default_width(),
            height: default_height(),
            title: default_title(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync: default_vsync(),
            vsync_mode: VsyncMode::default(),
            shader_dir: None,
            pipeline_cache_dir: None,
        }
    }
}

impl Default for CameraCfg {
    fn default() -> Self {
        CameraCfg {
            fov_y_deg: default_fov(),
            near: default_near(),
            far: default_far(),
            move_speed: default_move_speed(),
            look_speed: default_look_speed(),
        }
    }
}

fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_title() -> String {
    "bismuth".to_owned()
}
fn default_clear() -> [f32; 4] {
    [0.01, 0.01, 0.01, 1.0]
}
fn default_vsync() -> bool {
    true
}
fn default_fov() -> f32 {
    50.0
}
fn default_near() -> f32 {
    0.1
}
fn default_far() -> f32 {
    10.0
}
fn default_move_speed() -> f32 {
    3.0
}
fn default_look_speed() -> f32 {
    1.5
}

impl WindowCfg {
    pub fn to_window_config(&self) -> WindowConfig {
        WindowConfig {
            title: self.title.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

impl RenderCfg {
    pub fn device_config(&self) -> VkDeviceConfig {
        VkDeviceConfig {
            vsync: self.vsync,
            vsync_mode: match self.vsync_mode {
                VsyncMode::Fifo => VkVsyncMode::Fifo,
                VsyncMode::Mailbox => VkVsyncMode::Mailbox,
            },
            pipeline_cache_dir: self.pipeline_cache_dir.clone(),
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(text)
}

/// Reads `path`, falling back to defaults when the file is missing or does
/// not parse.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("ignoring {}: {e}", path.display());
            AppCfg::default()
        }),
        Err(e) => {
            debug!("no config at {} ({e}), using defaults", path.display());
            AppCfg::default()
        }
    }
}
