// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;
mod controller;

use anyhow::{Context, Result};
use bismuth_core::init_tracing;
use bismuth_math::glam::Vec3;
use bismuth_math::{Camera, Transform};
use bismuth_platform::Window;
use bismuth_render::mesh::shapes;
use bismuth_render::{
    Device, Mesh, Renderer, Scene, ShaderSource, SimpleRenderSystem, TransformMode,
};
use bismuth_render_vk::VkDevice;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use config::{load_cfg, AppCfg};
use controller::KeyboardMovementController;

/// Long stalls (dragging the window, a debugger) would otherwise teleport the
/// camera.
const MAX_FRAME_TIME: f32 = 1.0;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing means defaults
    #[arg(long, default_value = "bismuth.toml")]
    config: PathBuf,
    /// Exit after this many rendered frames (0 = run until closed)
    #[arg(long, default_value_t = 0)]
    frames: u64,
    /// Directory with simple.vert.spv / simple.frag.spv, overrides the config
    #[arg(long)]
    shader_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);

    let mut window = Window::new(&cfg.window.to_window_config())?;
    let device = Arc::new(
        VkDevice::new(&window, &window, cfg.render.device_config())
            .context("initializing Vulkan")?,
    );

    // Everything holding the device is dropped inside `run`, so the device
    // (and its surface) goes before the window.
    run(&mut window, device, &cfg, &args)
}

fn run<D: Device>(window: &mut Window, device: Arc<D>, cfg: &AppCfg, args: &Args) -> Result<()> {
    let mut renderer = Renderer::new(Arc::clone(&device), window)?;
    renderer.set_clear_color(cfg.render.clear_color);

    let shaders = match args.shader_dir.as_ref().or(cfg.render.shader_dir.as_ref()) {
        Some(dir) => {
            info!("loading shaders from {}", dir.display());
            ShaderSource::simple_in(dir)
        }
        None => bismuth_render_vk::embedded_shaders(),
    };
    let mut render_system = SimpleRenderSystem::new(
        Arc::clone(&device),
        renderer.render_pass(),
        renderer.render_pass_generation(),
        shaders,
        TransformMode::Spatial,
    )?;
    let mut scene = load_scene(&device)?;

    let mut camera = Camera::new();
    let mut viewer = Transform::default();
    let controller = KeyboardMovementController::new(cfg.camera.move_speed, cfg.camera.look_speed);
    let fov_y = cfg.camera.fov_y_deg.to_radians();

    let mut last = Instant::now();
    let mut last_fps_instant = last;
    let mut frames_since_log = 0u32;
    let mut rendered = 0u64;

    while !window.should_close() {
        window.poll_events();
        if window.take_resized() {
            renderer.notify_resized();
        }

        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f32().min(MAX_FRAME_TIME);
        last = now;

        controller.move_in_plane_xz(window.keys(), dt, &mut viewer);
        camera.set_view_yxz(viewer.translation, viewer.rotation);
        scene.advance(dt);

        let Some(frame) = renderer.begin_frame(window)? else {
            continue;
        };
        camera.set_perspective_projection(
            fov_y,
            renderer.aspect_ratio(),
            cfg.camera.near,
            cfg.camera.far,
        )?;
        render_system.sync_render_pass(renderer.render_pass(), renderer.render_pass_generation())?;

        renderer.begin_render_pass(&frame)?;
        render_system.render_game_objects(&frame, &scene, &camera)?;
        renderer.end_render_pass(&frame)?;
        renderer.end_frame(window)?;

        rendered += 1;
        frames_since_log += 1;
        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", frames_since_log);
            frames_since_log = 0;
            last_fps_instant = now;
        }
        if args.frames != 0 && rendered >= args.frames {
            info!("rendered {rendered} frames, exiting");
            break;
        }
    }

    renderer.wait_idle()?;
    drop(scene);
    drop(render_system);
    drop(renderer);
    Ok(())
}

/// A large spinning cube in front of the camera flanked by two small tinted
/// ones, all sharing one mesh.
fn load_scene<D: Device>(device: &Arc<D>) -> Result<Scene<D>> {
    let mut scene = Scene::new();
    let cube = scene.add_mesh(Mesh::new(Arc::clone(device), &shapes::cube())?);

    let layout = [
        (Vec3::new(0.0, 0.0, 2.5), 0.5, Vec3::ONE, Vec3::new(0.3, 0.6, 0.0)),
        (Vec3::new(-1.2, 0.0, 3.0), 0.25, Vec3::new(1.0, 0.4, 0.4), Vec3::new(0.0, 1.2, 0.0)),
        (Vec3::new(1.2, 0.0, 3.0), 0.25, Vec3::new(0.4, 0.4, 1.0), Vec3::new(0.9, 0.0, 0.4)),
    ];
    for (translation, scale, color, spin) in layout {
        let id = scene.spawn(Some(cube))?;
        if let Some(obj) = scene.get_mut(id) {
            obj.transform = Transform {
                translation,
                scale: Vec3::splat(scale),
                ..Default::default()
            };
            obj.color = color;
            obj.spin = spin;
        }
    }
    scene.release_mesh(cube)?;

    info!("scene ready: {} objects", scene.len());
    Ok(scene)
}
