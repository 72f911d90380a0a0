// SPDX-License-Identifier: CEPL-1.0
//! The desktop window: a winit window driven by explicit event pumping so the
//! render loop stays in charge of when events are processed.

use anyhow::{anyhow, Context, Result};
use bismuth_render::{ExtentSource, RenderSize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use winit::application::ApplicationHandler;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::error::OsError;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::{WindowAttributes, WindowId};

pub use winit;

#[derive(Clone, Debug)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "bismuth".to_owned(),
            width: 800,
            height: 600,
        }
    }
}

/// Keys currently held down, by physical position.
#[derive(Debug, Default)]
pub struct KeyState {
    pressed: HashSet<KeyCode>,
}

impl KeyState {
    pub fn apply(&mut self, code: KeyCode, state: ElementState) {
        match state {
            ElementState::Pressed => {
                self.pressed.insert(code);
            }
            ElementState::Released => {
                self.pressed.remove(&code);
            }
        }
    }

    pub fn is_pressed(&self, code: KeyCode) -> bool {
        self.pressed.contains(&code)
    }

    /// Focus loss swallows the release events, so everything is let go.
    pub fn clear(&mut self) {
        self.pressed.clear();
    }
}

fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

struct WindowState {
    attributes: WindowAttributes,
    window: Option<winit::window::Window>,
    create_error: Option<OsError>,
    extent: RenderSize,
    resized: bool,
    close_requested: bool,
    keys: KeyState,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                self.extent = render_size(window.inner_size());
                info!(
                    "window created ({}x{})",
                    self.extent.width, self.extent.height
                );
                self.window = Some(window);
            }
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(new_size) => {
                let extent = render_size(new_size);
                if extent != self.extent {
                    debug!("Resized → {}x{}", extent.width, extent.height);
                    self.extent = extent;
                    self.resized = true;
                }
            }
            WindowEvent::Focused(false) => self.keys.clear(),
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.keys.apply(code, event.state);
                }
            }
            _ => {}
        }
    }
}

/// A single window plus the event loop that feeds it.
pub struct Window {
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl Window {
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().context("creating the event loop")?;
        let attributes = winit::window::Window::default_attributes()
            .with_title(config.title.clone())
            .with_inner_size(LogicalSize::new(config.width, config.height));

        let mut this = Self {
            event_loop,
            state: WindowState {
                attributes,
                window: None,
                create_error: None,
                extent: RenderSize::default(),
                resized: false,
                close_requested: false,
                keys: KeyState::default(),
            },
        };

        // The window is created from the first `resumed` callback.
        while this.state.window.is_none() {
            if let Some(e) = this.state.create_error.take() {
                return Err(anyhow!("creating the window: {e}"));
            }
            if let PumpStatus::Exit(code) = this.pump(None) {
                return Err(anyhow!("event loop exited ({code}) before the window was created"));
            }
        }
        Ok(this)
    }

    fn pump(&mut self, timeout: Option<Duration>) -> PumpStatus {
        let status = self.event_loop.pump_app_events(timeout, &mut self.state);
        if let PumpStatus::Exit(_) = status {
            self.state.close_requested = true;
        }
        status
    }

    /// Processes pending events without blocking.
    pub fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    pub fn should_close(&self) -> bool {
        self.state.close_requested
    }

    /// Returns whether the window was resized since the last call, and clears
    /// the flag.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    pub fn is_key_pressed(&self, code: KeyCode) -> bool {
        self.state.keys.is_pressed(code)
    }

    pub fn keys(&self) -> &KeyState {
        &self.state.keys
    }

    fn inner(&self) -> Result<&winit::window::Window, HandleError> {
        self.state.window.as_ref().ok_or(HandleError::Unavailable)
    }
}

impl ExtentSource for Window {
    fn extent(&self) -> RenderSize {
        self.state.extent
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }
}

impl HasWindowHandle for Window {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.inner()?.window_handle()
    }
}

impl HasDisplayHandle for Window {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.inner()?.display_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_state_tracks_press_and_release() {
        let mut keys = KeyState::default();
        keys.apply(KeyCode::KeyW, ElementState::Pressed);
        keys.apply(KeyCode::KeyA, ElementState::Pressed);
        assert!(keys.is_pressed(KeyCode::KeyW));

        keys.apply(KeyCode::KeyW, ElementState::Released);
        assert!(!keys.is_pressed(KeyCode::KeyW));
        assert!(keys.is_pressed(KeyCode::KeyA));
    }

    #[test]
    fn releasing_an_unpressed_key_is_harmless() {
        let mut keys = KeyState::default();
        keys.apply(KeyCode::Space, ElementState::Released);
        assert!(!keys.is_pressed(KeyCode::Space));
    }

    #[test]
    fn clear_releases_everything() {
        let mut keys = KeyState::default();
        keys.apply(KeyCode::ArrowUp, ElementState::Pressed);
        keys.apply(KeyCode::ControlLeft, ElementState::Pressed);
        keys.clear();
        assert!(!keys.is_pressed(KeyCode::ArrowUp));
        assert!(!keys.is_pressed(KeyCode::ControlLeft));
    }

    #[test]
    fn minimized_windows_report_a_zero_extent() {
        assert!(render_size(PhysicalSize::new(0, 0)).is_zero());
        assert_eq!(render_size(PhysicalSize::new(1280, 720)), RenderSize::new(1280, 720));
    }

    #[test]
    fn default_window_config() {
        let cfg = WindowConfig::default();
        assert_eq!((cfg.width, cfg.height), (800, 600));
        assert_eq!(cfg.title, "bismuth");
    }
}
