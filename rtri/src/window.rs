use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("SDL initialisation failed: {0}")]
    SdlInit(String),

    #[error("SDL video subsystem initialisation failed: {0}")]
    VideoInit(String),

    #[error("Window creation failed: {0}")]
    Build(#[from] sdl2::video::WindowBuildError),

    #[error("Event pump creation failed: {0}")]
    EventPump(String),
}

impl WindowError {
    /// `true` when the failure happened before a window could even be
    /// attempted (the windowing subsystem itself failed to come up).
    pub fn is_subsystem_failure(&self) -> bool {
        matches!(self, WindowError::SdlInit(_) | WindowError::VideoInit(_))
    }
}

/// The shared window handle the surface layer borrows against.
///
/// Kept behind an `Arc` separately from [`Window`] so that the surface can
/// hold the window alive (parent-child, like every other wrapper in this
/// crate) while event polling still has `&mut` access to the pump.
pub struct WindowHandles {
    window: sdl2::video::Window,
}

impl std::fmt::Debug for WindowHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowHandles")
            .field("id", &self.window.id())
            .finish_non_exhaustive()
    }
}

impl HasWindowHandle for WindowHandles {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for WindowHandles {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

/// One native window plus its event pump and tick epoch.
///
/// Owns the only live window; creating a second `Window` while one exists is
/// unsupported (SDL is process-global).
pub struct Window {
    _sdl: sdl2::Sdl,
    _video: sdl2::VideoSubsystem,
    shared: Arc<WindowHandles>,
    events: sdl2::EventPump,
    epoch: Instant,
    /// Quit observed while draining events inside
    /// [`wait_for_nonzero_extent`](Self::wait_for_nonzero_extent); reported by
    /// the next [`poll_quit`](Self::poll_quit) so the event is not lost.
    pending_quit: bool,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl Window {
    /// Initialise the video subsystem and create one resizable,
    /// Vulkan-capable window.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self, WindowError> {
        let sdl = sdl2::init().map_err(WindowError::SdlInit)?;
        let video = sdl.video().map_err(WindowError::VideoInit)?;

        let window = video
            .window(title, width, height)
            .position_centered()
            .resizable()
            .vulkan()
            .build()?;

        let events = sdl.event_pump().map_err(WindowError::EventPump)?;

        tracing::info!("Window created: \"{}\" ({}x{})", title, width, height);

        Ok(Self {
            _sdl: sdl,
            _video: video,
            shared: Arc::new(WindowHandles { window }),
            events,
            epoch: Instant::now(),
            pending_quit: false,
        })
    }

    /// The shared handle source for surface creation.
    pub fn shared_handles(&self) -> &Arc<WindowHandles> {
        &self.shared
    }

    /// Drain all pending events. Returns `true` when a quit request or an
    /// Escape key press was observed (in this call or while a previous
    /// extent wait was draining the queue).
    pub fn poll_quit(&mut self) -> bool {
        let mut quit = std::mem::take(&mut self.pending_quit);
        for event in self.events.poll_iter() {
            if is_quit_event(&event) {
                quit = true;
            }
        }
        quit
    }

    /// Monotonically non-decreasing milliseconds since window creation.
    pub fn ticks(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// The window's current drawable size in pixels.
    pub fn drawable_extent(&self) -> vk::Extent2D {
        let (width, height) = self.shared.window.vulkan_drawable_size();
        vk::Extent2D { width, height }
    }

    /// Block on the event queue until the drawable size is positive in both
    /// dimensions, then return it. Used before swapchain rebuilds so a
    /// minimised window parks the engine instead of busy-failing.
    pub fn wait_for_nonzero_extent(&mut self) -> vk::Extent2D {
        loop {
            let extent = self.drawable_extent();
            if extent_is_renderable(extent) {
                return extent;
            }
            tracing::debug!(
                "Drawable extent is degenerate ({}x{}); waiting for events",
                extent.width,
                extent.height
            );
            if let Some(event) = self.events.wait_event_timeout(100)
                && is_quit_event(&event)
            {
                self.pending_quit = true;
            }
        }
    }
}

/// Whether `event` asks the application to quit.
fn is_quit_event(event: &Event) -> bool {
    matches!(
        event,
        Event::Quit { .. }
            | Event::KeyDown {
                keycode: Some(Keycode::Escape),
                ..
            }
    )
}

/// Whether an extent can back a swapchain (positive in both dimensions).
pub fn extent_is_renderable(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdl2::keyboard::Mod;

    fn key_down(keycode: Option<Keycode>) -> Event {
        Event::KeyDown {
            timestamp: 0,
            window_id: 0,
            keycode,
            scancode: None,
            keymod: Mod::NOMOD,
            repeat: false,
        }
    }

    #[test]
    fn quit_event_is_quit() {
        assert!(is_quit_event(&Event::Quit { timestamp: 0 }));
    }

    #[test]
    fn escape_key_is_quit() {
        assert!(is_quit_event(&key_down(Some(Keycode::Escape))));
    }

    #[test]
    fn other_keys_are_not_quit() {
        assert!(!is_quit_event(&key_down(Some(Keycode::Space))));
        assert!(!is_quit_event(&key_down(None)));
    }

    #[test]
    fn zero_extent_is_not_renderable() {
        assert!(!extent_is_renderable(vk::Extent2D {
            width: 0,
            height: 720
        }));
        assert!(!extent_is_renderable(vk::Extent2D {
            width: 1280,
            height: 0
        }));
        assert!(extent_is_renderable(vk::Extent2D {
            width: 1280,
            height: 720
        }));
    }

    #[test]
    fn ticks_are_monotonic() {
        let epoch = Instant::now();
        let a = epoch.elapsed().as_millis() as u64;
        let b = epoch.elapsed().as_millis() as u64;
        assert!(b >= a);
    }
}
