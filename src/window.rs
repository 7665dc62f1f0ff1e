//! Window management using winit
//!
//! The window host owns the event loop and turns window events into
//! framebuffer-resize notifications for the renderer.

use std::sync::Arc;
use thiserror::Error;
use winit::{
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

/// Window host error type
#[derive(Error, Debug)]
pub enum WindowError {
    #[error("Failed to create window: {0}")]
    Creation(#[from] OsError),
    #[error("Event loop failed: {0}")]
    EventLoop(#[from] EventLoopError),
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    pending_resize: Option<(u32, u32)>,
    close_requested: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, WindowError> {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .build(event_loop)?,
        );
        let size = window.inner_size();

        Ok(Self {
            window,
            width: size.width,
            height: size.height,
            pending_resize: None,
            close_requested: false,
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Get current framebuffer dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Take the latest framebuffer size reported since the last call.
    ///
    /// Zero-sized reports (minimized windows) never produce a notification.
    pub fn take_resize(&mut self) -> Option<(u32, u32)> {
        self.pending_resize.take()
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Ask the event loop to exit after the current iteration
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => self.on_resize(size.width, size.height),
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        if width > 0 && height > 0 {
            self.pending_resize = Some((width, height));
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Run the application with a callback invoked once per loop iteration.
///
/// The loop exits when the window is closed or the callback calls
/// [`Window::request_close`].
pub fn run<F>(title: &str, width: u32, height: u32, mut callback: F) -> Result<(), WindowError>
where
    F: FnMut(&mut Window) + 'static,
{
    let event_loop = EventLoop::new()?;
    let mut window = Window::new(&event_loop, title, width, height)?;
    log::info!("Window '{title}' created ({}x{})", window.width, window.height);

    event_loop.run(move |event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => window.handle_event(&event),
            Event::AboutToWait => {
                callback(&mut window);
                window.request_redraw();
            }
            _ => {}
        }

        if window.should_close() {
            elwt.exit();
        }
    })?;
    Ok(())
}
