//! On-screen preview window via `minifb`.

use crate::frame::Frame;
use minifb::{Key, Window, WindowOptions};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("failed to open window: {0}")]
    Open(String),
    #[error("failed to present frame: {0}")]
    Update(String),
    #[error("window closed")]
    Closed,
}

/// Shows frames in a window, opened lazily at the first frame's size.
pub struct VideoPlayer {
    title: String,
    window: Option<Window>,
    size: (u32, u32),
    buffer: Vec<u32>,
}

impl VideoPlayer {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            window: None,
            size: (0, 0),
            buffer: Vec::new(),
        }
    }

    /// False once the user closed the window or pressed Escape.
    pub fn is_open(&self) -> bool {
        self.window
            .as_ref()
            .map_or(true, |w| w.is_open() && !w.is_key_down(Key::Escape))
    }

    pub fn show(&mut self, frame: &Frame) -> Result<(), DisplayError> {
        if frame.is_empty() {
            return Ok(());
        }
        if !self.is_open() {
            return Err(DisplayError::Closed);
        }

        let (width, height) = frame.size();
        if self.window.is_none() || self.size != (width, height) {
            let window = Window::new(
                &self.title,
                width as usize,
                height as usize,
                WindowOptions::default(),
            )
            .map_err(|e| DisplayError::Open(e.to_string()))?;
            tracing::debug!(title = %self.title, width, height, "opened preview window");
            self.window = Some(window);
            self.size = (width, height);
        }

        self.buffer.clear();
        let colour = frame.to_colour();
        self.buffer.extend(
            colour
                .data
                .chunks_exact(3)
                .map(|p| (p[0] as u32) << 16 | (p[1] as u32) << 8 | p[2] as u32),
        );

        let Some(window) = self.window.as_mut() else {
            return Err(DisplayError::Closed);
        };
        window
            .update_with_buffer(&self.buffer, width as usize, height as usize)
            .map_err(|e| DisplayError::Update(e.to_string()))
    }
}
