//! Uniform frame sink over preview window, video file and image directory.

use crate::dir::{DirError, DirWriter};
use crate::frame::Frame;
use thiserror::Error;

#[cfg(feature = "display")]
use crate::display::{DisplayError, VideoPlayer};
#[cfg(feature = "video")]
use crate::video::{VideoError, VideoWriter};

#[derive(Error, Debug)]
pub enum SinkError {
    #[cfg(feature = "display")]
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[cfg(feature = "video")]
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Dir(#[from] DirError),
}

impl SinkError {
    /// True when the user closed the preview window.
    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "display")]
            Self::Display(DisplayError::Closed) => true,
            _ => false,
        }
    }
}

/// Where frames go.
pub enum FrameSink {
    #[cfg(feature = "display")]
    Window(VideoPlayer),
    #[cfg(feature = "video")]
    Video(VideoWriter),
    Dir(DirWriter),
}

impl FrameSink {
    pub fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        match self {
            #[cfg(feature = "display")]
            Self::Window(player) => player.show(frame)?,
            #[cfg(feature = "video")]
            Self::Video(writer) => writer.write(frame)?,
            Self::Dir(writer) => {
                writer.write(frame)?;
            }
        }
        Ok(())
    }

    /// Flush buffered output. Only the video writer holds any.
    pub fn finish(&mut self) -> Result<(), SinkError> {
        match self {
            #[cfg(feature = "video")]
            Self::Video(writer) => writer.finish()?,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(feature = "display")]
impl From<VideoPlayer> for FrameSink {
    fn from(player: VideoPlayer) -> Self {
        Self::Window(player)
    }
}

#[cfg(feature = "video")]
impl From<VideoWriter> for FrameSink {
    fn from(writer: VideoWriter) -> Self {
        Self::Video(writer)
    }
}

impl From<DirWriter> for FrameSink {
    fn from(writer: DirWriter) -> Self {
        Self::Dir(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Mode;

    #[test]
    fn test_dir_sink_numbers_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FrameSink::from(DirWriter::create(dir.path().join("out")).unwrap());

        let frame = Frame::new(vec![10; 6], 3, 2, Mode::Grayscale).unwrap();
        sink.write(&frame).unwrap();
        sink.write(&frame).unwrap();
        sink.finish().unwrap();

        assert!(dir.path().join("out/000000.png").is_file());
        assert!(dir.path().join("out/000001.png").is_file());
    }

    #[test]
    fn test_dir_sink_rejects_empty_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FrameSink::from(DirWriter::create(dir.path()).unwrap());
        let result = sink.write(&Frame::empty(Mode::Colour));
        assert!(matches!(result, Err(SinkError::Dir(DirError::InvalidFrame { .. }))));
    }
}
