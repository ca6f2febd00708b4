//! Uniform frame source over camera, video file and image directory.

use crate::dir::{DirError, DirReader};
use crate::frame::Frame;
use thiserror::Error;

#[cfg(feature = "camera")]
use crate::camera::{Camera, CameraError};
#[cfg(feature = "video")]
use crate::video::{VideoError, VideoReader};

#[derive(Error, Debug)]
pub enum SourceError {
    #[cfg(feature = "camera")]
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[cfg(feature = "video")]
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Dir(#[from] DirError),
}

/// Where frames come from.
///
/// A camera never runs out. Video files and directories report `Ok(None)`
/// once exhausted, after which [`is_good`](Self::is_good) stays false.
pub enum FrameSource {
    #[cfg(feature = "camera")]
    Camera(Camera),
    #[cfg(feature = "video")]
    Video(VideoReader),
    Dir(DirReader),
}

impl FrameSource {
    pub fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        match self {
            #[cfg(feature = "camera")]
            Self::Camera(camera) => Ok(Some(camera.read()?)),
            #[cfg(feature = "video")]
            Self::Video(reader) => Ok(reader.read()?),
            Self::Dir(reader) => Ok(reader.read()?),
        }
    }

    pub fn is_good(&self) -> bool {
        match self {
            #[cfg(feature = "camera")]
            Self::Camera(_) => true,
            #[cfg(feature = "video")]
            Self::Video(reader) => reader.is_good(),
            Self::Dir(reader) => reader.is_good(),
        }
    }

    /// Frame size, when the source knows it up front.
    pub fn size(&self) -> Option<(u32, u32)> {
        match self {
            #[cfg(feature = "camera")]
            Self::Camera(camera) => Some(camera.size()),
            #[cfg(feature = "video")]
            Self::Video(reader) => Some(reader.size()),
            Self::Dir(reader) => reader.size(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            #[cfg(feature = "camera")]
            Self::Camera(_) => "camera",
            #[cfg(feature = "video")]
            Self::Video(_) => "video",
            Self::Dir(_) => "directory",
        }
    }
}

#[cfg(feature = "camera")]
impl From<Camera> for FrameSource {
    fn from(camera: Camera) -> Self {
        Self::Camera(camera)
    }
}

#[cfg(feature = "video")]
impl From<VideoReader> for FrameSource {
    fn from(reader: VideoReader) -> Self {
        Self::Video(reader)
    }
}

impl From<DirReader> for FrameSource {
    fn from(reader: DirReader) -> Self {
        Self::Dir(reader)
    }
}
