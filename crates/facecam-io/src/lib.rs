//! facecam-io: frame sources and sinks.
//!
//! Sources read frames from a V4L2 camera, a video file or a directory of
//! face images. Sinks show frames in a window, encode them to a video file
//! or write them as numbered images. Camera, video and window backends are
//! behind the `camera`, `video` and `display` features.

#[cfg(feature = "camera")]
pub mod camera;
pub mod dir;
#[cfg(feature = "display")]
pub mod display;
pub mod frame;
pub mod sink;
pub mod source;
#[cfg(feature = "video")]
pub mod video;

#[cfg(feature = "camera")]
pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use dir::{subjects, DirError, DirReader, DirWriter};
#[cfg(feature = "display")]
pub use display::{DisplayError, VideoPlayer};
pub use frame::{Frame, FrameError, Mode};
pub use sink::{FrameSink, SinkError};
pub use source::{FrameSource, SourceError};
#[cfg(feature = "video")]
pub use video::{Fit, VideoError, VideoReader, VideoWriter};
