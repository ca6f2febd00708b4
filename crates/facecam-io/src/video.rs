//! Video files via ffmpeg-next (libavformat + libavcodec).

use crate::frame::{self, Frame, FrameError, Mode};
use ffmpeg_next as ffmpeg;
use ffmpeg::format::{self, Pixel};
use ffmpeg::software::scaling::{Context as Scaler, Flags};
use ffmpeg::util::frame::video::Video;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_FPS: i32 = 30;

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("failed to open video file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: ffmpeg::Error,
    },
    #[error("no video stream in {0}")]
    NoVideoStream(PathBuf),
    #[error("failed to create video file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: ffmpeg::Error,
    },
    #[error("failed to decode video: {0}")]
    Decode(#[source] ffmpeg::Error),
    #[error("MPEG4 encoder not available")]
    EncoderNotFound,
    #[error("invalid output size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
    #[error("ffmpeg: {0}")]
    Ffmpeg(#[from] ffmpeg::Error),
}

/// Decodes a video file frame by frame into RGB frames.
pub struct VideoReader {
    input: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Scaler,
    stream_index: usize,
    width: u32,
    height: u32,
    good: bool,
    flushing: bool,
    sequence: u32,
}

impl VideoReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref();
        ffmpeg::init()?;

        let input = format::input(path).map_err(|source| VideoError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let (stream_index, decoder) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| VideoError::NoVideoStream(path.to_path_buf()))?;
            let codec_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
            (stream.index(), codec_ctx.decoder().video()?)
        };

        let width = decoder.width();
        let height = decoder.height();
        let scaler = Scaler::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            Flags::BILINEAR,
        )?;

        tracing::info!(path = %path.display(), width, height, "opened video file");

        Ok(Self {
            input,
            decoder,
            scaler,
            stream_index,
            width,
            height,
            good: true,
            flushing: false,
            sequence: 0,
        })
    }

    /// False once the stream is exhausted or a frame failed to decode.
    pub fn is_good(&self) -> bool {
        self.good
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Decode the next frame. `Ok(None)` marks the end of the stream. A
    /// decode failure is returned once; after either the reader stays
    /// not-good.
    pub fn read(&mut self) -> Result<Option<Frame>, VideoError> {
        if !self.good {
            return Ok(None);
        }

        match self.next_frame() {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                tracing::debug!(frames = self.sequence, "video stream exhausted");
                self.good = false;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, frames = self.sequence, "video decode failed");
                self.good = false;
                Err(e)
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, VideoError> {
        loop {
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
            if self.flushing {
                return Ok(None);
            }

            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    progressed(self.decoder.send_packet(&packet))?;
                }
                None => {
                    // Drain frames the decoder is still holding.
                    progressed(self.decoder.send_eof())?;
                    self.flushing = true;
                }
            }
        }
    }

    fn receive(&mut self) -> Result<Option<Frame>, VideoError> {
        let mut decoded = Video::empty();
        if !progressed(self.decoder.receive_frame(&mut decoded))? {
            return Ok(None);
        }

        let mut rgb_frame = Video::empty();
        self.scaler.run(&decoded, &mut rgb_frame)?;

        let frame = Frame {
            data: extract_rgb_pixels(&rgb_frame, self.width, self.height),
            width: self.width,
            height: self.height,
            mode: Mode::Colour,
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(Some(frame))
    }
}

/// Decoder call outcome: `Ok(true)` when it went through, `Ok(false)` when
/// the decoder wants more input or is drained. Anything else is a decode
/// failure.
fn progressed(result: Result<(), ffmpeg::Error>) -> Result<bool, VideoError> {
    match result {
        Ok(()) => Ok(true),
        Err(ffmpeg::Error::Eof) => Ok(false),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => Ok(false),
        Err(e) => Err(VideoError::Decode(e)),
    }
}

fn extract_rgb_pixels(rgb_frame: &Video, width: u32, height: u32) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let row_bytes = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + row_bytes]);
    }
    pixels
}

/// How frames that do not match the output size are fitted to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fit {
    /// Downscale if too large, then center on a black border.
    #[default]
    Border,
}

/// Encodes frames of any size into a fixed-size MPEG-4 video.
pub struct VideoWriter {
    output: format::context::Output,
    encoder: ffmpeg::codec::encoder::video::Encoder,
    scaler: Scaler,
    width: u32,
    height: u32,
    fit: Fit,
    fps: i32,
    frame_count: i64,
    finished: bool,
}

impl VideoWriter {
    /// Create `path` for `size` frames at `fps`. Odd dimensions are rounded
    /// down to even, as YUV 4:2:0 requires.
    pub fn create(
        path: impl AsRef<Path>,
        size: (u32, u32),
        fps: u32,
        fit: Fit,
    ) -> Result<Self, VideoError> {
        let path = path.as_ref();
        let width = size.0 & !1;
        let height = size.1 & !1;
        if width == 0 || height == 0 {
            return Err(VideoError::InvalidSize {
                width: size.0,
                height: size.1,
            });
        }
        let fps = match i32::try_from(fps) {
            Ok(f) if f > 0 => f,
            _ => DEFAULT_FPS,
        };

        ffmpeg::init()?;

        let mut output = format::output(path).map_err(|source| VideoError::Create {
            path: path.to_path_buf(),
            source,
        })?;

        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let codec =
            ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4).ok_or(VideoError::EncoderNotFound)?;

        let mut ost = output.add_stream(Some(codec))?;

        let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder_ctx.set_width(width);
        encoder_ctx.set_height(height);
        encoder_ctx.set_format(Pixel::YUV420P);
        encoder_ctx.set_time_base(ffmpeg::Rational(1, fps));
        encoder_ctx.set_frame_rate(Some(ffmpeg::Rational(fps, 1)));
        if global_header {
            encoder_ctx.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder_ctx.open_with(ffmpeg::Dictionary::new())?;
        ost.set_parameters(&encoder);

        output.write_header()?;

        let scaler = Scaler::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            Flags::BILINEAR,
        )?;

        tracing::info!(path = %path.display(), width, height, fps, ?fit, "created video file");

        Ok(Self {
            output,
            encoder,
            scaler,
            width,
            height,
            fit,
            fps,
            frame_count: 0,
            finished: false,
        })
    }

    /// Fit, convert and encode one frame.
    pub fn write(&mut self, frame: &Frame) -> Result<(), VideoError> {
        let fitted = match self.fit {
            Fit::Border => frame::fit_with_border(&frame.to_colour(), self.width, self.height)?,
        };

        let mut rgb_frame = Video::new(Pixel::RGB24, self.width, self.height);
        let stride = rgb_frame.stride(0);
        let row_bytes = fitted.stride();
        let dst = rgb_frame.data_mut(0);
        for (row, src) in fitted.data.chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            dst[start..start + row_bytes].copy_from_slice(src);
        }

        let mut yuv_frame = Video::empty();
        self.scaler.run(&rgb_frame, &mut yuv_frame)?;
        yuv_frame.set_pts(Some(self.frame_count));

        self.encoder.send_frame(&yuv_frame)?;
        self.drain_packets()?;

        self.frame_count += 1;
        Ok(())
    }

    /// Flush the encoder and write the container trailer. Idempotent.
    pub fn finish(&mut self) -> Result<(), VideoError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.encoder.send_eof()?;
        self.drain_packets()?;
        self.output.write_trailer()?;

        tracing::info!(frames = self.frame_count, "finished video file");
        Ok(())
    }

    fn drain_packets(&mut self) -> Result<(), VideoError> {
        let time_base = self
            .output
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(ffmpeg::Rational(1, self.fps));

        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(0);
            encoded.rescale_ts(ffmpeg::Rational(1, self.fps), time_base);
            encoded.write_interleaved(&mut self.output)?;
        }
        Ok(())
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(error = %e, "failed to finish video file");
        }
    }
}
