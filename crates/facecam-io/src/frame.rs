//! Frame type and pixel processing: YUYV conversion, grayscale,
//! histogram equalization, border fitting.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Pixel layout a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Three 8-bit channels in RGB order.
    #[default]
    Colour,
    /// One 8-bit luma channel.
    Grayscale,
}

impl Mode {
    pub fn channels(self) -> usize {
        match self {
            Mode::Colour => 3,
            Mode::Grayscale => 1,
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "colour" | "color" => Ok(Mode::Colour),
            "grayscale" | "greyscale" | "gray" | "grey" => Ok(Mode::Grayscale),
            other => Err(format!("unknown mode: {other} (expected colour or grayscale)")),
        }
    }
}

/// A single image frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Row-major pixel data (width * height * channels bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mode: Mode,
    /// Position of this frame in the stream that produced it.
    pub sequence: u32,
}

impl Frame {
    /// Wrap raw pixels, checking that the length matches the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, mode: Mode) -> Result<Self, FrameError> {
        let frame = Self {
            data,
            width,
            height,
            mode,
            sequence: 0,
        };
        frame.check()?;
        Ok(frame)
    }

    /// A 0x0 frame with no pixel data.
    pub fn empty(mode: Mode) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            mode,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    pub fn channels(&self) -> usize {
        self.mode.channels()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels()
    }

    fn check(&self) -> Result<(), FrameError> {
        let expected = self.width as usize * self.height as usize * self.channels();
        if self.data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Grayscale copy (BT.601 luma weights). Grayscale frames are cloned.
    pub fn to_grayscale(&self) -> Frame {
        match self.mode {
            Mode::Grayscale => self.clone(),
            Mode::Colour => Frame {
                data: self
                    .data
                    .chunks_exact(3)
                    .map(|p| luma(p[0], p[1], p[2]))
                    .collect(),
                width: self.width,
                height: self.height,
                mode: Mode::Grayscale,
                sequence: self.sequence,
            },
        }
    }

    /// Three-channel copy. Colour frames are cloned, gray is replicated.
    pub fn to_colour(&self) -> Frame {
        match self.mode {
            Mode::Colour => self.clone(),
            Mode::Grayscale => Frame {
                data: self.data.iter().flat_map(|&y| [y, y, y]).collect(),
                width: self.width,
                height: self.height,
                mode: Mode::Colour,
                sequence: self.sequence,
            },
        }
    }

    pub fn into_mode(self, mode: Mode) -> Frame {
        if self.mode == mode {
            return self;
        }
        match mode {
            Mode::Grayscale => self.to_grayscale(),
            Mode::Colour => self.to_colour(),
        }
    }

    /// Equalize the histogram of every channel in place.
    pub fn equalize(&mut self) {
        match self.mode {
            Mode::Grayscale => equalize_hist(&mut self.data),
            Mode::Colour => {
                let mut plane = Vec::with_capacity(self.data.len() / 3);
                for channel in 0..3 {
                    plane.clear();
                    plane.extend(self.data.iter().skip(channel).step_by(3));
                    equalize_hist(&mut plane);
                    for (dst, &v) in self.data.iter_mut().skip(channel).step_by(3).zip(&plane) {
                        *dst = v;
                    }
                }
            }
        }
    }

    /// Convert a decoded image into a frame of the requested mode.
    pub fn from_image(image: DynamicImage, mode: Mode) -> Self {
        let (width, height, data) = match mode {
            Mode::Grayscale => {
                let img = image.into_luma8();
                let (w, h) = img.dimensions();
                (w, h, img.into_raw())
            }
            Mode::Colour => {
                let img = image.into_rgb8();
                let (w, h) = img.dimensions();
                (w, h, img.into_raw())
            }
        };
        Self {
            data,
            width,
            height,
            mode,
            sequence: 0,
        }
    }

    pub fn to_image(&self) -> Result<DynamicImage, FrameError> {
        self.check()?;
        let image = match self.mode {
            Mode::Grayscale => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .map(DynamicImage::ImageLuma8),
            Mode::Colour => RgbImage::from_raw(self.width, self.height, self.data.clone())
                .map(DynamicImage::ImageRgb8),
        };
        image.ok_or(FrameError::InvalidLength {
            expected: self.width as usize * self.height as usize * self.channels(),
            actual: self.data.len(),
        })
    }

    /// Resample to exactly `width` x `height`.
    pub fn resize(&self, width: u32, height: u32) -> Result<Frame, FrameError> {
        if self.size() == (width, height) {
            return Ok(self.clone());
        }
        let resized = match self.to_image()? {
            DynamicImage::ImageLuma8(img) => {
                DynamicImage::ImageLuma8(imageops::resize(&img, width, height, FilterType::Triangle))
            }
            other => DynamicImage::ImageRgb8(imageops::resize(
                &other.into_rgb8(),
                width,
                height,
                FilterType::Triangle,
            )),
        };
        Ok(Frame::from_image(resized, self.mode).with_sequence(self.sequence))
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601
/// limited-range coefficients. Each [Y0, U, Y1, V] group yields two pixels
/// sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for group in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (group[1], group[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(group[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(group[2], u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Global histogram equalization of an 8-bit plane, in place.
///
/// The darkest occupied bin maps to 0 and the cumulative distribution of the
/// remaining pixels is stretched over 0–255. A plane holding a single value
/// is left unchanged.
pub fn equalize_hist(gray: &mut [u8]) {
    if gray.is_empty() {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }

    let total = gray.len();
    let Some(first) = hist.iter().position(|&count| count > 0) else {
        return;
    };
    if hist[first] == total {
        return;
    }

    let scale = 255.0 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut sum = 0usize;
    for (value, slot) in lut.iter_mut().enumerate().skip(first + 1) {
        sum += hist[value];
        *slot = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Fit a frame into a fixed `width` x `height` canvas.
///
/// Frames larger than the canvas are downscaled preserving aspect ratio;
/// the result is centered on a black border. The output keeps the input's
/// mode and sequence number.
pub fn fit_with_border(frame: &Frame, width: u32, height: u32) -> Result<Frame, FrameError> {
    let channels = frame.channels();
    let mut canvas = vec![0u8; width as usize * height as usize * channels];
    if frame.is_empty() || width == 0 || height == 0 {
        return Ok(Frame {
            data: canvas,
            width,
            height,
            mode: frame.mode,
            sequence: frame.sequence,
        });
    }

    let scale = (width as f32 / frame.width as f32)
        .min(height as f32 / frame.height as f32)
        .min(1.0);
    let fitted = if scale < 1.0 {
        let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, width);
        let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, height);
        frame.resize(new_w, new_h)?
    } else {
        frame.check()?;
        frame.clone()
    };

    let pad_x = ((width - fitted.width) / 2) as usize;
    let pad_y = ((height - fitted.height) / 2) as usize;
    let dst_stride = width as usize * channels;
    let src_stride = fitted.stride();

    for (row, src) in fitted.data.chunks_exact(src_stride).enumerate() {
        let start = (pad_y + row) * dst_stride + pad_x * channels;
        canvas[start..start + src_stride].copy_from_slice(src);
    }

    Ok(Frame {
        data: canvas,
        width,
        height,
        mode: frame.mode,
        sequence: frame.sequence,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid pixel buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame::new(data, width, height, Mode::Grayscale).unwrap()
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_to_grayscale_4x2() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_gray() {
        // Neutral chroma: R == G == B for both pixels.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_frame_new_rejects_bad_length() {
        let result = Frame::new(vec![0; 5], 2, 1, Mode::Colour);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::empty(Mode::Grayscale);
        assert!(frame.is_empty());
        assert_eq!(frame.size(), (0, 0));
    }

    #[test]
    fn test_to_grayscale_weights() {
        let frame = Frame::new(vec![255, 0, 0, 0, 255, 0, 0, 0, 255], 3, 1, Mode::Colour).unwrap();
        let g = frame.to_grayscale();
        assert_eq!(g.mode, Mode::Grayscale);
        assert_eq!(g.data, vec![77, 149, 29]);
    }

    #[test]
    fn test_to_colour_replicates() {
        let g = gray(2, 1, vec![10, 200]);
        let c = g.to_colour();
        assert_eq!(c.data, vec![10, 10, 10, 200, 200, 200]);
        assert_eq!(c.into_mode(Mode::Grayscale).data, vec![10, 200]);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let mut plane = vec![100, 100, 101, 101, 102, 102, 103, 103];
        equalize_hist(&mut plane);
        assert_eq!(plane[0], 0);
        assert_eq!(plane[7], 255);
        // Monotonic mapping preserved.
        assert!(plane.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_equalize_uniform_unchanged() {
        let mut plane = vec![42u8; 64];
        equalize_hist(&mut plane);
        assert!(plane.iter().all(|&p| p == 42));
    }

    #[test]
    fn test_equalize_colour_per_channel() {
        let mut frame = Frame::new(vec![10, 50, 90, 20, 50, 95], 2, 1, Mode::Colour).unwrap();
        frame.equalize();
        // R and B stretched, G uniform and left alone.
        assert_eq!(frame.data, vec![0, 50, 0, 255, 50, 255]);
    }

    #[test]
    fn test_image_roundtrip_keeps_pixels() {
        let frame = gray(2, 2, vec![1, 2, 3, 4]);
        let back = Frame::from_image(frame.to_image().unwrap(), Mode::Grayscale);
        assert_eq!(back, frame);
    }

    #[test]
    fn test_fit_with_border_centers_small_frame() {
        let frame = gray(2, 2, vec![9; 4]);
        let fitted = fit_with_border(&frame, 4, 4).unwrap();
        assert_eq!(fitted.size(), (4, 4));
        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0,
            0, 9, 9, 0,
            0, 9, 9, 0,
            0, 0, 0, 0,
        ];
        assert_eq!(fitted.data, expected);
    }

    #[test]
    fn test_fit_with_border_downscales_large_frame() {
        let frame = gray(8, 4, vec![200; 32]);
        let fitted = fit_with_border(&frame, 4, 4).unwrap();
        assert_eq!(fitted.size(), (4, 4));
        // Scaled to 4x2, padded one row top and bottom.
        assert!(fitted.data[..4].iter().all(|&p| p == 0));
        assert!(fitted.data[4..12].iter().all(|&p| p == 200));
        assert!(fitted.data[12..].iter().all(|&p| p == 0));
    }

    #[test]
    fn test_fit_with_border_empty_frame_is_black() {
        let fitted = fit_with_border(&Frame::empty(Mode::Colour), 3, 2).unwrap();
        assert_eq!(fitted.data, vec![0; 18]);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("grey".parse::<Mode>().unwrap(), Mode::Grayscale);
        assert_eq!("Color".parse::<Mode>().unwrap(), Mode::Colour);
        assert!("sepia".parse::<Mode>().is_err());
    }
}
