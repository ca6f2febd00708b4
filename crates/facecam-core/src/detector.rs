//! Cascade face detection.
//!
//! [`FaceDetector`] prepares a frame (grayscale, histogram equalization),
//! hands it to a [`CascadeClassifier`] and turns the candidates into
//! rectangles clipped to the frame. The bundled classifier is the SeetaFace
//! funnel-structured cascade from the `rustface` crate.

use crate::types::{Detection, Rect};
use facecam_io::frame::{Frame, Mode};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of cascade definition files.
pub const CASCADE_EXTENSION: &str = "bin";
/// Smallest face the SeetaFace cascade accepts.
const SEETA_MIN_FACE_SIZE: u32 = 20;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load cascade {path}: {reason}")]
    CascadeLoad { path: PathBuf, reason: String },
    #[error("cannot detect faces in an empty frame")]
    EmptyFrame,
    #[error("rect {rect:?} extends past {width}x{height} frame")]
    OutOfBounds { rect: Rect, width: u32, height: u32 },
}

/// A raw classifier hit, in the classifier's signed coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub score: f64,
}

/// The object detector behind [`FaceDetector`].
///
/// Input is an equalized 8-bit grayscale image; output is one candidate
/// per face, in any order.
pub trait CascadeClassifier {
    fn classify(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Candidate>;
}

/// Tuning for the SeetaFace cascade.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CascadeParams {
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: (u32, u32),
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            score_threshold: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: (4, 4),
        }
    }
}

/// SeetaFace frontal cascade via `rustface`.
pub struct SeetaCascade {
    detector: Box<dyn rustface::Detector>,
    min_face_size: u32,
}

impl SeetaCascade {
    /// Load a SeetaFace model file.
    pub fn load(path: impl AsRef<Path>, params: CascadeParams) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let load_err = |reason: String| DetectorError::CascadeLoad {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| load_err(e.to_string()))?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| load_err(e.to_string()))?;

        let min_face_size = params.min_face_size.max(SEETA_MIN_FACE_SIZE);
        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(min_face_size);
        detector.set_score_thresh(params.score_threshold);
        detector.set_pyramid_scale_factor(params.pyramid_scale_factor);
        detector.set_slide_window_step(params.slide_window_step.0, params.slide_window_step.1);

        tracing::info!(path = %path.display(), ?params, "loaded face cascade");

        Ok(Self {
            detector,
            min_face_size,
        })
    }
}

impl CascadeClassifier for SeetaCascade {
    fn classify(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Candidate> {
        // The cascade cannot scan an image smaller than its window.
        if width < self.min_face_size || height < self.min_face_size {
            return Vec::new();
        }

        self.detector
            .detect(&rustface::ImageData::new(gray, width, height))
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Candidate {
                    x: bbox.x() as i64,
                    y: bbox.y() as i64,
                    width: bbox.width() as i64,
                    height: bbox.height() as i64,
                    score: face.score(),
                }
            })
            .collect()
    }
}

/// Face detector over a cascade classifier.
pub struct FaceDetector<C = SeetaCascade> {
    classifier: C,
    min_confidence: Option<f64>,
}

impl FaceDetector<SeetaCascade> {
    /// Load `<cascades_dir>/<name>.bin`.
    pub fn from_cascades_dir(
        cascades_dir: impl AsRef<Path>,
        name: &str,
        params: CascadeParams,
    ) -> Result<Self, DetectorError> {
        let path = cascades_dir
            .as_ref()
            .join(format!("{name}.{CASCADE_EXTENSION}"));
        Ok(Self::new(SeetaCascade::load(path, params)?))
    }
}

impl<C: CascadeClassifier> FaceDetector<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            classifier,
            min_confidence: None,
        }
    }

    /// Drop detections scoring below `min_confidence`. `None` keeps all.
    pub fn with_min_confidence(mut self, min_confidence: Option<f64>) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn min_confidence(&self) -> Option<f64> {
        self.min_confidence
    }

    /// Detect faces with their scores.
    ///
    /// A grayscale frame is equalized in place; a colour frame is left
    /// untouched and an equalized gray copy is scanned instead.
    pub fn detect_scored(&mut self, frame: &mut Frame) -> Result<Vec<Detection>, DetectorError> {
        if frame.is_empty() {
            return Err(DetectorError::EmptyFrame);
        }

        let (width, height) = frame.size();
        let candidates = match frame.mode {
            Mode::Grayscale => {
                frame.equalize();
                self.classifier.classify(&frame.data, width, height)
            }
            Mode::Colour => {
                let mut gray = frame.to_grayscale();
                gray.equalize();
                self.classifier.classify(&gray.data, width, height)
            }
        };

        let detections: Vec<Detection> = candidates
            .into_iter()
            .filter(|c| self.min_confidence.map_or(true, |t| c.score >= t))
            .filter_map(|c| {
                Rect::clipped(c.x, c.y, c.width, c.height, width, height).map(|rect| Detection {
                    rect,
                    score: c.score,
                })
            })
            .collect();

        tracing::trace!(
            sequence = frame.sequence,
            faces = detections.len(),
            "detected faces"
        );
        Ok(detections)
    }

    /// Detect face rectangles.
    pub fn detect(&mut self, frame: &mut Frame) -> Result<Vec<Rect>, DetectorError> {
        Ok(self
            .detect_scored(frame)?
            .into_iter()
            .map(|d| d.rect)
            .collect())
    }

    /// Detect and crop in one step.
    pub fn faces(&mut self, frame: &mut Frame) -> Result<Vec<Frame>, DetectorError> {
        let rects = self.detect(frame)?;
        crop(frame, &rects)
    }
}

/// Cut one sub-frame per rectangle, in order.
pub fn crop(frame: &Frame, rects: &[Rect]) -> Result<Vec<Frame>, DetectorError> {
    let (width, height) = frame.size();
    let channels = frame.channels();
    let stride = frame.stride();

    rects
        .iter()
        .map(|rect| {
            if !rect.fits(width, height) {
                return Err(DetectorError::OutOfBounds {
                    rect: *rect,
                    width,
                    height,
                });
            }
            let row_bytes = rect.width as usize * channels;
            let mut data = Vec::with_capacity(row_bytes * rect.height as usize);
            for row in rect.y as usize..rect.bottom() as usize {
                let start = row * stride + rect.x as usize * channels;
                data.extend_from_slice(&frame.data[start..start + row_bytes]);
            }
            Ok(Frame {
                data,
                width: rect.width,
                height: rect.height,
                mode: frame.mode,
                sequence: frame.sequence,
            })
        })
        .collect()
}

/// Outline each rectangle with a 2-pixel border. Parts outside the frame
/// are skipped.
pub fn draw_rects(frame: &mut Frame, rects: &[Rect], colour: [u8; 3]) {
    const THICKNESS: u32 = 2;
    let (width, height) = frame.size();
    let channels = frame.channels();
    let stride = frame.stride();
    let pixel: Vec<u8> = match frame.mode {
        Mode::Colour => colour.to_vec(),
        Mode::Grayscale => frame_luma(colour),
    };

    for rect in rects.iter().filter(|r| !r.is_empty()) {
        let x1 = rect.right().min(width as u64) as u32;
        let y1 = rect.bottom().min(height as u64) as u32;
        for y in rect.y..y1 {
            for x in rect.x..x1 {
                let on_edge = x < rect.x + THICKNESS
                    || y < rect.y + THICKNESS
                    || (x as u64) + THICKNESS as u64 >= rect.right()
                    || (y as u64) + THICKNESS as u64 >= rect.bottom();
                if on_edge {
                    let start = y as usize * stride + x as usize * channels;
                    frame.data[start..start + channels].copy_from_slice(&pixel);
                }
            }
        }
    }
}

fn frame_luma(colour: [u8; 3]) -> Vec<u8> {
    let rgb = Frame {
        data: colour.to_vec(),
        width: 1,
        height: 1,
        mode: Mode::Colour,
        sequence: 0,
    };
    rgb.to_grayscale().data
}
