//! facecam-core: face detection, recognition and debouncing.
//!
//! Detection runs the SeetaFace cascade (via `rustface`) over equalized
//! grayscale frames. Recognition embeds face crops with ArcFace (ONNX
//! Runtime) and matches them against a labeled gallery by cosine
//! similarity.

pub mod debounce;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use debounce::Debounce;
pub use detector::{crop, draw_rects, CascadeClassifier, CascadeParams, DetectorError, FaceDetector, SeetaCascade};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder, LoadOutcome, Recognizer, RecognizerError};
pub use types::{Detection, Embedding, Label, Prediction, Rect};
