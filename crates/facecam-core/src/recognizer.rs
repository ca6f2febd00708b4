//! Face recognition: embeddings plus a nearest-neighbour gallery.
//!
//! A [`FaceEmbedder`] maps a face crop to an [`Embedding`]; the
//! [`Recognizer`] keeps labeled embeddings, predicts the label of the most
//! similar one and persists its state as JSON.

use crate::types::{CosineMatcher, Embedding, Label, Matcher, Prediction, Sample};
use facecam_io::frame::Frame;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Version written to and required of model files.
pub const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("cannot embed an empty face")]
    EmptyFace,
    #[error("recognizer has no trained samples")]
    Untrained,
    #[error("failed to access model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed model file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("model file {path} has format version {found}, expected {MODEL_FORMAT_VERSION}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("model file {path} was trained with {found}, but {expected} is in use")]
    EmbedderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// Maps a face crop to an embedding vector.
pub trait FaceEmbedder {
    /// Identifier stored in model files; embeddings from different
    /// embedders are not comparable.
    fn name(&self) -> &str;

    fn embed(&mut self, face: &Frame) -> Result<Embedding, RecognizerError>;
}

/// ArcFace embedder via ONNX Runtime.
pub struct ArcFaceEmbedder {
    session: Session,
    name: String,
}

impl ArcFaceEmbedder {
    /// Load an ArcFace ONNX model (e.g. `w600k_r50.onnx`).
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, RecognizerError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            name: format!("arcface/{version}"),
        })
    }

    /// Resize a face to 112x112 gray and lay it out as a NCHW float tensor.
    fn preprocess(face: &Frame) -> Result<Array4<f32>, RecognizerError> {
        let size = ARCFACE_INPUT_SIZE;
        let gray = face
            .to_grayscale()
            .resize(size as u32, size as u32)
            .map_err(|e| RecognizerError::InferenceFailed(format!("resize: {e}")))?;

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let pixel = gray.data.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }
        Ok(tensor)
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn embed(&mut self, face: &Frame) -> Result<Embedding, RecognizerError> {
        if face.is_empty() {
            return Err(RecognizerError::EmptyFace);
        }

        let input = Self::preprocess(face)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let embedding = Embedding::new(raw_data.to_vec());
        if embedding.dim() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                embedding.dim()
            )));
        }

        Ok(embedding.normalized())
    }
}

/// What [`Recognizer::open`] found at the model path.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded { samples: usize },
    /// No file yet; the recognizer starts empty.
    Missing,
    /// A file exists but could not be used; the recognizer starts empty.
    Unreadable(RecognizerError),
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    format_version: u32,
    embedder: String,
    samples: Vec<Sample>,
    #[serde(default)]
    labels: BTreeMap<Label, String>,
}

/// Labeled face gallery bound to one model file.
pub struct Recognizer<E> {
    path: PathBuf,
    embedder: E,
    samples: Vec<Sample>,
    labels: BTreeMap<Label, String>,
    threshold: Option<f32>,
}

impl<E: FaceEmbedder> Recognizer<E> {
    /// Bind to `path` and load it if possible. Never fails: a missing or
    /// unusable file leaves the recognizer empty and is reported in the
    /// returned [`LoadOutcome`].
    pub fn open(path: impl Into<PathBuf>, embedder: E) -> (Self, LoadOutcome) {
        let mut recognizer = Self {
            path: path.into(),
            embedder,
            samples: Vec::new(),
            labels: BTreeMap::new(),
            threshold: None,
        };

        let outcome = match recognizer.load() {
            Ok(samples) => LoadOutcome::Loaded { samples },
            Err(RecognizerError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                LoadOutcome::Missing
            }
            Err(e) => LoadOutcome::Unreadable(e),
        };

        match &outcome {
            LoadOutcome::Loaded { samples } => {
                tracing::info!(path = %recognizer.path.display(), samples, "loaded recognizer model")
            }
            LoadOutcome::Missing => {
                tracing::info!(path = %recognizer.path.display(), "no recognizer model yet")
            }
            LoadOutcome::Unreadable(e) => {
                tracing::warn!(path = %recognizer.path.display(), error = %e, "ignoring unreadable recognizer model")
            }
        }

        (recognizer, outcome)
    }

    /// Minimum similarity for a prediction to carry a label.
    pub fn with_threshold(mut self, threshold: Option<f32>) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Replace the current state with the model file's contents.
    ///
    /// On error the current state is left as it was.
    pub fn load(&mut self) -> Result<usize, RecognizerError> {
        let bytes = fs::read(&self.path).map_err(|source| RecognizerError::Io {
            path: self.path.clone(),
            source,
        })?;
        let model: ModelFile =
            serde_json::from_slice(&bytes).map_err(|source| RecognizerError::Format {
                path: self.path.clone(),
                source,
            })?;

        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(RecognizerError::UnsupportedVersion {
                path: self.path.clone(),
                found: model.format_version,
            });
        }
        if model.embedder != self.embedder.name() {
            return Err(RecognizerError::EmbedderMismatch {
                path: self.path.clone(),
                expected: self.embedder.name().to_string(),
                found: model.embedder,
            });
        }

        self.samples = model.samples;
        self.labels = model.labels;
        Ok(self.samples.len())
    }

    /// Write the full state to the model path, replacing any existing file.
    pub fn save(&self) -> Result<(), RecognizerError> {
        let io_err = |source| RecognizerError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let model = ModelFile {
            format_version: MODEL_FORMAT_VERSION,
            embedder: self.embedder.name().to_string(),
            samples: self.samples.clone(),
            labels: self.labels.clone(),
        };
        let json = serde_json::to_vec_pretty(&model).map_err(|source| RecognizerError::Format {
            path: self.path.clone(),
            source,
        })?;
        // Write beside the target, then rename over it.
        let tmp_path = temp_path(&self.path);
        let written = fs::File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(source));
        }

        tracing::debug!(path = %self.path.display(), samples = self.samples.len(), "saved recognizer model");
        Ok(())
    }

    /// Add one labeled example.
    pub fn update(&mut self, label: Label, face: &Frame) -> Result<(), RecognizerError> {
        if face.is_empty() {
            return Err(RecognizerError::EmptyFace);
        }
        let embedding = self.embedder.embed(face)?;
        self.samples.push(Sample { label, embedding });
        Ok(())
    }

    /// Label of the most similar trained example.
    pub fn predict(&mut self, face: &Frame) -> Result<Prediction, RecognizerError> {
        if self.samples.is_empty() {
            return Err(RecognizerError::Untrained);
        }
        if face.is_empty() {
            return Err(RecognizerError::EmptyFace);
        }
        let probe = self.embedder.embed(face)?;
        Ok(CosineMatcher.compare(&probe, &self.samples, self.threshold))
    }

    /// Attach a human-readable name to a label.
    pub fn set_label_info(&mut self, label: Label, name: impl Into<String>) {
        self.labels.insert(label, name.into());
    }

    pub fn label_info(&self, label: Label) -> Option<&str> {
        self.labels.get(&label).map(String::as_str)
    }

    /// Label whose info is `name`, if any.
    pub fn find_label(&self, name: &str) -> Option<Label> {
        self.labels
            .iter()
            .find(|(_, info)| info.as_str() == name)
            .map(|(label, _)| *label)
    }

    /// Every label that has samples or label info.
    pub fn labels(&self) -> BTreeSet<Label> {
        self.samples
            .iter()
            .map(|s| s.label)
            .chain(self.labels.keys().copied())
            .collect()
    }
}

/// `<path>.tmp` in the same directory, so the final rename stays on one
/// filesystem.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecam_io::frame::Mode;

    /// Embeds a face as (mean, 255 - mean).
    struct MeanEmbedder;

    impl FaceEmbedder for MeanEmbedder {
        fn name(&self) -> &str {
            "test/mean"
        }

        fn embed(&mut self, face: &Frame) -> Result<Embedding, RecognizerError> {
            let gray = face.to_grayscale();
            let mean = gray.data.iter().map(|&p| p as f32).sum::<f32>() / gray.data.len() as f32;
            Ok(Embedding::new(vec![mean, 255.0 - mean]))
        }
    }

    struct OtherEmbedder;

    impl FaceEmbedder for OtherEmbedder {
        fn name(&self) -> &str {
            "test/other"
        }

        fn embed(&mut self, _face: &Frame) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(vec![1.0]))
        }
    }

    fn face(value: u8) -> Frame {
        Frame::new(vec![value; 16], 4, 4, Mode::Grayscale).unwrap()
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, outcome) = Recognizer::open(dir.path().join("model.json"), MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Missing));
        assert!(recognizer.is_empty());
    }

    #[test]
    fn test_open_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, b"{ not json").unwrap();

        let (recognizer, outcome) = Recognizer::open(&path, MeanEmbedder);
        assert!(matches!(
            outcome,
            LoadOutcome::Unreadable(RecognizerError::Format { .. })
        ));
        assert!(recognizer.is_empty());
    }

    #[test]
    fn test_update_save_reopen_predict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model.json");

        let (mut recognizer, _) = Recognizer::open(&path, MeanEmbedder);
        recognizer.update(5, &face(30)).unwrap();
        recognizer.update(9, &face(220)).unwrap();
        recognizer.set_label_info(5, "alice");
        assert_eq!(recognizer.len(), 2);
        recognizer.save().unwrap();

        let (mut reopened, outcome) = Recognizer::open(&path, MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Loaded { samples: 2 }));
        assert_eq!(reopened.label_info(5), Some("alice"));
        assert_eq!(reopened.label_info(9), None);
        assert_eq!(reopened.find_label("alice"), Some(5));
        assert_eq!(reopened.labels().into_iter().collect::<Vec<_>>(), vec![5, 9]);

        let prediction = reopened.predict(&face(30)).unwrap();
        assert_eq!(prediction.label, Some(5));
        assert!((prediction.similarity - 1.0).abs() < 1e-6);
        assert_eq!(reopened.predict(&face(210)).unwrap().label, Some(9));
    }

    #[test]
    fn test_update_adds_one_sample() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recognizer, _) = Recognizer::open(dir.path().join("m.json"), MeanEmbedder);
        recognizer.update(1, &face(50)).unwrap();
        assert_eq!(recognizer.len(), 1);
        recognizer.update(1, &face(50)).unwrap();
        assert_eq!(recognizer.len(), 2);
    }

    #[test]
    fn test_predict_untrained() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recognizer, _) = Recognizer::open(dir.path().join("m.json"), MeanEmbedder);
        assert!(matches!(
            recognizer.predict(&face(10)),
            Err(RecognizerError::Untrained)
        ));
    }

    #[test]
    fn test_threshold_yields_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = Recognizer::open(dir.path().join("m.json"), MeanEmbedder);
        let mut recognizer = recognizer.with_threshold(Some(0.99));
        recognizer.update(3, &face(0)).unwrap();

        let prediction = recognizer.predict(&face(255)).unwrap();
        assert_eq!(prediction.label, None);
    }

    #[test]
    fn test_embedder_mismatch_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let (mut recognizer, _) = Recognizer::open(&path, MeanEmbedder);
        recognizer.update(1, &face(10)).unwrap();
        recognizer.save().unwrap();

        let (other, outcome) = Recognizer::open(&path, OtherEmbedder);
        assert!(matches!(
            outcome,
            LoadOutcome::Unreadable(RecognizerError::EmbedderMismatch { .. })
        ));
        assert!(other.is_empty());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let (mut recognizer, _) = Recognizer::open(&path, MeanEmbedder);
        recognizer.update(1, &face(10)).unwrap();
        recognizer.update(2, &face(90)).unwrap();
        recognizer.save().unwrap();

        let (mut fresh, _) = Recognizer::open(dir.path().join("other.json"), MeanEmbedder);
        fresh.path = path.clone();
        fresh.update(7, &face(40)).unwrap();
        fresh.save().unwrap();

        let (reopened, outcome) = Recognizer::open(&path, MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Loaded { samples: 1 }));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        // Leftover from a save that was cut short.
        fs::write(dir.path().join("m.json.tmp"), b"{ \"format_ver").unwrap();

        let (mut recognizer, outcome) = Recognizer::open(&path, MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Missing));
        recognizer.update(4, &face(60)).unwrap();
        recognizer.save().unwrap();
        recognizer.update(4, &face(70)).unwrap();
        recognizer.save().unwrap();

        assert!(!dir.path().join("m.json.tmp").exists());
        let (reopened, outcome) = Recognizer::open(&path, MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Loaded { samples: 2 }));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_save_failure_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let (mut recognizer, _) = Recognizer::open(&path, MeanEmbedder);
        recognizer.update(1, &face(10)).unwrap();
        recognizer.save().unwrap();

        // A directory squatting on the temp name makes the next save fail.
        fs::create_dir(dir.path().join("m.json.tmp")).unwrap();
        recognizer.update(2, &face(90)).unwrap();
        assert!(matches!(recognizer.save(), Err(RecognizerError::Io { .. })));

        let (reopened, outcome) = Recognizer::open(&path, MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Loaded { samples: 1 }));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_arcface_missing_model() {
        let result = ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx");
        assert!(matches!(result, Err(RecognizerError::ModelNotFound(_))));
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let tensor = ArcFaceEmbedder::preprocess(&face(128)).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            assert!((tensor[[0, c, 50, 50]] - expected).abs() < 1e-6);
        }
    }
}
