use anyhow::{Context, Result};
use facecam_core::CascadeParams;
use facecam_io::Mode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Runtime configuration.
///
/// Layered: built-in defaults, then an optional TOML file, then
/// `FACECAM_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Pixel layout frames are read in.
    pub mode: Mode,
    /// Directory holding cascade definitions.
    pub cascades_dir: PathBuf,
    /// Cascade file stem inside `cascades_dir`.
    pub cascade_name: String,
    /// ArcFace ONNX model.
    pub embedder_model: PathBuf,
    /// Consecutive face-bearing frames required before predicting.
    pub debounce_threshold: u32,
    /// Drop detections scoring below this. Unset keeps all.
    pub min_confidence: Option<f64>,
    /// Minimum cosine similarity for a labeled prediction. Unset always labels.
    pub match_threshold: Option<f32>,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub cascade: CascadeParams,
}

/// Config file contents; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    camera_device: Option<String>,
    mode: Option<Mode>,
    cascades_dir: Option<PathBuf>,
    cascade_name: Option<String>,
    embedder_model: Option<PathBuf>,
    debounce_threshold: Option<u32>,
    min_confidence: Option<f64>,
    match_threshold: Option<f32>,
    video_width: Option<u32>,
    video_height: Option<u32>,
    video_fps: Option<u32>,
    cascade: Option<CascadeParams>,
}

impl Config {
    /// Defaults with data files under `data_dir`.
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            mode: Mode::Colour,
            cascades_dir: data_dir.join("cascades"),
            cascade_name: "seeta_fd_frontal_v1.0".to_string(),
            embedder_model: data_dir.join("models/w600k_r50.onnx"),
            debounce_threshold: facecam_core::debounce::DEFAULT_THRESHOLD,
            min_confidence: None,
            match_threshold: None,
            video_width: 640,
            video_height: 480,
            video_fps: 30,
            cascade: CascadeParams::default(),
        }
    }

    /// Load from the process environment and the config file it points to.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::defaults(&data_dir(&lookup));

        if let Some(path) = config_path(&lookup) {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            config
                .merge_toml(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config file");
        }

        config.apply_overrides(&lookup);
        Ok(config)
    }

    /// Overlay the keys present in a TOML document.
    pub fn merge_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;

        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.mode {
            self.mode = v;
        }
        if let Some(v) = file.cascades_dir {
            self.cascades_dir = v;
        }
        if let Some(v) = file.cascade_name {
            self.cascade_name = v;
        }
        if let Some(v) = file.embedder_model {
            self.embedder_model = v;
        }
        if let Some(v) = file.debounce_threshold {
            self.debounce_threshold = v;
        }
        if let Some(v) = file.video_width {
            self.video_width = v;
        }
        if let Some(v) = file.video_height {
            self.video_height = v;
        }
        if let Some(v) = file.video_fps {
            self.video_fps = v;
        }
        if let Some(v) = file.cascade {
            self.cascade = v;
        }
        self.min_confidence = file.min_confidence.or(self.min_confidence);
        self.match_threshold = file.match_threshold.or(self.match_threshold);
        Ok(())
    }

    /// Apply `FACECAM_*` overrides. Unparsable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACECAM_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = parsed(&lookup, "FACECAM_MODE") {
            self.mode = v;
        }
        if let Some(v) = lookup("FACECAM_CASCADES_DIR") {
            self.cascades_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECAM_CASCADE_NAME") {
            self.cascade_name = v;
        }
        if let Some(v) = lookup("FACECAM_EMBEDDER_MODEL") {
            self.embedder_model = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "FACECAM_DEBOUNCE_THRESHOLD") {
            self.debounce_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "FACECAM_MIN_CONFIDENCE") {
            self.min_confidence = Some(v);
        }
        if let Some(v) = parsed(&lookup, "FACECAM_MATCH_THRESHOLD") {
            self.match_threshold = Some(v);
        }
        if let Some(v) = parsed(&lookup, "FACECAM_VIDEO_WIDTH") {
            self.video_width = v;
        }
        if let Some(v) = parsed(&lookup, "FACECAM_VIDEO_HEIGHT") {
            self.video_height = v;
        }
        if let Some(v) = parsed(&lookup, "FACECAM_VIDEO_FPS") {
            self.video_fps = v;
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}

/// `$XDG_DATA_HOME/facecam`, falling back to `~/.local/share/facecam`.
fn data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(lookup).join(".local/share"))
        .join("facecam")
}

/// `$FACECAM_CONFIG` if set, else the XDG config file when it exists.
fn config_path(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(explicit) = lookup("FACECAM_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let path = lookup("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(lookup).join(".config"))
        .join("facecam/config.toml");
    path.is_file().then_some(path)
}

fn home(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(lookup("HOME").unwrap_or_else(|| "/tmp".to_string()))
}
