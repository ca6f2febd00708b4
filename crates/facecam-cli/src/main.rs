use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facecam_core::{
    ArcFaceEmbedder, Debounce, FaceDetector, FaceEmbedder, LoadOutcome, Recognizer, SeetaCascade,
};
use facecam_io::{DirWriter, FrameSink, FrameSource};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod pipeline;

use config::Config;
use pipeline::DetectOutputs;

#[derive(Parser)]
#[command(name = "facecam", about = "Face detection and recognition demo", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize faces from the camera with a trained model
    Recognize {
        /// Trained model file
        model: PathBuf,
    },
    /// Train a model from a directory of per-subject face folders
    Train {
        /// Dataset root; one subdirectory per subject
        dataset: PathBuf,
        /// Model file to create or extend
        model: PathBuf,
    },
    /// Detect faces in a video file or the camera
    Detect {
        /// Video file to read instead of the camera
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Write face crops here instead of printing one line per face
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Write frames with faces outlined to this video file
        #[arg(long)]
        video_out: Option<PathBuf>,
        /// Show frames with faces outlined in a window
        #[arg(long)]
        show: bool,
        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,
    },
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration");

    match cli.command {
        Commands::Recognize { model } => recognize(&config, &model),
        Commands::Train { dataset, model } => train(&config, &dataset, &model),
        Commands::Detect {
            input,
            output_dir,
            video_out,
            show,
            frames,
        } => detect(&config, input, output_dir, video_out, show, frames),
        Commands::Devices => devices(),
    }
}

fn recognize(config: &Config, model: &Path) -> Result<()> {
    let embedder = ArcFaceEmbedder::load(&config.embedder_model)
        .context("failed to load embedding model")?;
    let (recognizer, outcome) = Recognizer::open(model, embedder);
    match outcome {
        LoadOutcome::Loaded { samples } => tracing::info!(
            path = %model.display(),
            embedder = recognizer.embedder().name(),
            samples,
            "model ready"
        ),
        LoadOutcome::Missing => bail!("model file {} does not exist", model.display()),
        LoadOutcome::Unreadable(e) => {
            return Err(e).with_context(|| format!("failed to load model {}", model.display()))
        }
    }
    let mut recognizer = recognizer.with_threshold(config.match_threshold);

    let mut detector = load_detector(config)?;
    let mut source = open_camera(config)?;
    let mut debounce = Debounce::new(config.debounce_threshold);

    pipeline::run_recognize(
        &mut source,
        &mut detector,
        &mut recognizer,
        &mut debounce,
        &mut io::stdout().lock(),
    )?;
    Ok(())
}

fn train(config: &Config, dataset: &Path, model: &Path) -> Result<()> {
    let embedder = ArcFaceEmbedder::load(&config.embedder_model)
        .context("failed to load embedding model")?;
    let (mut recognizer, outcome) = Recognizer::open(model, embedder);
    match outcome {
        LoadOutcome::Loaded { samples } => tracing::info!(
            path = %model.display(),
            embedder = recognizer.embedder().name(),
            samples,
            "extending existing model"
        ),
        LoadOutcome::Missing => tracing::info!(path = %model.display(), "creating new model"),
        LoadOutcome::Unreadable(e) => {
            return Err(e).with_context(|| {
                format!("refusing to overwrite unreadable model {}", model.display())
            })
        }
    }

    let stats = pipeline::run_train(dataset, config.mode, &mut recognizer)?;
    println!(
        "Trained {} samples from {} subjects into {}",
        stats.samples,
        stats.subjects,
        model.display()
    );
    Ok(())
}

fn detect(
    config: &Config,
    input: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    video_out: Option<PathBuf>,
    show: bool,
    frames: Option<u64>,
) -> Result<()> {
    let mut detector = load_detector(config)?;
    let mut source = match input {
        Some(path) => open_video(&path)?,
        None => open_camera(config)?,
    };

    let mut crops = match output_dir {
        Some(dir) => Some(FrameSink::Dir(DirWriter::create(&dir).with_context(|| {
            format!("failed to create output directory {}", dir.display())
        })?)),
        None => None,
    };
    let mut video = match video_out {
        Some(path) => Some(open_video_writer(config, &path)?),
        None => None,
    };
    let mut window = if show { Some(open_window()?) } else { None };

    let mut annotated = Vec::new();
    annotated.extend(video.as_mut());
    annotated.extend(window.as_mut());

    let mut outputs = DetectOutputs {
        crops: crops.as_mut(),
        annotated,
        lines: io::stdout().lock(),
    };
    let stats = pipeline::run_detect(&mut source, &mut detector, &mut outputs, frames)?;
    tracing::info!(frames = stats.frames, faces = stats.faces, "done");
    Ok(())
}

fn load_detector(config: &Config) -> Result<FaceDetector<SeetaCascade>> {
    let detector =
        FaceDetector::from_cascades_dir(&config.cascades_dir, &config.cascade_name, config.cascade)
            .context("failed to load face cascade")?;
    let detector = detector.with_min_confidence(config.min_confidence);
    tracing::debug!(
        cascade = %config.cascade_name,
        min_confidence = ?detector.min_confidence(),
        "face detector ready"
    );
    Ok(detector)
}

#[cfg(feature = "camera")]
fn open_camera(config: &Config) -> Result<FrameSource> {
    let camera = facecam_io::Camera::open(&config.camera_device, config.mode)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    Ok(FrameSource::Camera(camera))
}

#[cfg(not(feature = "camera"))]
fn open_camera(_config: &Config) -> Result<FrameSource> {
    bail!("camera support not compiled in (enable the `camera` feature)")
}

#[cfg(feature = "video")]
fn open_video(path: &Path) -> Result<FrameSource> {
    let reader = facecam_io::VideoReader::open(path)
        .with_context(|| format!("failed to open video {}", path.display()))?;
    Ok(FrameSource::Video(reader))
}

#[cfg(not(feature = "video"))]
fn open_video(_path: &Path) -> Result<FrameSource> {
    bail!("video file support not compiled in (enable the `video` feature)")
}

#[cfg(feature = "video")]
fn open_video_writer(config: &Config, path: &Path) -> Result<FrameSink> {
    let writer = facecam_io::VideoWriter::create(
        path,
        (config.video_width, config.video_height),
        config.video_fps,
        facecam_io::Fit::Border,
    )
    .with_context(|| format!("failed to create video {}", path.display()))?;
    Ok(FrameSink::Video(writer))
}

#[cfg(not(feature = "video"))]
fn open_video_writer(_config: &Config, _path: &Path) -> Result<FrameSink> {
    bail!("video file support not compiled in (enable the `video` feature)")
}

#[cfg(feature = "display")]
fn open_window() -> Result<FrameSink> {
    Ok(FrameSink::Window(facecam_io::VideoPlayer::new("facecam")))
}

#[cfg(not(feature = "display"))]
fn open_window() -> Result<FrameSink> {
    bail!("window display not compiled in (enable the `display` feature)")
}

#[cfg(feature = "camera")]
fn devices() -> Result<()> {
    let devices = facecam_io::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}\t{}\t{}\t{}", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

#[cfg(not(feature = "camera"))]
fn devices() -> Result<()> {
    bail!("camera support not compiled in (enable the `camera` feature)")
}
