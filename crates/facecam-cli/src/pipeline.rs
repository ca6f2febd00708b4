//! Driver loops: pull frames, detect, debounce, recognize, emit.

use facecam_core::detector::{self, CascadeClassifier, DetectorError, FaceDetector};
use facecam_core::recognizer::{FaceEmbedder, Recognizer, RecognizerError};
use facecam_core::{Debounce, Label};
use facecam_io::dir::{self, DirError};
use facecam_io::{FrameSink, FrameSource, Mode, SinkError, SourceError};
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

/// Outline colour for detected faces.
const RECT_COLOUR: [u8; 3] = [0, 255, 0];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("dataset error: {0}")]
    Dataset(#[from] DirError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecognizeStats {
    pub frames: u64,
    pub predictions: u64,
}

/// Recognition demo loop.
///
/// For every frame: detect faces, feed the count through the debounce
/// filter and, once confirmed, predict the label of the first face and
/// print it. Runs until the source is exhausted (never, for a camera).
pub fn run_recognize<C, E, W>(
    source: &mut FrameSource,
    detector: &mut FaceDetector<C>,
    recognizer: &mut Recognizer<E>,
    debounce: &mut Debounce,
    out: &mut W,
) -> Result<RecognizeStats, PipelineError>
where
    C: CascadeClassifier,
    E: FaceEmbedder,
    W: Write,
{
    let mut stats = RecognizeStats::default();

    while let Some(mut frame) = source.read()? {
        stats.frames += 1;
        let faces = detector.faces(&mut frame)?;
        if !debounce.observe(faces.len()) {
            continue;
        }

        // Only the first face is labeled.
        let prediction = recognizer.predict(&faces[0])?;
        match prediction.label {
            Some(label) => writeln!(out, "Predicted class = {label}")?,
            None => writeln!(out, "Predicted class = unknown")?,
        }
        tracing::debug!(
            sequence = frame.sequence,
            faces = faces.len(),
            label = ?prediction.label,
            similarity = prediction.similarity,
            "prediction"
        );
        stats.predictions += 1;
    }

    tracing::info!(
        source = source.kind(),
        frames = stats.frames,
        predictions = stats.predictions,
        "source exhausted"
    );
    Ok(stats)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrainStats {
    pub subjects: usize,
    pub samples: usize,
}

/// Offline training: one labeled example per image in every subject
/// directory of `dataset`, then save.
///
/// A numeric directory name is used as the label. Any other name gets a
/// fresh label (reused if the model already knows the name) and is stored
/// as that label's info.
pub fn run_train<E: FaceEmbedder>(
    dataset: &Path,
    mode: Mode,
    recognizer: &mut Recognizer<E>,
) -> Result<TrainStats, PipelineError> {
    let readers = dir::subjects(dataset, mode, false)?;
    let names: Vec<String> = readers.iter().map(|r| r.label().to_string()).collect();
    let labels = assign_labels(&names, recognizer);

    let mut stats = TrainStats::default();
    for (reader, label) in readers.into_iter().zip(labels) {
        if reader.label().parse::<Label>().is_err() {
            recognizer.set_label_info(label, reader.label());
        }
        let name = reader.label().to_string();
        let path = reader.path().to_path_buf();
        let mut count = 0;
        for face in reader {
            recognizer.update(label, &face?)?;
            count += 1;
        }
        tracing::info!(subject = %name, path = %path.display(), label, samples = count, "trained subject");
        stats.subjects += 1;
        stats.samples += count;
    }

    recognizer.save()?;
    tracing::info!(
        path = %recognizer.path().display(),
        subjects = stats.subjects,
        samples = stats.samples,
        "saved model"
    );
    Ok(stats)
}

fn assign_labels<E: FaceEmbedder>(names: &[String], recognizer: &Recognizer<E>) -> Vec<Label> {
    let mut next = names
        .iter()
        .filter_map(|n| n.parse::<Label>().ok())
        .chain(recognizer.labels())
        .max()
        .map_or(0, |max| max.saturating_add(1));

    names
        .iter()
        .map(|name| {
            if let Ok(label) = name.parse::<Label>() {
                return label;
            }
            if let Some(label) = recognizer.find_label(name) {
                return label;
            }
            let label = next;
            next = next.saturating_add(1);
            label
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetectStats {
    pub frames: u64,
    pub faces: u64,
}

/// Where [`run_detect`] sends what it finds.
pub struct DetectOutputs<'a, W> {
    /// Receives every face crop. When absent, one line per face goes to `lines`.
    pub crops: Option<&'a mut FrameSink>,
    /// Receive each frame with faces outlined.
    pub annotated: Vec<&'a mut FrameSink>,
    pub lines: W,
}

/// Detection loop: find faces in every frame and hand them to the outputs.
///
/// Stops when the source is exhausted, after `max_frames`, or when a
/// preview window is closed.
pub fn run_detect<C, W>(
    source: &mut FrameSource,
    detector: &mut FaceDetector<C>,
    outputs: &mut DetectOutputs<'_, W>,
    max_frames: Option<u64>,
) -> Result<DetectStats, PipelineError>
where
    C: CascadeClassifier,
    W: Write,
{
    let mut stats = DetectStats::default();

    'frames: while max_frames.map_or(true, |max| stats.frames < max) {
        let Some(mut frame) = source.read()? else {
            break;
        };
        stats.frames += 1;

        let detections = detector.detect_scored(&mut frame)?;
        let rects: Vec<_> = detections.iter().map(|d| d.rect).collect();
        stats.faces += rects.len() as u64;

        match outputs.crops.as_deref_mut() {
            Some(sink) => {
                for face in detector::crop(&frame, &rects)? {
                    sink.write(&face)?;
                }
            }
            None => {
                for d in &detections {
                    writeln!(
                        outputs.lines,
                        "{}\t{}\t{}\t{}\t{}\t{:.2}",
                        frame.sequence, d.rect.x, d.rect.y, d.rect.width, d.rect.height, d.score
                    )?;
                }
            }
        }

        if !outputs.annotated.is_empty() {
            detector::draw_rects(&mut frame, &rects, RECT_COLOUR);
            for sink in outputs.annotated.iter_mut() {
                match sink.write(&frame) {
                    Ok(()) => {}
                    Err(e) if e.is_closed() => {
                        tracing::info!("preview window closed");
                        break 'frames;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    if let Some(sink) = outputs.crops.as_deref_mut() {
        sink.finish()?;
    }
    for sink in outputs.annotated.iter_mut() {
        sink.finish()?;
    }

    tracing::info!(
        source = source.kind(),
        frames = stats.frames,
        faces = stats.faces,
        "detection finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecam_core::detector::Candidate;
    use facecam_core::{Embedding, LoadOutcome};
    use facecam_io::{DirReader, DirWriter, Frame};
    use image::{GrayImage, Luma};
    use std::fs;

    /// Reports one face covering the center of any frame brighter than mid-gray.
    struct BrightCascade;

    impl CascadeClassifier for BrightCascade {
        fn classify(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Candidate> {
            if gray.first().copied().unwrap_or(0) < 128 {
                return Vec::new();
            }
            vec![Candidate {
                x: width as i64 / 4,
                y: height as i64 / 4,
                width: width as i64 / 2,
                height: height as i64 / 2,
                score: 4.0,
            }]
        }
    }

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

    fn write_images(dir: &Path, count: usize, value: u8) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            GrayImage::from_pixel(8, 8, Luma([value]))
                .save(dir.join(format!("img{i}.png")))
                .unwrap();
        }
    }

    fn dir_source(dir: &Path) -> FrameSource {
        FrameSource::Dir(DirReader::open(dir, Mode::Grayscale, false).unwrap())
    }

    #[test]
    fn test_recognize_prints_after_debounce() {
        let tmp = tempfile::tempdir().unwrap();
        let frames = tmp.path().join("frames");
        write_images(&frames, 4, 200);

        let (mut recognizer, _) = Recognizer::open(tmp.path().join("model.json"), MeanEmbedder);
        let face = Frame::new(vec![200; 16], 4, 4, Mode::Grayscale).unwrap();
        recognizer.update(5, &face).unwrap();
        recognizer.update(2, &Frame::new(vec![20; 16], 4, 4, Mode::Grayscale).unwrap()).unwrap();

        let mut out = Vec::new();
        let stats = run_recognize(
            &mut dir_source(&frames),
            &mut FaceDetector::new(BrightCascade),
            &mut recognizer,
            &mut Debounce::default(),
            &mut out,
        )
        .unwrap();

        assert_eq!(stats, RecognizeStats { frames: 4, predictions: 2 });
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Predicted class = 5\nPredicted class = 5\n"
        );
    }

    #[test]
    fn test_recognize_no_faces_no_output() {
        let tmp = tempfile::tempdir().unwrap();
        let frames = tmp.path().join("frames");
        write_images(&frames, 5, 30);

        let (mut recognizer, _) = Recognizer::open(tmp.path().join("model.json"), MeanEmbedder);
        let mut out = Vec::new();
        let stats = run_recognize(
            &mut dir_source(&frames),
            &mut FaceDetector::new(BrightCascade),
            &mut recognizer,
            &mut Debounce::default(),
            &mut out,
        )
        .unwrap();

        assert_eq!(stats.predictions, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_train_labels_and_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = tmp.path().join("dataset");
        write_images(&dataset.join("5"), 3, 200);
        write_images(&dataset.join("alice"), 2, 40);
        write_images(&dataset.join(".cache"), 1, 90);
        fs::write(dataset.join("README"), "not a subject").unwrap();
        let model = tmp.path().join("out/model.json");

        let (mut recognizer, _) = Recognizer::open(&model, MeanEmbedder);
        let stats = run_train(&dataset, Mode::Grayscale, &mut recognizer).unwrap();
        assert_eq!(stats, TrainStats { subjects: 2, samples: 5 });
        assert_eq!(recognizer.find_label("alice"), Some(6));

        let (mut reopened, outcome) = Recognizer::open(&model, MeanEmbedder);
        assert!(matches!(outcome, LoadOutcome::Loaded { samples: 5 }));
        assert_eq!(reopened.label_info(6), Some("alice"));

        let bright = Frame::new(vec![200; 16], 4, 4, Mode::Grayscale).unwrap();
        assert_eq!(reopened.predict(&bright).unwrap().label, Some(5));
    }

    #[test]
    fn test_train_reuses_known_names() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = tmp.path().join("dataset");
        write_images(&dataset.join("bob"), 1, 60);
        let model = tmp.path().join("model.json");

        let (mut recognizer, _) = Recognizer::open(&model, MeanEmbedder);
        recognizer.set_label_info(12, "bob");
        run_train(&dataset, Mode::Grayscale, &mut recognizer).unwrap();

        assert_eq!(recognizer.find_label("bob"), Some(12));
        assert_eq!(recognizer.labels().into_iter().collect::<Vec<_>>(), vec![12]);
    }

    #[test]
    fn test_train_missing_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut recognizer, _) = Recognizer::open(tmp.path().join("m.json"), MeanEmbedder);
        let result = run_train(&tmp.path().join("nope"), Mode::Grayscale, &mut recognizer);
        assert!(matches!(
            result,
            Err(PipelineError::Dataset(DirError::Dataset { .. }))
        ));
    }

    #[test]
    fn test_detect_writes_crops() {
        let tmp = tempfile::tempdir().unwrap();
        let frames = tmp.path().join("frames");
        write_images(&frames, 3, 200);
        let crops_dir = tmp.path().join("crops");

        let mut crops = FrameSink::Dir(DirWriter::create(&crops_dir).unwrap());
        let mut outputs = DetectOutputs {
            crops: Some(&mut crops),
            annotated: Vec::new(),
            lines: Vec::new(),
        };
        let stats = run_detect(
            &mut dir_source(&frames),
            &mut FaceDetector::new(BrightCascade),
            &mut outputs,
            None,
        )
        .unwrap();

        assert_eq!(stats, DetectStats { frames: 3, faces: 3 });
        assert!(outputs.lines.is_empty());
        let mut written = DirReader::open(&crops_dir, Mode::Grayscale, true).unwrap();
        assert_eq!(written.size(), Some((4, 4)));
        assert_eq!(written.by_ref().count(), 3);
    }

    #[test]
    fn test_detect_lines_and_annotated_output() {
        let tmp = tempfile::tempdir().unwrap();
        let frames = tmp.path().join("frames");
        write_images(&frames, 4, 200);
        let annotated_dir = tmp.path().join("annotated");

        let mut annotated = FrameSink::Dir(DirWriter::create(&annotated_dir).unwrap());
        let mut outputs = DetectOutputs {
            crops: None,
            annotated: vec![&mut annotated],
            lines: Vec::new(),
        };
        let stats = run_detect(
            &mut dir_source(&frames),
            &mut FaceDetector::new(BrightCascade),
            &mut outputs,
            Some(2),
        )
        .unwrap();

        assert_eq!(stats.frames, 2);
        let text = String::from_utf8(outputs.lines).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("\t2\t2\t4\t4\t4.00"));
        assert_eq!(fs::read_dir(&annotated_dir).unwrap().count(), 2);
    }
}
