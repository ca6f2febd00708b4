//! Image directories: per-subject face folders in, numbered frames out.
//!
//! A dataset is a directory with one subdirectory per subject. The
//! subdirectory name is the subject's label and every file inside it is an
//! image of that subject's face.

use crate::frame::{Frame, Mode};
use image::{ImageError, ImageReader};
use std::ffi::OsStr;
use std::fs::{self, ReadDir};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension used by [`DirWriter`].
const OUTPUT_EXTENSION: &str = "png";

#[derive(Error, Debug)]
pub enum DirError {
    #[error("failed to open faces directory {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open dataset directory {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read directory entry in {path}: {source}")]
    Entry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read face file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("failed to create output directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write frame {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("cannot encode frame for {path}: {reason}")]
    InvalidFrame { path: PathBuf, reason: String },
    #[error("output directory {0} has no free file number left")]
    Exhausted(PathBuf),
}

/// Reads one subject's face images, one file per [`read`](Self::read).
///
/// The directory handle is opened on construction and released when the
/// reader is dropped.
pub struct DirReader {
    path: PathBuf,
    label: String,
    mode: Mode,
    entries: ReadDir,
    good: bool,
    sequence: u32,
    /// Largest width and height across all images, if requested.
    size: Option<(u32, u32)>,
}

impl DirReader {
    /// Open a subject directory.
    ///
    /// With `calc_size` the whole directory is decoded once up front to find
    /// the largest image dimensions. This is a full extra pass.
    pub fn open(path: impl AsRef<Path>, mode: Mode, calc_size: bool) -> Result<Self, DirError> {
        let path = path.as_ref().to_path_buf();
        let entries = fs::read_dir(&path).map_err(|source| DirError::Open {
            path: path.clone(),
            source,
        })?;

        let size = if calc_size {
            Some(largest_size(&path)?)
        } else {
            None
        };

        let label = last_component(&path);
        tracing::debug!(path = %path.display(), %label, ?size, "opened faces directory");

        Ok(Self {
            path,
            label,
            mode,
            entries,
            good: true,
            sequence: 0,
            size,
        })
    }

    /// Decode the next image.
    ///
    /// Returns `Ok(None)` once the directory is exhausted; [`is_good`](Self::is_good)
    /// is false from then on. An entry that is present but cannot be decoded
    /// is an error, not the end of the sequence.
    pub fn read(&mut self) -> Result<Option<Frame>, DirError> {
        let Some(file) = self.next_file()? else {
            self.good = false;
            return Ok(None);
        };

        let frame = decode(&file, self.mode)?.with_sequence(self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }

    /// False once a read found no further entry.
    pub fn is_good(&self) -> bool {
        self.good
    }

    /// Subject label: the directory's base name.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Largest image dimensions, available when opened with `calc_size`.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    fn next_file(&mut self) -> Result<Option<PathBuf>, DirError> {
        if !self.good {
            return Ok(None);
        }
        for entry in self.entries.by_ref() {
            let entry = entry.map_err(|source| DirError::Entry {
                path: self.path.clone(),
                source,
            })?;
            if is_hidden(&entry.file_name()) {
                continue;
            }
            return Ok(Some(entry.path()));
        }
        Ok(None)
    }
}

impl Iterator for DirReader {
    type Item = Result<Frame, DirError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

/// Open every subject directory directly under `dataset`, sorted by name.
///
/// Hidden entries, plain files and dangling links at the top level are
/// skipped. Symlinked subject directories are followed.
pub fn subjects(
    dataset: impl AsRef<Path>,
    mode: Mode,
    calc_size: bool,
) -> Result<Vec<DirReader>, DirError> {
    let dataset = dataset.as_ref();
    let dataset_err = |source| DirError::Dataset {
        path: dataset.to_path_buf(),
        source,
    };

    let mut dirs = Vec::new();
    for entry in fs::read_dir(dataset).map_err(dataset_err)? {
        let entry = entry.map_err(|source| DirError::Entry {
            path: dataset.to_path_buf(),
            source,
        })?;
        if is_hidden(&entry.file_name()) {
            continue;
        }
        // Follows symlinks, so linked subject directories count too.
        let path = entry.path();
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => dirs.push(path),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable dataset entry");
            }
        }
    }
    dirs.sort();

    tracing::info!(dataset = %dataset.display(), subjects = dirs.len(), "enumerated dataset");

    dirs.into_iter()
        .map(|dir| DirReader::open(dir, mode, calc_size))
        .collect()
}

/// Writes frames as sequentially numbered images into one directory.
///
/// Numbering continues after the highest number already present, so
/// repeated runs into the same directory never overwrite earlier output.
pub struct DirWriter {
    path: PathBuf,
    next_index: u64,
}

impl DirWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DirError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|source| DirError::Create {
            path: path.clone(),
            source,
        })?;
        let next_index = next_free_index(&path)?;
        tracing::debug!(path = %path.display(), next_index, "opened output directory");
        Ok(Self { path, next_index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number the next written file will get.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Write one frame, returning the path of the new file.
    pub fn write(&mut self, frame: &Frame) -> Result<PathBuf, DirError> {
        let file = self
            .path
            .join(format!("{:06}.{OUTPUT_EXTENSION}", self.next_index));
        let after = self
            .next_index
            .checked_add(1)
            .ok_or_else(|| DirError::Exhausted(self.path.clone()))?;
        if frame.is_empty() {
            return Err(DirError::InvalidFrame {
                path: file,
                reason: "frame is empty".to_string(),
            });
        }

        let image = frame.to_image().map_err(|e| DirError::InvalidFrame {
            path: file.clone(),
            reason: e.to_string(),
        })?;
        image.save(&file).map_err(|source| DirError::Encode {
            path: file.clone(),
            source,
        })?;

        self.next_index = after;
        Ok(file)
    }
}

fn decode(file: &Path, mode: Mode) -> Result<Frame, DirError> {
    let decode_err = |source| DirError::Decode {
        path: file.to_path_buf(),
        source,
    };
    let image = ImageReader::open(file)
        .map_err(ImageError::IoError)
        .map_err(decode_err)?
        .with_guessed_format()
        .map_err(ImageError::IoError)
        .map_err(decode_err)?
        .decode()
        .map_err(decode_err)?;
    Ok(Frame::from_image(image, mode))
}

fn largest_size(path: &Path) -> Result<(u32, u32), DirError> {
    let mut reader = DirReader::open(path, Mode::Grayscale, false)?;
    let mut largest = (0, 0);
    while let Some(frame) = reader.read()? {
        largest.0 = largest.0.max(frame.width);
        largest.1 = largest.1.max(frame.height);
    }
    Ok(largest)
}

fn next_free_index(dir: &Path) -> Result<u64, DirError> {
    let mut next = 0;
    let entries = fs::read_dir(dir).map_err(|source| DirError::Open {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| DirError::Entry {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let index = path
            .file_stem()
            .and_then(OsStr::to_str)
            .and_then(|stem| stem.parse::<u64>().ok());
        if let Some(index) = index {
            let after = index
                .checked_add(1)
                .ok_or_else(|| DirError::Exhausted(dir.to_path_buf()))?;
            next = next.max(after);
        }
    }
    Ok(next)
}

/// Dot-prefixed names, which also covers the `.` and `..` pseudo-entries.
fn is_hidden(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

/// Base name of a directory path, ignoring trailing separators.
fn last_component(path: &Path) -> String {
    if let Some(name) = path.file_name() {
        return name.to_string_lossy().into_owned();
    }
    // "." or ".." have no file name; resolve them to something readable.
    fs::canonicalize(path)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gray(dir: &Path, name: &str, width: u32, height: u32, value: u8) {
        let img = image::GrayImage::from_pixel(width, height, image::Luma([value]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_reads_every_image_once() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            write_gray(dir.path(), &format!("face{i}.png"), 4, 4, 10 * i as u8);
        }

        let mut reader = DirReader::open(dir.path(), Mode::Grayscale, false).unwrap();
        let mut count = 0;
        while let Some(frame) = reader.read().unwrap() {
            assert_eq!(frame.size(), (4, 4));
            assert_eq!(frame.mode, Mode::Grayscale);
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(!reader.is_good());

        // Exhausted stays exhausted.
        assert!(reader.read().unwrap().is_none());
        assert!(!reader.is_good());
    }

    #[test]
    fn test_hidden_entries_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(dir.path(), "a.png", 2, 2, 1);
        fs::write(dir.path().join(".DS_Store"), b"not an image").unwrap();

        let reader = DirReader::open(dir.path(), Mode::Grayscale, false).unwrap();
        let frames: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_undecodable_entry_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.png"), b"definitely not a png").unwrap();

        let mut reader = DirReader::open(dir.path(), Mode::Colour, false).unwrap();
        assert!(matches!(reader.read(), Err(DirError::Decode { .. })));
    }

    #[test]
    fn test_colour_mode_yields_three_channels() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(dir.path(), "x.png", 3, 2, 50);

        let mut reader = DirReader::open(dir.path(), Mode::Colour, false).unwrap();
        let frame = reader.read().unwrap().unwrap();
        assert_eq!(frame.data.len(), 3 * 2 * 3);
        assert!(frame.data.iter().all(|&p| p == 50));
    }

    #[test]
    fn test_calc_size_finds_largest() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(dir.path(), "wide.png", 10, 3, 0);
        write_gray(dir.path(), "tall.png", 4, 12, 0);

        let reader = DirReader::open(dir.path(), Mode::Grayscale, true).unwrap();
        assert_eq!(reader.size(), Some((10, 12)));
    }

    #[test]
    fn test_open_missing_dir() {
        let result = DirReader::open("/nonexistent/faces/alice", Mode::Grayscale, false);
        assert!(matches!(result, Err(DirError::Open { .. })));
    }

    #[test]
    fn test_label_is_base_name() {
        let root = tempfile::tempdir().unwrap();
        let subject = root.path().join("alice");
        fs::create_dir(&subject).unwrap();

        let with_slash = format!("{}/", subject.display());
        let reader = DirReader::open(&with_slash, Mode::Grayscale, false).unwrap();
        assert_eq!(reader.label(), "alice");
    }

    #[test]
    fn test_subjects_one_reader_per_subdir() {
        let root = tempfile::tempdir().unwrap();
        for name in ["bob", "alice", ".cache"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        fs::write(root.path().join("README"), b"dataset notes").unwrap();
        write_gray(&root.path().join("alice"), "1.png", 2, 2, 0);

        let readers = subjects(root.path(), Mode::Grayscale, false).unwrap();
        let labels: Vec<_> = readers.iter().map(|r| r.label().to_string()).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_subjects_follows_symlinked_subject() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("alice")).unwrap();
        write_gray(elsewhere.path(), "a.png", 2, 2, 0);
        std::os::unix::fs::symlink(elsewhere.path(), root.path().join("carol")).unwrap();
        std::os::unix::fs::symlink(root.path().join("gone"), root.path().join("dangling")).unwrap();

        let readers = subjects(root.path(), Mode::Grayscale, false).unwrap();
        let labels: Vec<_> = readers.iter().map(|r| r.label().to_string()).collect();
        assert_eq!(labels, vec!["alice", "carol"]);

        let carol = readers.into_iter().nth(1).unwrap();
        assert_eq!(carol.count(), 1);
    }

    #[test]
    fn test_subjects_missing_dataset() {
        let result = subjects("/nonexistent/dataset", Mode::Grayscale, false);
        assert!(matches!(result, Err(DirError::Dataset { .. })));
    }

    #[test]
    fn test_writer_numbers_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Frame::new(vec![1, 2, 3, 4], 2, 2, Mode::Grayscale).unwrap();

        let mut writer = DirWriter::create(dir.path().join("out")).unwrap();
        let first = writer.write(&frame).unwrap();
        let second = writer.write(&frame).unwrap();
        assert_eq!(first.file_name().unwrap(), "000000.png");
        assert_eq!(second.file_name().unwrap(), "000001.png");

        let back = image::open(&first).unwrap().into_luma8();
        assert_eq!(back.into_raw(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_writer_continues_after_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Frame::new(vec![0; 3], 1, 1, Mode::Colour).unwrap();

        let mut first_run = DirWriter::create(dir.path()).unwrap();
        first_run.write(&frame).unwrap();
        first_run.write(&frame).unwrap();
        drop(first_run);

        let mut second_run = DirWriter::create(dir.path()).unwrap();
        assert_eq!(second_run.next_index(), 2);
        let path = second_run.write(&frame).unwrap();
        assert_eq!(path.file_name().unwrap(), "000002.png");
    }

    #[test]
    fn test_writer_refuses_when_numbers_run_out() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(format!("{}.png", u64::MAX)), b"").unwrap();

        let result = DirWriter::create(dir.path());
        assert!(matches!(result, Err(DirError::Exhausted(_))));
    }

    #[test]
    fn test_writer_rejects_malformed_frame() {
        let dir = tempfile::tempdir().unwrap();
        let bad = Frame {
            data: vec![0; 2],
            width: 4,
            height: 4,
            mode: Mode::Grayscale,
            sequence: 0,
        };
        let mut writer = DirWriter::create(dir.path()).unwrap();
        assert!(matches!(writer.write(&bad), Err(DirError::InvalidFrame { .. })));
    }
}
