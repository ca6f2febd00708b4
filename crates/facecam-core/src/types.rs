use serde::{Deserialize, Serialize};

/// Integer identity of an enrolled subject.
pub type Label = i32;

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// One past the last column.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// One past the last row.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies entirely inside a `width` x `height` image.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.right() <= width as u64 && self.bottom() <= height as u64
    }

    /// Intersect a signed rectangle with a `width` x `height` image.
    /// `None` if nothing of it remains.
    pub fn clipped(x: i64, y: i64, w: i64, h: i64, width: u32, height: u32) -> Option<Rect> {
        let x0 = x.clamp(0, width as i64);
        let y0 = y.clamp(0, height as i64);
        let x1 = (x + w).clamp(0, width as i64);
        let y1 = (y + h).clamp(0, height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        ))
    }
}

/// One face found by the cascade, with the classifier's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub rect: Rect,
    pub score: f64,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Scale to unit length. A zero vector is left as is.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }
}

/// A labeled training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub label: Label,
    pub embedding: Embedding,
}

/// Outcome of matching one face against the trained samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Best matching label, `None` when the similarity falls below the
    /// configured threshold.
    pub label: Option<Label>,
    /// Cosine similarity of the best match [-1, 1].
    pub similarity: f32,
}

/// Strategy for comparing a probe embedding against the trained samples.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Sample], threshold: Option<f32>) -> Prediction;
}

/// Nearest-neighbour matcher over cosine similarity.
///
/// Ties go to the earliest sample.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Sample], threshold: Option<f32>) -> Prediction {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, sample) in gallery.iter().enumerate() {
            let sim = probe.similarity(&sample.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        let accepted = threshold.map_or(true, |t| best_sim >= t);
        match best_idx {
            Some(idx) if accepted => Prediction {
                label: Some(gallery[idx].label),
                similarity: best_sim,
            },
            _ => Prediction {
                label: None,
                similarity: if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim },
            },
        }
    }
}
