/// Default number of consecutive face-bearing frames before acting.
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Confirms a face only after it has been seen in several consecutive
/// frames. A frame without faces resets the count.
#[derive(Debug, Clone)]
pub struct Debounce {
    threshold: u32,
    consecutive: u32,
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl Debounce {
    /// A threshold of 0 behaves like 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record the face count of one frame; true when the run of
    /// face-bearing frames has reached the threshold.
    pub fn observe(&mut self, faces: usize) -> bool {
        if faces == 0 {
            self.consecutive = 0;
        } else {
            self.consecutive = self.consecutive.saturating_add(1);
        }
        self.is_confirmed()
    }

    pub fn is_confirmed(&self) -> bool {
        self.consecutive >= self.threshold
    }

    /// Length of the current run of face-bearing frames.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
