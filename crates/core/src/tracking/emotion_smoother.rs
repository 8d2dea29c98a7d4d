use std::collections::{HashMap, VecDeque};

use crate::shared::constants::{DEFAULT_SMOOTHING_WINDOW, MAX_SMOOTHING_WINDOW};

/// Sliding-window mean of emotion score vectors, one window per tracking id.
///
/// Each window holds at most `window` vectors, oldest evicted first. Scores
/// are stored as `f32` (classifier output) and averaged in `f64`, so a window
/// filled with one vector averages back to exactly that vector.
pub struct EmotionSmoother {
    window: usize,
    history: HashMap<u32, VecDeque<Vec<f32>>>,
}

impl EmotionSmoother {
    pub fn new(window: usize) -> Self {
        Self {
            window: clamp_window(window),
            history: HashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Changes the window size, trimming longer histories from the oldest end.
    pub fn set_window(&mut self, window: usize) {
        self.window = clamp_window(window);
        for scores in self.history.values_mut() {
            while scores.len() > self.window {
                scores.pop_front();
            }
        }
    }

    /// Appends `scores` for `tracking_id` and returns the window mean.
    pub fn update(&mut self, tracking_id: u32, scores: &[f32]) -> Vec<f64> {
        let entry = self.history.entry(tracking_id).or_default();
        entry.push_back(scores.to_vec());
        while entry.len() > self.window {
            entry.pop_front();
        }
        mean(entry)
    }

    /// Window mean without adding a sample; used for fading faces.
    pub fn current(&self, tracking_id: u32) -> Option<Vec<f64>> {
        self.history
            .get(&tracking_id)
            .filter(|h| !h.is_empty())
            .map(mean)
    }

    pub fn history_len(&self, tracking_id: u32) -> usize {
        self.history.get(&tracking_id).map_or(0, VecDeque::len)
    }

    pub fn release(&mut self, tracking_id: u32) {
        self.history.remove(&tracking_id);
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn tracked_ids(&self) -> usize {
        self.history.len()
    }
}

impl Default for EmotionSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_WINDOW)
    }
}

fn clamp_window(window: usize) -> usize {
    window.clamp(1, MAX_SMOOTHING_WINDOW)
}

fn mean(history: &VecDeque<Vec<f32>>) -> Vec<f64> {
    let width = history.iter().map(Vec::len).max().unwrap_or(0);
    let mut sums = vec![0.0f64; width];
    for scores in history {
        for (sum, &s) in sums.iter_mut().zip(scores) {
            *sum += s as f64;
        }
    }
    let n = history.len() as f64;
    sums.into_iter().map(|s| s / n).collect()
}
