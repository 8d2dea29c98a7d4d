use crate::shared::frame::Frame;

use super::inference_error::InferenceError;

/// Domain interface for per-face emotion classification.
///
/// `classify` returns one probability per entry of `labels()`, in the
/// same order.
pub trait EmotionClassifier: Send + Sync {
    fn labels(&self) -> &[String];

    fn classify(&self, face: &Frame) -> Result<Vec<f32>, InferenceError>;
}
