use crate::shared::bounding_box::BoundingBox;
use crate::shared::frame::Frame;

use super::inference_error::InferenceError;

/// Domain interface for face detection.
///
/// One detector is shared by every worker, hence `&self` and `Sync`.
/// Implementations that wrap a non-reentrant model lock internally.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, InferenceError>;
}
