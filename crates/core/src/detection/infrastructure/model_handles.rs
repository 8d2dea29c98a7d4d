use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::detection::domain::emotion_classifier::EmotionClassifier;
use crate::detection::domain::face_detector::FaceDetector;
use crate::detection::domain::inference_error::InferenceError;
use crate::shared::bounding_box::BoundingBox;
use crate::shared::frame::Frame;

use super::call_gate::{CallGate, GatePermit};
use super::onnx_emotion_classifier::OnnxEmotionClassifier;
use super::onnx_yolo_detector::OnnxYoloDetector;

const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-wide detector and classifier, built once at startup and shared
/// read-only by every worker.
///
/// Both models are `Sync`; when `with_admission_limit` is set, every call
/// additionally passes through a [`CallGate`] so at most N inferences run
/// at once.
pub struct ModelHandles {
    detector: Arc<dyn FaceDetector>,
    classifier: Arc<dyn EmotionClassifier>,
    gate: Option<CallGate>,
    admission_timeout: Duration,
}

impl ModelHandles {
    pub fn new(detector: Arc<dyn FaceDetector>, classifier: Arc<dyn EmotionClassifier>) -> Self {
        Self {
            detector,
            classifier,
            gate: None,
            admission_timeout: DEFAULT_ADMISSION_TIMEOUT,
        }
    }

    pub fn with_admission_limit(mut self, permits: usize, timeout: Duration) -> Self {
        self.gate = Some(CallGate::new(permits));
        self.admission_timeout = timeout;
        self
    }

    /// Loads the ONNX face detector and emotion classifier.
    pub fn load_onnx(
        detector_model: &Path,
        classifier_model: &Path,
        labels: Vec<String>,
        confidence: f64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let detector = OnnxYoloDetector::new(detector_model, confidence)?;
        let classifier = OnnxEmotionClassifier::new(classifier_model, labels)?;
        Ok(Self::new(Arc::new(detector), Arc::new(classifier)))
    }

    pub fn labels(&self) -> &[String] {
        self.classifier.labels()
    }

    pub fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, InferenceError> {
        let _permit = self.admit("face detector")?;
        self.detector.detect(frame)
    }

    pub fn classify(&self, face: &Frame) -> Result<Vec<f32>, InferenceError> {
        let _permit = self.admit("emotion classifier")?;
        self.classifier.classify(face)
    }

    fn admit(&self, model: &str) -> Result<Option<GatePermit<'_>>, InferenceError> {
        match &self.gate {
            None => Ok(None),
            Some(gate) => gate.acquire(self.admission_timeout).map(Some).ok_or_else(|| {
                InferenceError::Unavailable(format!(
                    "{model} busy: no slot within {}ms",
                    self.admission_timeout.as_millis()
                ))
            }),
        }
    }
}
