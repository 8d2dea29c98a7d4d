//! Emotion classifier over face crops using ONNX Runtime.
//!
//! Expects an image-classification model (ViT/CNN FER style) taking a
//! `[1, 3, 224, 224]` float tensor with values in `[0, 1]` and producing one
//! score per label. Logit outputs are passed through softmax.
use std::path::Path;
use std::sync::Mutex;

use crate::detection::domain::emotion::{is_distribution, softmax};
use crate::detection::domain::emotion_classifier::EmotionClassifier;
use crate::detection::domain::inference_error::InferenceError;
use crate::shared::frame::Frame;

use super::execution_provider::open_session;

const INPUT_SIZE: usize = 224;

pub struct OnnxEmotionClassifier {
    session: Mutex<ort::session::Session>,
    labels: Vec<String>,
}

impl OnnxEmotionClassifier {
    pub fn new(model_path: &Path, labels: Vec<String>) -> Result<Self, Box<dyn std::error::Error>> {
        if labels.is_empty() {
            return Err("emotion classifier needs at least one label".into());
        }
        let session = open_session(model_path)?;
        log::info!(
            "Loaded emotion classifier {} ({} labels)",
            model_path.display(),
            labels.len()
        );
        Ok(Self {
            session: Mutex::new(session),
            labels,
        })
    }

    fn run(&self, face: &Frame) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
        let tensor = preprocess(face);
        let input_value = ort::value::Tensor::from_array(tensor)?;
        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("Lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let scores = outputs[0].try_extract_array::<f32>()?;
        let raw = scores.as_slice().ok_or("Cannot get score slice")?;

        if raw.len() < self.labels.len() {
            return Err(format!(
                "model produced {} scores for {} labels",
                raw.len(),
                self.labels.len()
            )
            .into());
        }
        let raw = &raw[..self.labels.len()];
        Ok(if is_distribution(raw) {
            raw.to_vec()
        } else {
            softmax(raw)
        })
    }
}

impl EmotionClassifier for OnnxEmotionClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn classify(&self, face: &Frame) -> Result<Vec<f32>, InferenceError> {
        self.run(face)
            .map_err(|e| InferenceError::Failed(e.to_string()))
    }
}

/// Nearest-neighbour resize to 224x224, scale to
/// `[0, 1]`, NCHW layout.
fn preprocess(face: &Frame) -> ndarray::Array4<f32> {
    let src_w = face.width() as usize;
    let src_h = face.height() as usize;
    let src = face.as_ndarray();

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    if src_w == 0 || src_h == 0 {
        return tensor;
    }

    for y in 0..INPUT_SIZE {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / INPUT_SIZE as f64) as usize).min(src_h - 1);
        for x in 0..INPUT_SIZE {
            let src_x =
                (((x as f64 + 0.5) * src_w as f64 / INPUT_SIZE as f64) as usize).min(src_w - 1);
            for c in 0..3 {
                tensor[[0, c, y, x]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    tensor
}
