//! YOLO-face detector on ONNX Runtime.
//!
//! Stateless apart from the locked session: one instance is shared by every
//! worker, and tracking happens per session further down the pipeline.
use std::path::Path;
use std::sync::Mutex;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::detection::domain::face_detector::FaceDetector;
use crate::detection::domain::inference_error::InferenceError;
use crate::shared::bounding_box::BoundingBox;
use crate::shared::frame::Frame;

use super::execution_provider::open_session;

/// Used when the model declares a dynamic input size.
const FALLBACK_INPUT_SIZE: u32 = 640;
const SUPPRESSION_IOU: f64 = 0.45;
/// YOLO letterbox padding value.
const PAD_VALUE: f32 = 114.0 / 255.0;

pub struct OnnxYoloDetector {
    session: Mutex<ort::session::Session>,
    confidence: f32,
    input_size: u32,
}

impl OnnxYoloDetector {
    pub fn new(model_path: &Path, confidence: f64) -> Result<Self, Box<dyn std::error::Error>> {
        let session = open_session(model_path)?;
        let input_size = declared_input_size(&session).unwrap_or(FALLBACK_INPUT_SIZE);
        log::info!(
            "Loaded face detector {} ({input_size}px input, confidence {confidence})",
            model_path.display()
        );
        Ok(Self {
            session: Mutex::new(session),
            confidence: confidence as f32,
            input_size,
        })
    }

    fn run(&self, frame: &Frame) -> Result<Vec<BoundingBox>, Box<dyn std::error::Error>> {
        let fit = Letterbox::fit(frame.width(), frame.height(), self.input_size);
        let input = ort::value::Tensor::from_array(fit.tensor(frame, self.input_size)?)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| "face detector session poisoned")?;
        let outputs = session.run(ort::inputs![input])?;
        if outputs.len() == 0 {
            return Err("face detector returned no outputs".into());
        }
        let output = outputs[0].try_extract_array::<f32>()?;
        let rows = OutputRows::new(output.shape())?;
        let data = output.as_slice().ok_or("face detector output is not contiguous")?;

        let candidates = (0..rows.count)
            .filter_map(|i| {
                let score = rows.get(data, i, 4);
                (score >= self.confidence).then(|| Candidate {
                    bbox: fit.to_source(
                        rows.get(data, i, 0),
                        rows.get(data, i, 1),
                        rows.get(data, i, 2),
                        rows.get(data, i, 3),
                    ),
                    score,
                })
            })
            .filter(|c| c.bbox.width > 0 && c.bbox.height > 0)
            .collect();

        Ok(suppress(candidates, SUPPRESSION_IOU)
            .into_iter()
            .map(|c| c.bbox)
            .collect())
    }
}

impl FaceDetector for OnnxYoloDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, InferenceError> {
        self.run(frame)
            .map_err(|e| InferenceError::Failed(e.to_string()))
    }
}

/// Square input size from an NCHW input shape, if static.
fn declared_input_size(session: &ort::session::Session) -> Option<u32> {
    let input = session.inputs().first()?;
    match input.dtype() {
        ort::value::ValueType::Tensor { shape, .. } if shape.len() == 4 && shape[2] > 0 => {
            Some(shape[2] as u32)
        }
        _ => None,
    }
}

/// Placement of a frame inside the square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    scale: f64,
    width: u32,
    height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f64 / width.max(1) as f64).min(target as f64 / height.max(1) as f64);
        let scaled_w = ((width as f64 * scale).round() as u32).clamp(1, target);
        let scaled_h = ((height as f64 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            width: scaled_w,
            height: scaled_h,
            pad_x: (target - scaled_w) / 2,
            pad_y: (target - scaled_h) / 2,
        }
    }

    /// NCHW tensor in `[0, 1]`, gray outside the placed image.
    fn tensor(&self, frame: &Frame, target: u32) -> Result<Array4<f32>, Box<dyn std::error::Error>> {
        let image = RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
            .ok_or("frame is not packed RGB")?;
        let resized = imageops::resize(&image, self.width, self.height, FilterType::Triangle);

        let side = target as usize;
        let mut tensor = Array4::<f32>::from_elem((1, 3, side, side), PAD_VALUE);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let ty = (y + self.pad_y) as usize;
            let tx = (x + self.pad_x) as usize;
            for (c, value) in pixel.0.iter().enumerate() {
                tensor[[0, c, ty, tx]] = *value as f32 / 255.0;
            }
        }
        Ok(tensor)
    }

    /// Maps a center-format box in model space back onto the source frame.
    fn to_source(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let unmap_x = |v: f64| (v - self.pad_x as f64) / self.scale;
        let unmap_y = |v: f64| (v - self.pad_y as f64) / self.scale;
        let (cx, cy, w, h) = (cx as f64, cy as f64, w as f64, h as f64);
        BoundingBox::from_corners(
            unmap_x(cx - w / 2.0),
            unmap_y(cy - h / 2.0),
            unmap_x(cx + w / 2.0),
            unmap_y(cy + h / 2.0),
        )
    }
}

/// Indexing over a `[1, features, rows]` or `[1, rows, features]` output.
/// Row layout: `cx, cy, w, h, score, ...landmarks`.
#[derive(Debug)]
struct OutputRows {
    count: usize,
    features: usize,
    features_first: bool,
}

impl OutputRows {
    fn new(shape: &[usize]) -> Result<Self, String> {
        let [_, a, b] = shape else {
            return Err(format!("unexpected face detector output shape {shape:?}"));
        };
        let features_first = a < b;
        let (count, features) = if features_first { (*b, *a) } else { (*a, *b) };
        if features < 5 {
            return Err(format!("face detector rows have {features} values, need 5"));
        }
        Ok(Self {
            count,
            features,
            features_first,
        })
    }

    fn get(&self, data: &[f32], row: usize, feature: usize) -> f32 {
        if self.features_first {
            data[feature * self.count + row]
        } else {
            data[row * self.features + feature]
        }
    }
}

#[derive(Clone, Debug)]
struct Candidate {
    bbox: BoundingBox,
    score: f32,
}

/// Greedy non-maximum suppression, best score first.
fn suppress(mut candidates: Vec<Candidate>, iou: f64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn candidate(x: i32, y: i32, side: i32, score: f32) -> Candidate {
        Candidate {
            bbox: BoundingBox::new(x, y, side, side),
            score,
        }
    }

    #[test]
    fn test_letterbox_fits_wide_frame() {
        let fit = Letterbox::fit(640, 320, 320);
        assert_relative_eq!(fit.scale, 0.5);
        assert_eq!((fit.width, fit.height), (320, 160));
        assert_eq!((fit.pad_x, fit.pad_y), (0, 80));
    }

    #[test]
    fn test_to_source_inverts_letterbox() {
        let fit = Letterbox::fit(640, 320, 320);
        // A 100x50 face at (200, 100) in the frame sits at (100, 130) 50x25 in model space.
        let bbox = fit.to_source(125.0, 142.5, 50.0, 25.0);
        assert_eq!(bbox, BoundingBox::new(200, 100, 100, 50));
    }

    #[test]
    fn test_tensor_pads_with_gray() {
        let frame = Frame::new(vec![255; 40 * 20 * 3], 40, 20, 3, 0);
        let fit = Letterbox::fit(40, 20, 32);
        let tensor = fit.tensor(&frame, 32).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        assert_relative_eq!(tensor[[0, 0, 0, 0]], PAD_VALUE);
        assert_relative_eq!(tensor[[0, 1, 16, 16]], 1.0);
    }

    #[test]
    fn test_output_rows_detect_layout() {
        let data: Vec<f32> = (0..40).map(|v| v as f32).collect();

        let rows = OutputRows::new(&[1, 5, 8]).unwrap();
        assert_eq!(rows.count, 8);
        assert_eq!(rows.get(&data, 1, 0), 1.0);
        assert_eq!(rows.get(&data, 0, 4), 32.0);

        let rows = OutputRows::new(&[1, 8, 5]).unwrap();
        assert_eq!(rows.count, 8);
        assert_eq!(rows.get(&data, 1, 0), 5.0);
        assert_eq!(rows.get(&data, 7, 4), 39.0);
    }

    #[test]
    fn test_output_rows_reject_bad_shapes() {
        assert!(OutputRows::new(&[1, 4]).is_err());
        assert!(OutputRows::new(&[1, 4, 3]).is_err());
    }

    #[test]
    fn test_suppress_keeps_best_of_overlapping() {
        let kept = suppress(
            vec![candidate(2, 2, 100, 0.6), candidate(0, 0, 100, 0.9)],
            SUPPRESSION_IOU,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_suppress_keeps_separate_faces() {
        let kept = suppress(
            vec![candidate(0, 0, 50, 0.9), candidate(200, 200, 50, 0.8)],
            SUPPRESSION_IOU,
        );
        assert_eq!(kept.len(), 2);
        assert!(suppress(Vec::new(), SUPPRESSION_IOU).is_empty());
    }
}
