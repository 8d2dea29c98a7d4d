pub mod emotion;
pub mod emotion_classifier;
pub mod face_detector;
pub mod inference_error;
