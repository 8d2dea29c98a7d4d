pub mod emotion_smoother;
pub mod face_tracker;
