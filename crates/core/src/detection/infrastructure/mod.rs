pub mod call_gate;
pub mod execution_provider;
pub mod model_handles;
pub mod onnx_emotion_classifier;
pub mod onnx_yolo_detector;
