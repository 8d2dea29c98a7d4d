use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::detection::domain::emotion::RankedEmotion;
use crate::session::session_config::SessionConfig;
use crate::session::stream_error::StreamError;
use crate::shared::bounding_box::BoundingBox;

/// Events the server sends, framed as `{"event": ..., "data": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Initialized(InitializedPayload),
    DetectionResult(DetectionPayload),
    Status(StatusPayload),
    ErrorMessage(ErrorPayload),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InitializedPayload {
    pub session_id: String,
    pub timestamp: f64,
    pub config: EffectiveConfig,
}

/// Negotiated session settings plus the server limits they were capped by.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub max_frame_rate: u32,
    pub max_resolution: [u32; 2],
    pub supported_actions: Vec<String>,
    pub queue_capacity: usize,
    #[serde(flatten)]
    pub session: SessionConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionPayload {
    pub frame_id: u64,
    pub timestamp: Option<f64>,
    /// Seconds from intake to result.
    pub processing_time: f64,
    pub faces: Vec<FaceResult>,
    pub face_detected: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaceResult {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub tracking_id: u32,
    pub emotions: Vec<RankedEmotion>,
    pub fading: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StreamMetrics>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub current_fps: f64,
    /// Frames per second the client has been sending.
    pub incoming_fps: f64,
    /// Seconds, averaged over recent frames.
    pub average_processing_time: f64,
    pub tracking_faces: usize,
    pub queue_depth: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_value: Option<u32>,
}

impl ServerEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status(StatusPayload {
            message: message.into(),
            metrics: None,
        })
    }

    pub fn error(err: &StreamError, frame_id: Option<u64>) -> Self {
        Self::ErrorMessage(ErrorPayload {
            code: err.code(),
            message: err.to_string(),
            frame_id,
            recommended_value: err.recommended_value(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Seconds since the Unix epoch, as sent in `timestamp` fields.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
