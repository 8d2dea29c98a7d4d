use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::rate_controller::RateSettings;
use crate::session::session_config::ConfigLimits;
use crate::shared::constants::{
    DEFAULT_FADE_GRACE, DEFAULT_GUEST_MAX_REQUESTS, DEFAULT_GUEST_WINDOW_SECS,
    DEFAULT_HINT_COOLDOWN_MS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_LATENCY_THRESHOLD_MS,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_RATE, DEFAULT_MAX_PAYLOAD_BYTES,
    DEFAULT_MAX_RESOLUTION, DEFAULT_METRICS_INTERVAL, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_QUEUE_FULL_STREAK, DEFAULT_TRACK_IOU_THRESHOLD, MAX_SMOOTHING_WINDOW,
};

/// Tunables for the streaming hub. Missing fields in a settings file fall
/// back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Worker threads; 0 means one per available core.
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_connections: usize,
    pub max_frame_rate: u32,
    pub max_resolution: [u32; 2],
    pub max_smoothing_window: usize,
    pub max_payload_bytes: usize,
    pub idle_timeout_secs: u64,
    pub metrics_interval: u64,
    pub latency_threshold_ms: u64,
    pub queue_full_streak: u32,
    pub hint_cooldown_ms: u64,
    pub guest_max_requests: usize,
    pub guest_window_secs: u64,
    pub track_iou_threshold: f64,
    pub fade_grace: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            max_resolution: DEFAULT_MAX_RESOLUTION,
            max_smoothing_window: MAX_SMOOTHING_WINDOW,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            latency_threshold_ms: DEFAULT_LATENCY_THRESHOLD_MS,
            queue_full_streak: DEFAULT_QUEUE_FULL_STREAK,
            hint_cooldown_ms: DEFAULT_HINT_COOLDOWN_MS,
            guest_max_requests: DEFAULT_GUEST_MAX_REQUESTS,
            guest_window_secs: DEFAULT_GUEST_WINDOW_SECS,
            track_iou_threshold: DEFAULT_TRACK_IOU_THRESHOLD,
            fade_grace: DEFAULT_FADE_GRACE,
        }
    }
}

impl HubConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn limits(&self) -> ConfigLimits {
        ConfigLimits {
            max_frame_rate: self.max_frame_rate,
            max_smoothing_window: self.max_smoothing_window,
        }
    }

    pub fn rate_settings(&self) -> RateSettings {
        RateSettings {
            latency_threshold: Duration::from_millis(self.latency_threshold_ms),
            queue_full_streak: self.queue_full_streak,
            hint_cooldown: Duration::from_millis(self.hint_cooldown_ms),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn guest_window(&self) -> Duration {
        Duration::from_secs(self.guest_window_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".into());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }
        if self.max_frame_rate == 0 {
            return Err("max_frame_rate must be at least 1".into());
        }
        if self.max_resolution.contains(&0) {
            return Err("max_resolution must be positive".into());
        }
        if !(1..=MAX_SMOOTHING_WINDOW).contains(&self.max_smoothing_window) {
            return Err(format!(
                "max_smoothing_window must be between 1 and {MAX_SMOOTHING_WINDOW}"
            ));
        }
        if !(0.0..1.0).contains(&self.track_iou_threshold) {
            return Err("track_iou_threshold must be in [0, 1)".into());
        }
        if self.queue_full_streak == 0 {
            return Err("queue_full_streak must be at least 1".into());
        }
        Ok(())
    }
}
