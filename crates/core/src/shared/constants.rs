/// Frames buffered per session before drop-oldest eviction kicks in.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// Minimum IoU for a detection to continue an existing track.
pub const DEFAULT_TRACK_IOU_THRESHOLD: f64 = 0.3;

/// Consecutive unmatched frames a track survives (reported as fading).
pub const DEFAULT_FADE_GRACE: usize = 2;

pub const DEFAULT_SMOOTHING_WINDOW: usize = 3;
pub const MAX_SMOOTHING_WINDOW: usize = 10;

pub const DEFAULT_MAX_FRAME_RATE: u32 = 10;
pub const DEFAULT_MAX_RESOLUTION: [u32; 2] = [640, 480];
pub const DEFAULT_MIN_FACE_SIZE: u32 = 64;
pub const DEFAULT_DETECTION_INTERVAL: u32 = 1;

/// Base64 text shorter than this cannot hold a usable image.
pub const MIN_BASE64_LEN: usize = 100;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Processed frames between `status` metric reports.
pub const DEFAULT_METRICS_INTERVAL: u64 = 30;

/// Rolling window (in frames) for pool latency averaging.
pub const LATENCY_WINDOW: usize = 30;
pub const DEFAULT_LATENCY_THRESHOLD_MS: u64 = 500;
pub const DEFAULT_QUEUE_FULL_STREAK: u32 = 3;
pub const DEFAULT_HINT_COOLDOWN_MS: u64 = 2000;

pub const DEFAULT_GUEST_MAX_REQUESTS: usize = 3;
pub const DEFAULT_GUEST_WINDOW_SECS: u64 = 3600;

pub const SUPPORTED_ACTIONS: &[&str] = &["start", "stop", "configure"];

/// Label order of the FER-style emotion classifiers this server fronts.
pub const DEFAULT_EMOTION_LABELS: &[&str] = &[
    "angry", "disgust", "fear", "happy", "sad", "surprise", "neutral",
];
