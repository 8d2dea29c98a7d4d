use serde::{Deserialize, Serialize};

use crate::shared::constants::{
    DEFAULT_DETECTION_INTERVAL, DEFAULT_MAX_FRAME_RATE, DEFAULT_MIN_FACE_SIZE,
    DEFAULT_SMOOTHING_WINDOW, MAX_SMOOTHING_WINDOW,
};

/// Server-side maxima a client proposal is merged against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfigLimits {
    pub max_frame_rate: u32,
    pub max_smoothing_window: usize,
}

impl Default for ConfigLimits {
    fn default() -> Self {
        Self {
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            max_smoothing_window: MAX_SMOOTHING_WINDOW,
        }
    }
}

/// Client-proposed settings from `initialize` or `control(configure)`.
///
/// Every field is optional; absent fields keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigProposal {
    pub video_source: Option<String>,
    pub detection_interval: Option<u32>,
    pub min_face_size: Option<u32>,
    pub target_frame_rate: Option<u32>,
    pub smoothing_window: Option<usize>,
}

/// Effective per-session configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionConfig {
    pub video_source: String,
    pub target_frame_rate: u32,
    pub min_face_size: u32,
    pub smoothing_window: usize,
    pub detection_interval: u32,
}

impl SessionConfig {
    pub fn new(limits: &ConfigLimits) -> Self {
        Self {
            video_source: "webcam".to_string(),
            target_frame_rate: limits.max_frame_rate.max(1),
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW.min(limits.max_smoothing_window.max(1)),
            detection_interval: DEFAULT_DETECTION_INTERVAL,
        }
    }

    /// Applies `proposal`, capping each value at the server limits.
    pub fn merge(&mut self, proposal: &ConfigProposal, limits: &ConfigLimits) {
        if let Some(source) = &proposal.video_source {
            self.video_source = source.clone();
        }
        if let Some(interval) = proposal.detection_interval {
            self.detection_interval = interval.max(1);
        }
        if let Some(size) = proposal.min_face_size {
            self.min_face_size = size;
        }
        if let Some(rate) = proposal.target_frame_rate {
            self.target_frame_rate = rate.clamp(1, limits.max_frame_rate.max(1));
        }
        if let Some(window) = proposal.smoothing_window {
            self.smoothing_window = window.clamp(1, limits.max_smoothing_window.max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new(&ConfigLimits::default());
        assert_eq!(config.target_frame_rate, 10);
        assert_eq!(config.min_face_size, 64);
        assert_eq!(config.smoothing_window, 3);
        assert_eq!(config.detection_interval, 1);
    }

    #[rstest]
    #[case(30, 10)]
    #[case(5, 5)]
    #[case(0, 1)]
    fn test_frame_rate_capped(#[case] proposed: u32, #[case] effective: u32) {
        let limits = ConfigLimits::default();
        let mut config = SessionConfig::new(&limits);
        config.merge(
            &ConfigProposal {
                target_frame_rate: Some(proposed),
                ..Default::default()
            },
            &limits,
        );
        assert_eq!(config.target_frame_rate, effective);
    }

    #[test]
    fn test_absent_fields_keep_current_values() {
        let limits = ConfigLimits::default();
        let mut config = SessionConfig::new(&limits);
        config.merge(
            &ConfigProposal {
                min_face_size: Some(32),
                ..Default::default()
            },
            &limits,
        );
        config.merge(&ConfigProposal::default(), &limits);
        assert_eq!(config.min_face_size, 32);
        assert_eq!(config.target_frame_rate, 10);
    }

    #[test]
    fn test_smoothing_window_and_interval_bounds() {
        let limits = ConfigLimits::default();
        let mut config = SessionConfig::new(&limits);
        config.merge(
            &ConfigProposal {
                smoothing_window: Some(40),
                detection_interval: Some(0),
                ..Default::default()
            },
            &limits,
        );
        assert_eq!(config.smoothing_window, 10);
        assert_eq!(config.detection_interval, 1);
    }

    #[test]
    fn test_proposal_ignores_unknown_fields() {
        let proposal: ConfigProposal = serde_json::from_str(
            r#"{"video_source":"webcam","detection_interval":2,"min_face_size":48,"fps":99}"#,
        )
        .unwrap();
        assert_eq!(proposal.detection_interval, Some(2));
        assert_eq!(proposal.target_frame_rate, None);
    }
}
