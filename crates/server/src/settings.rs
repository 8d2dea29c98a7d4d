use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use emostream_core::auth::token_verifier::{Identity, StaticTokenVerifier};
use emostream_core::hub::hub_config::HubConfig;
use emostream_core::shared::constants::DEFAULT_EMOTION_LABELS;

pub const DEFAULT_BIND: &str = "127.0.0.1:8765";

/// Everything the server binary reads from its settings file.
///
/// ```json
/// {
///   "bind": "0.0.0.0:8765",
///   "detector_model": "/models/yolo-face.onnx",
///   "classifier_model": "/models/emotion.onnx",
///   "tokens": { "secret": { "kind": "user", "id": "alice" } },
///   "hub": { "queue_capacity": 5 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub detector_model: Option<PathBuf>,
    pub classifier_model: Option<PathBuf>,
    pub emotion_labels: Vec<String>,
    pub confidence: f64,
    /// Concurrent inference calls allowed across all workers; 0 = no limit.
    pub inference_permits: usize,
    pub admission_timeout_ms: u64,
    pub reap_interval_secs: u64,
    pub tokens: HashMap<String, Identity>,
    pub hub: HubConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            detector_model: None,
            classifier_model: None,
            emotion_labels: DEFAULT_EMOTION_LABELS.iter().map(|l| l.to_string()).collect(),
            confidence: 0.5,
            inference_permits: 0,
            admission_timeout_ms: 2000,
            reap_interval_secs: 30,
            tokens: HashMap::new(),
            hub: HubConfig::default(),
        }
    }
}

impl ServerSettings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("EmoStream").join("settings.json"))
    }

    /// Reads `path` if given, otherwise the per-user settings file if it
    /// exists, otherwise defaults. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::config_path().filter(|p| p.is_file()) {
                Some(default_path) => Self::load_from(&default_path),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let json = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read settings {}: {e}", path.display()))?;
        let settings = serde_json::from_str(&json)
            .map_err(|e| format!("Invalid settings {}: {e}", path.display()))?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.hub.validate()?;
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err("confidence must be between 0.0 and 1.0".into());
        }
        if self.emotion_labels.is_empty() {
            return Err("emotion_labels must not be empty".into());
        }
        for (name, path) in [
            ("detector_model", &self.detector_model),
            ("classifier_model", &self.classifier_model),
        ] {
            match path {
                None => return Err(format!("{name} is not configured").into()),
                Some(p) if !p.is_file() => {
                    return Err(format!("{name} not found: {}", p.display()).into())
                }
                Some(_) => {}
            }
        }
        if self.tokens.is_empty() {
            log::warn!("No tokens configured; every connection will be refused");
        }
        Ok(())
    }

    pub fn verifier(&self) -> StaticTokenVerifier {
        self.tokens
            .iter()
            .map(|(token, identity)| (token.clone(), identity.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emostream_core::auth::token_verifier::TokenVerifier;
    use tempfile::TempDir;

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"bind": "0.0.0.0:9000", "hub": {"workers": 3}}"#).unwrap();

        let settings = ServerSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.bind, "0.0.0.0:9000");
        assert_eq!(settings.hub.workers, 3);
        assert_eq!(settings.hub.queue_capacity, 5);
        assert_eq!(settings.emotion_labels.len(), 7);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(ServerSettings::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(ServerSettings::load_from(&path).is_err());
    }

    #[test]
    fn test_save_then_load_preserves_tokens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = ServerSettings::default();
        settings
            .tokens
            .insert("t1".into(), Identity::Guest("visitor".into()));
        settings.save_to(&path).unwrap();

        assert_eq!(ServerSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_token_table_builds_verifier() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"tokens": {"abc": {"kind": "user", "id": "alice"}}}"#,
        )
        .unwrap();

        let verifier = ServerSettings::load_from(&path).unwrap().verifier();
        assert_eq!(verifier.verify("abc").unwrap(), Identity::User("alice".into()));
        assert!(verifier.verify("xyz").is_err());
    }

    #[test]
    fn test_validate_requires_existing_models() {
        let dir = TempDir::new().unwrap();
        let mut settings = ServerSettings::default();
        assert!(settings.validate().is_err());

        let model = dir.path().join("model.onnx");
        fs::write(&model, b"onnx").unwrap();
        settings.detector_model = Some(model.clone());
        settings.classifier_model = Some(dir.path().join("missing.onnx"));
        assert!(settings.validate().is_err());

        settings.classifier_model = Some(model);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let settings = ServerSettings {
            confidence: 1.5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
