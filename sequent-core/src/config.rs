use crate::error::{NetError, Result};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs of a training run that do not change the model itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Draws a progress bar on stderr while fitting.
    pub verbose: bool,
    /// Size of the model's worker pool; `None` uses every available core.
    pub num_threads: Option<usize>,
    /// Rescales any parameter gradient whose L2 norm exceeds this value.
    pub clip_norm: Option<f64>,
    /// Leaves a parameter untouched when its gradient holds NaN or infinity.
    pub skip_non_finite: bool,
    /// Number of recent `(loss, gradient)` evaluations the model keeps; 0 keeps none.
    pub history_len: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            num_threads: None,
            clip_norm: None,
            skip_non_finite: true,
            history_len: 32,
        }
    }
}

impl TrainConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(NetError::invalid("num_threads must be at least 1"));
        }
        if let Some(clip) = self.clip_norm {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(NetError::invalid(format!("clip_norm must be positive, got {}", clip)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = TrainConfig::from_json_str(r#"{ "clip_norm": 5.0 }"#).unwrap();
        assert_eq!(config.clip_norm, Some(5.0));
        assert!(config.skip_non_finite);
        assert!(!config.verbose);
        assert_eq!(config.num_threads, None);
        assert_eq!(config.history_len, 32);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(TrainConfig::from_json_str(r#"{ "num_threads": 0 }"#), Err(NetError::InvalidArgument(_))));
        assert!(matches!(TrainConfig::from_json_str(r#"{ "clip_norm": -1.0 }"#), Err(NetError::InvalidArgument(_))));
        assert!(matches!(TrainConfig::from_json_str("{ verbose"), Err(NetError::Config(_))));
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!("sequent-config-{}.json", std::process::id()));
        let config = TrainConfig { verbose: true, num_threads: Some(2), ..TrainConfig::default() };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(TrainConfig::from_json_file(&path).unwrap(), config);
        std::fs::remove_file(&path).unwrap();
    }
}
