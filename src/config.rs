use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use kuchiki::Selectors;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_TRACKED_PARAMETERS: &[&str] =
    &["gclid", "fbclid", "utm_source", "utm_medium", "utm_campaign"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read tracker config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("tracked parameter list is empty")]
    NoTrackedParameters,
    #[error("tracked parameter '{0}' is listed more than once")]
    DuplicateParameter(String),
    #[error("cookie name must not be empty")]
    EmptyCookieName,
    #[error("invalid hidden field selector '{0}'")]
    HiddenSelector(String),
}

/// Timing knobs for iframe discovery and readiness polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSyncSettings {
    pub debounce_ms: u64,
    pub initial_poll_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
}

impl Default for FrameSyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            initial_poll_delay_ms: 50,
            poll_interval_ms: 100,
            max_poll_attempts: 50,
        }
    }
}

impl FrameSyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn initial_poll_delay(&self) -> Duration {
        Duration::from_millis(self.initial_poll_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Ordered set of campaign identifiers. Every comparison and population
    /// pass walks this list in order.
    pub tracked_parameters: Vec<String>,
    pub referrer_key: String,
    pub cookie_name: String,
    pub cookie_expiry_days: Option<u32>,
    pub empty_param_value: String,
    pub empty_referrer_value: String,
    pub hidden_field_selector: String,
    pub force_submit_form_class: String,
    pub message_source: String,
    pub frames: FrameSyncSettings,
    /// Skip the store write when a refresh would rewrite an identical record.
    pub skip_unchanged_writes: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tracked_parameters: DEFAULT_TRACKED_PARAMETERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            referrer_key: "http_referer".to_string(),
            cookie_name: "Lead".to_string(),
            cookie_expiry_days: None,
            empty_param_value: String::new(),
            empty_referrer_value: "empty".to_string(),
            hidden_field_selector: ".always-hidden, .form-field-hidden".to_string(),
            force_submit_form_class: "jotform-form".to_string(),
            message_source: "utm_tracker".to_string(),
            frames: FrameSyncSettings::default(),
            skip_unchanged_writes: false,
        }
    }
}

impl TrackerConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracked_parameters.is_empty() {
            return Err(ConfigError::NoTrackedParameters);
        }
        let mut seen = HashSet::new();
        for param in self
            .tracked_parameters
            .iter()
            .chain(std::iter::once(&self.referrer_key))
        {
            if !seen.insert(param.as_str()) {
                return Err(ConfigError::DuplicateParameter(param.clone()));
            }
        }
        if self.cookie_name.trim().is_empty() {
            return Err(ConfigError::EmptyCookieName);
        }
        Selectors::compile(&self.hidden_field_selector)
            .map_err(|()| ConfigError::HiddenSelector(self.hidden_field_selector.clone()))?;
        Ok(())
    }

    /// TrackedSet followed by the referrer key, the order used when
    /// populating form fields.
    pub fn lead_parameters(&self) -> impl Iterator<Item = &str> {
        self.tracked_parameters
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.referrer_key.as_str()))
    }

    pub fn empty_value_for<'a>(&'a self, identifier: &str) -> &'a str {
        if identifier == self.referrer_key {
            &self.empty_referrer_value
        } else {
            &self.empty_param_value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = TrackerConfig::load(None).unwrap();
        assert_eq!(config.cookie_name, "Lead");
        assert_eq!(config.tracked_parameters.len(), 5);
        assert_eq!(config.frames.max_poll_attempts, 50);
    }

    #[test]
    fn loads_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "tracked_parameters:\n  - utm_source\n  - msclkid\ncookie_name: Attribution\nframes:\n  debounce_ms: 20"
        )
        .unwrap();
        let config = TrackerConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.tracked_parameters, vec!["utm_source", "msclkid"]);
        assert_eq!(config.cookie_name, "Attribution");
        assert_eq!(config.frames.debounce_ms, 20);
        assert_eq!(config.frames.poll_interval_ms, 100);
        assert_eq!(config.empty_referrer_value, "empty");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig::load(Some(dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config, TrackerConfig::default());
    }

    #[test]
    fn rejects_duplicate_identifiers() {
        let config = TrackerConfig {
            tracked_parameters: vec!["gclid".into(), "gclid".into()],
            ..TrackerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateParameter(name)) if name == "gclid"
        ));
    }

    #[test]
    fn rejects_bad_hidden_selector() {
        let config = TrackerConfig {
            hidden_field_selector: "[[".into(),
            ..TrackerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HiddenSelector(_))
        ));
    }

    #[test]
    fn lead_parameters_end_with_referrer() {
        let config = TrackerConfig::default();
        let params: Vec<&str> = config.lead_parameters().collect();
        assert_eq!(params.first(), Some(&"gclid"));
        assert_eq!(params.last(), Some(&"http_referer"));
        assert_eq!(config.empty_value_for("http_referer"), "empty");
        assert_eq!(config.empty_value_for("utm_source"), "");
    }
}
