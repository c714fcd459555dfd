//! TOML configuration.
//!
//! ```toml
//! api_base_url = "http://127.0.0.1:8000"
//! dwell_ms = 180
//! frame_ms = 16
//! participants = ["Pro", "Con"]
//! session_db = "sessions.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::DecodeOptions;
use crate::error::DebateError;
use crate::turn_buffer::PacingConfig;

/// Environment variable overriding `api_base_url`.
pub const API_URL_ENV: &str = "DEBATE_API_URL";

/// Dwell range that reads as an "about to speak" pause.
pub const RECOMMENDED_DWELL_MS: std::ops::RangeInclusive<u64> = 120..=250;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    pub api_base_url: String,
    /// Where audio filenames resolve. Falls back to `api_base_url`.
    pub audio_base_url: Option<String>,
    pub dwell_ms: u64,
    pub frame_ms: u64,
    pub log_malformed_lines: bool,
    pub session_db: Option<PathBuf>,
    pub participants: Vec<String>,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            audio_base_url: None,
            dwell_ms: 180,
            frame_ms: 16,
            log_malformed_lines: false,
            session_db: None,
            participants: vec!["Pro".to_string(), "Con".to_string()],
        }
    }
}

impl DebateConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, DebateError> {
        let config: Self = toml::from_str(s)?;
        config.warn_unusual();
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DebateError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Apply `DEBATE_API_URL` if set and non-empty.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        self
    }

    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            dwell: Duration::from_millis(self.dwell_ms),
            frame: Duration::from_millis(self.frame_ms.max(1)),
        }
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions { log_malformed_lines: self.log_malformed_lines }
    }

    pub fn audio_base(&self) -> &str {
        self.audio_base_url.as_deref().unwrap_or(&self.api_base_url)
    }

    fn warn_unusual(&self) {
        if !RECOMMENDED_DWELL_MS.contains(&self.dwell_ms) {
            tracing::warn!(dwell_ms = self.dwell_ms, "dwell outside the 120-250 ms range");
        }
        if self.participants.is_empty() {
            tracing::warn!("no participants configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let c = DebateConfig::default();
        assert_eq!(c.dwell_ms, 180);
        assert_eq!(c.pacing().frame, Duration::from_millis(16));
        assert_eq!(c.audio_base(), "http://127.0.0.1:8000");
        assert_eq!(c.participants, vec!["Pro", "Con"]);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(DebateConfig::from_toml_str("").expect("parse"), DebateConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let c = DebateConfig::from_toml_str(
            r#"
            api_base_url = "https://debate.example.com"
            audio_base_url = "https://cdn.example.com"
            dwell_ms = 200
            log_malformed_lines = true
            participants = ["Socrates", "Nietzsche", "Judge"]
            "#,
        )
        .expect("parse");
        assert_eq!(c.pacing().dwell, Duration::from_millis(200));
        assert_eq!(c.frame_ms, 16);
        assert!(c.decode_options().log_malformed_lines);
        assert_eq!(c.audio_base(), "https://cdn.example.com");
        assert_eq!(c.participants.len(), 3);
    }

    #[rstest]
    #[case("dwell_ms = \"fast\"")]
    #[case("participants = 3")]
    #[case("api_base_url = ")]
    fn test_bad_toml_is_config_error(#[case] src: &str) {
        let err = DebateConfig::from_toml_str(src).expect_err("should fail");
        assert!(matches!(err, DebateError::Config(_)));
    }

    #[test]
    fn test_zero_frame_is_clamped() {
        let c = DebateConfig { frame_ms: 0, ..Default::default() };
        assert_eq!(c.pacing().frame, Duration::from_millis(1));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("debate.toml");
        std::fs::write(&path, "dwell_ms = 150\nsession_db = \"s.db\"\n").expect("write");
        let c = DebateConfig::load(&path).expect("load");
        assert_eq!(c.dwell_ms, 150);
        assert_eq!(c.session_db, Some(PathBuf::from("s.db")));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = DebateConfig::load("/no/such/debate.toml").expect_err("missing");
        assert!(matches!(err, DebateError::Io(_)));
    }
}
