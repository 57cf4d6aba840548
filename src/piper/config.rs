//! Piper configuration.
//!
//! Plain data with defaults; it can also be loaded from JSON:
//!
//! ```
//! use request_piper::piper::{ForwardMode, PiperConfig};
//!
//! let config = PiperConfig::from_json(r#"{ "forward_mode": "inline" }"#).unwrap();
//! assert_eq!(config.forward_mode, ForwardMode::Inline);
//! assert_eq!(config.max_frame_size, request_piper::transport::DEFAULT_MAX_FRAME_SIZE);
//! ```

use serde::{Deserialize, Serialize};

use super::tag::TAG_FRAME_SIZE;
use crate::error::{PiperError, Result};
use crate::transport::DEFAULT_MAX_FRAME_SIZE;

/// Where redirected calls run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Queue every call for a separate worker thread.
    #[default]
    Worker,
    /// No separate worker: calls arriving on the dispatch thread run right
    /// there, synchronously.
    Inline,
}

/// Configuration for a [`RequestPiper`](super::RequestPiper).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiperConfig {
    /// Where redirected calls run.
    pub forward_mode: ForwardMode,
    /// Largest frame accepted on the piper's notification pipes.
    pub max_frame_size: u32,
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            forward_mode: ForwardMode::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl PiperConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the response pipe can carry a tag frame.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < TAG_FRAME_SIZE as u32 {
            return Err(PiperError::Protocol(format!(
                "max_frame_size {} is smaller than a tag frame ({} bytes)",
                self.max_frame_size, TAG_FRAME_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let config = PiperConfig::default();
        assert_eq!(config.forward_mode, ForwardMode::Worker);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_from_json_full() {
        let config =
            PiperConfig::from_json(r#"{ "forward_mode": "worker", "max_frame_size": 4096 }"#)
                .unwrap();
        assert_eq!(config.forward_mode, ForwardMode::Worker);
        assert_eq!(config.max_frame_size, 4096);
    }

    #[test]
    fn test_frame_size_must_fit_a_tag() {
        let result = PiperConfig::from_json(r#"{ "max_frame_size": 4 }"#);
        assert!(matches!(result, Err(PiperError::Protocol(_))));

        let config = PiperConfig {
            max_frame_size: TAG_FRAME_SIZE as u32,
            ..PiperConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_empty_object() {
        assert_eq!(PiperConfig::from_json("{}").unwrap(), PiperConfig::default());
    }

    #[test]
    fn test_from_json_rejects_unknown_mode() {
        assert!(PiperConfig::from_json(r#"{ "forward_mode": "pool" }"#).is_err());
    }
}
