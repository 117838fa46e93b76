use std::path::Path;

use rapier3d::prelude::Real;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ProtocolError;

/// Networking knobs shared by the predicting client and the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub enable_move_combining: bool,
    /// Hold back a move that could still be combined with the next one.
    pub enable_send_delay: bool,
    /// Longest delta a single move may carry, on either side.
    pub max_move_delta_time: Real,
    /// Minimum interval between client sends, clamped to 1/120..1/15 s.
    pub net_send_delta_time: Real,
    pub max_saved_moves: usize,
    /// Client timestamps restart after this many seconds.
    pub timestamp_reset_interval: Real,
    pub max_position_error_squared: Real,
    /// Minimum seconds between two corrections to the same client.
    pub correction_rate_limit: Real,
    /// How far the client's claimed time may run ahead of the server clock.
    pub max_time_discrepancy: Real,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            enable_move_combining: true,
            enable_send_delay: true,
            max_move_delta_time: 0.125,
            net_send_delta_time: 1.0 / 60.0,
            max_saved_moves: 96,
            timestamp_reset_interval: 240.0,
            max_position_error_squared: 3.0,
            correction_rate_limit: 0.0,
            max_time_discrepancy: 0.25,
        }
    }
}

impl NetConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ProtocolError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ProtocolError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "loaded net config");
        Ok(config)
    }

    pub fn clamped_send_delta_time(&self) -> Real {
        self.net_send_delta_time.clamp(1.0 / 120.0, 1.0 / 15.0)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let positive = [
            ("max_move_delta_time", self.max_move_delta_time),
            ("net_send_delta_time", self.net_send_delta_time),
            ("timestamp_reset_interval", self.timestamp_reset_interval),
            ("max_time_discrepancy", self.max_time_discrepancy),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ProtocolError::Config {
                    field,
                    reason: format!("expected a positive value, got {value}"),
                });
            }
        }
        for (field, value) in [
            ("max_position_error_squared", self.max_position_error_squared),
            ("correction_rate_limit", self.correction_rate_limit),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ProtocolError::Config {
                    field,
                    reason: format!("expected a finite value >= 0, got {value}"),
                });
            }
        }
        if self.max_saved_moves == 0 {
            return Err(ProtocolError::Config {
                field: "max_saved_moves",
                reason: "expected at least one saved move".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = NetConfig::from_toml_str("max_saved_moves = 32\ncorrection_rate_limit = 0.1\n")
            .expect("parse net config");
        assert_eq!(config.max_saved_moves, 32);
        assert_eq!(config.correction_rate_limit, 0.1);
        assert_eq!(config.max_move_delta_time, 0.125);
    }

    #[test]
    fn rejects_zero_delta_and_bad_types() {
        assert!(matches!(
            NetConfig::from_toml_str("max_move_delta_time = 0.0"),
            Err(ProtocolError::Config { field: "max_move_delta_time", .. })
        ));
        assert!(matches!(
            NetConfig::from_toml_str("max_saved_moves = \"many\""),
            Err(ProtocolError::ConfigParse(_))
        ));
    }

    #[test]
    fn send_delta_is_clamped() {
        let mut config = NetConfig {
            net_send_delta_time: 1.0,
            ..NetConfig::default()
        };
        assert_eq!(config.clamped_send_delta_time(), 1.0 / 15.0);
        config.net_send_delta_time = 0.001;
        assert_eq!(config.clamped_send_delta_time(), 1.0 / 120.0);
    }
}
