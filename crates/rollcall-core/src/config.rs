//! Kiosk tuning: thresholds, tick periods, cool-down.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("confidence_threshold must be within 0.5..=1.0, got {0}")]
    ConfidenceThreshold(f32),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("max_faces_per_frame must be at least 1")]
    MaxFaces,
    #[error("roi_fraction must be within (0, 1], got {0}")]
    RoiFraction(f32),
}

/// Thresholds for the luminance presence heuristic (8-bit scale).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub mean_threshold: f32,
    pub variance_threshold: f32,
    /// Fraction of width and height covered by the centred region of interest.
    pub roi_fraction: f32,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            mean_threshold: 40.0,
            variance_threshold: 200.0,
            roi_fraction: 0.5,
        }
    }
}

/// Recognition and timing options for a kiosk session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    /// Minimum match confidence accepted, 0.5–1.0.
    pub confidence_threshold: f32,
    /// Require the service's liveness verdict before accepting a match.
    pub liveness_detection: bool,
    /// Seconds before an unresolved recognition call counts as an error.
    pub recognition_timeout_secs: u64,
    pub presence_period_ms: u64,
    pub recognition_period_ms: u64,
    pub cooldown_ms: u64,
    /// Upper bound passed to the recognition service; not enforced locally.
    pub max_faces_per_frame: u32,
    pub heuristic: HeuristicConfig,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            liveness_detection: true,
            recognition_timeout_secs: 5,
            presence_period_ms: 300,
            recognition_period_ms: 3000,
            cooldown_ms: 4000,
            max_faces_per_frame: 3,
            heuristic: HeuristicConfig::default(),
        }
    }
}

impl KioskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.5..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::ConfidenceThreshold(self.confidence_threshold));
        }
        if self.recognition_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("recognition_timeout_secs"));
        }
        if self.presence_period_ms == 0 {
            return Err(ConfigError::ZeroDuration("presence_period_ms"));
        }
        if self.recognition_period_ms == 0 {
            return Err(ConfigError::ZeroDuration("recognition_period_ms"));
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::ZeroDuration("cooldown_ms"));
        }
        if self.max_faces_per_frame == 0 {
            return Err(ConfigError::MaxFaces);
        }
        let roi = self.heuristic.roi_fraction;
        if !(roi > 0.0 && roi <= 1.0) {
            return Err(ConfigError::RoiFraction(roi));
        }
        Ok(())
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs)
    }

    pub fn presence_period(&self) -> Duration {
        Duration::from_millis(self.presence_period_ms)
    }

    pub fn recognition_period(&self) -> Duration {
        Duration::from_millis(self.recognition_period_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}
