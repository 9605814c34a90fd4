//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::monitor::DEFAULT_SCHEDULE_MARGIN_MS;
use crate::time::Millis;

/// Runtime configuration for [`MonitorEngine`](crate::MonitorEngine).
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timer entries are popped this many ms before their key to absorb jitter.
    pub schedule_margin_ms: Millis,
    /// Max queued messages for the serializing condition context.
    pub context_queue_capacity: usize,
    /// How often the context sweeps expired condition monitors.
    pub expiry_sweep_interval_ms: u64,
    /// Re-check period for threshold leaves that do not give one.
    pub default_threshold_period_ms: Millis,
    /// A sample request not answered within this many ms is issued again.
    pub sample_retry_ms: Millis,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_margin_ms: DEFAULT_SCHEDULE_MARGIN_MS,
            context_queue_capacity: 1024,
            expiry_sweep_interval_ms: 50,
            default_threshold_period_ms: 1000,
            sample_retry_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for malformed JSON or values out of range.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid config json: {e}"),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schedule_margin_ms < 0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!("schedule_margin_ms must not be negative, got {}", self.schedule_margin_ms),
            });
        }
        if self.default_threshold_period_ms <= 0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "default_threshold_period_ms must be positive, got {}",
                    self.default_threshold_period_ms
                ),
            });
        }
        if self.sample_retry_ms <= 0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!("sample_retry_ms must be positive, got {}", self.sample_retry_ms),
            });
        }
        if self.expiry_sweep_interval_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "expiry_sweep_interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}
