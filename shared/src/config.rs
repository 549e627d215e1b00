use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DEBOUNCE_MS: u64 = 350;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const COORDINATE_CACHE_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration is not valid JSON: {0}")]
    Parse(String),
}

/// Tuning knobs for the discovery engine.
///
/// Batch size and inter-batch delay are operational settings tuned against
/// upstream rate limits, not semantic contracts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub debounce_ms: u64,
    pub page_size: u32,
    pub include_inactive: bool,
    pub coordinate_cache_ttl_ms: u64,
    pub session_cache_capacity: usize,
    pub distance_rounding_decimals: u32,
    pub relocation_threshold_km: f64,
    pub resolver_call_timeout_ms: u64,
    pub travel_call_timeout_ms: u64,
    pub travel_batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub description_prefix_words: usize,
    pub description_key_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            page_size: DEFAULT_PAGE_SIZE,
            include_inactive: false,
            coordinate_cache_ttl_ms: COORDINATE_CACHE_TTL_MS,
            session_cache_capacity: 512,
            distance_rounding_decimals: 4,
            relocation_threshold_km: 0.5,
            resolver_call_timeout_ms: 5_000,
            travel_call_timeout_ms: 8_000,
            travel_batch_size: 5,
            inter_batch_delay_ms: 300,
            description_prefix_words: 5,
            description_key_chars: 32,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be > 0".into()));
        }
        if self.travel_batch_size == 0 {
            return Err(ConfigError::Invalid("travel_batch_size must be > 0".into()));
        }
        if self.session_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session_cache_capacity must be > 0".into(),
            ));
        }
        if self.distance_rounding_decimals > 8 {
            return Err(ConfigError::Invalid(
                "distance_rounding_decimals must be <= 8".into(),
            ));
        }
        if !self.relocation_threshold_km.is_finite() || self.relocation_threshold_km < 0.0 {
            return Err(ConfigError::Invalid(
                "relocation_threshold_km must be a non-negative number".into(),
            ));
        }
        if self.resolver_call_timeout_ms == 0 || self.travel_call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("call timeouts must be > 0".into()));
        }
        if self.description_prefix_words == 0 {
            return Err(ConfigError::Invalid(
                "description_prefix_words must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resolver_call_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver_call_timeout_ms)
    }

    pub fn travel_call_timeout(&self) -> Duration {
        Duration::from_millis(self.travel_call_timeout_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = EngineConfig {
            travel_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_threshold() {
        let config = EngineConfig {
            relocation_threshold_km: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"debounce_ms": 200, "travel_batch_size": 3}"#)
            .unwrap();
        assert_eq!(config.debounce_ms, 200);
        assert_eq!(config.travel_batch_size, 3);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"page_size": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }
}
