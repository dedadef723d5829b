use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tick_interval_ms: u64,
    pub min_increment: f64, // percentage points per tick
    pub max_increment: f64,
    pub history_enabled: bool,
    pub event_capacity: usize,
    /// Fixed RNG seed for reproducible simulations
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            min_increment: 1.0,
            max_increment: 6.0,
            history_enabled: true,
            event_capacity: 256,
            seed: None,
        }
    }
}

impl Config {
    /// Read a JSON config file; missing keys fall back to defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.tick_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "tick_interval_ms must be positive".into(),
            ));
        }
        if !self.min_increment.is_finite() || !self.max_increment.is_finite() {
            return Err(EngineError::InvalidConfig(
                "increments must be finite".into(),
            ));
        }
        // An increment of 100 or more would let a Queued entry complete on its first tick.
        if !(self.min_increment > 0.0
            && self.min_increment <= self.max_increment
            && self.max_increment < 100.0)
        {
            return Err(EngineError::InvalidConfig(format!(
                "increments must satisfy 0 < min <= max < 100, got {}..={}",
                self.min_increment, self.max_increment
            )));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "event_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_bad_increments() {
        let mut config = Config::default();
        config.min_increment = 0.0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        config.min_increment = 8.0;
        config.max_increment = 4.0;
        assert!(config.validate().is_err());

        config.min_increment = 1.0;
        config.max_increment = 100.0;
        assert!(config.validate().is_err());

        config.max_increment = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = Config {
            tick_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "tick_interval_ms": 250, "seed": 42 }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.max_increment, 6.0);
        assert!(config.history_enabled);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "min_increment": -3.0 }}"#).unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(EngineError::InvalidConfig(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(Config::load(file.path()), Err(EngineError::Json(_))));
    }
}
