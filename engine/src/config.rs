//! Engine configuration, loadable from environment variables.

use std::env;
use std::str::FromStr;

/// Provider identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Fixed sequence id; a fresh `urn:uuid:` one is generated when `None`
    pub sequence_id: Option<String>,
    pub instance_id: Option<u64>,
}

impl ProviderConfig {
    /// Load from `MDIB_SEQUENCE_ID` and `MDIB_INSTANCE_ID`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sequence_id = env::var("MDIB_SEQUENCE_ID").ok().filter(|s| !s.is_empty());
        let instance_id = match env::var("MDIB_INSTANCE_ID") {
            Ok(raw) => Some(parse("MDIB_INSTANCE_ID", &raw)?),
            Err(_) => None,
        };
        Ok(Self {
            sequence_id,
            instance_id,
        })
    }
}

/// Consumer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Reports kept while a reload is in progress; the oldest is dropped on
    /// overflow
    pub max_buffered_reports: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_buffered_reports: 1024,
            event_capacity: 256,
        }
    }
}

impl ConsumerConfig {
    /// Load from `MDIB_MAX_BUFFERED_REPORTS` and `MDIB_EVENT_CAPACITY`,
    /// falling back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_buffered_reports: var_or("MDIB_MAX_BUFFERED_REPORTS", defaults.max_buffered_reports)?,
            event_capacity: var_or("MDIB_EVENT_CAPACITY", defaults.event_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffered_reports == 0 {
            return Err(ConfigError::Zero {
                name: "MDIB_MAX_BUFFERED_REPORTS",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero {
                name: "MDIB_EVENT_CAPACITY",
            });
        }
        Ok(())
    }
}

fn parse<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}

/// Parse an environment variable, or return `default` when it is unset.
pub fn var_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse(name, &raw),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.max_buffered_reports, 1024);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let config = ConsumerConfig {
            event_capacity: 0,
            ..ConsumerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero { .. })));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse::<u64>("X", " 12 "), Ok(12));
        assert_eq!(
            parse::<u64>("X", "twelve"),
            Err(ConfigError::InvalidValue {
                name: "X",
                value: "twelve".into()
            })
        );
    }

    #[test]
    fn unset_variable_uses_default() {
        assert_eq!(var_or("MDIB_TEST_SURELY_UNSET_VARIABLE", 7usize), Ok(7));
    }
}
