//! Configuration management for the node.

use mdib_engine::config::var_or;
use mdib_engine::{ConsumerConfig, ProviderConfig};

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of replicating consumers
    pub consumers: usize,
    /// Interval between provider ticks
    pub tick_ms: u64,
    /// Ticks to run before verifying the replicas
    pub ticks: u64,
    /// Publish every n-th tick's reports twice; 0 disables
    pub duplicate_every: u64,
    /// Restart the provider under a new instance id at this tick; 0 disables
    pub restart_at: u64,
    pub provider: ProviderConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let consumers = var_or("NODE_CONSUMERS", 3usize)?;
        if consumers == 0 {
            return Err(ConfigError::NoConsumers);
        }

        let tick_ms = var_or("NODE_TICK_MS", 50)?;
        if tick_ms == 0 {
            return Err(ConfigError::ZeroTick);
        }

        Ok(Self {
            consumers,
            tick_ms,
            ticks: var_or("NODE_TICKS", 100)?,
            duplicate_every: var_or("NODE_DUPLICATE_EVERY", 7)?,
            restart_at: var_or("NODE_RESTART_AT", 0)?,
            provider: ProviderConfig::from_env()?,
            consumer: ConsumerConfig::from_env()?,
        })
    }

    pub fn duplicates(&self, tick: u64) -> bool {
        self.duplicate_every > 0 && tick % self.duplicate_every == 0
    }

    pub fn restarts(&self, tick: u64) -> bool {
        self.restart_at > 0 && tick == self.restart_at
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Engine(#[from] mdib_engine::ConfigError),

    #[error("NODE_CONSUMERS must be at least 1")]
    NoConsumers,

    #[error("NODE_TICK_MS must be greater than zero")]
    ZeroTick,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            consumers: 2,
            tick_ms: 1,
            ticks: 30,
            duplicate_every: 5,
            restart_at: 12,
            provider: ProviderConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }

    #[test]
    fn duplicate_schedule() {
        let config = config();
        assert!(!config.duplicates(4));
        assert!(config.duplicates(5));
        assert!(config.duplicates(10));

        let off = Config {
            duplicate_every: 0,
            ..config
        };
        assert!(!off.duplicates(5));
    }

    #[test]
    fn restart_happens_once() {
        let config = config();
        assert!(config.restarts(12));
        assert!(!config.restarts(24));

        let off = Config {
            restart_at: 0,
            ..config
        };
        assert!(!off.restarts(0));
    }
}
