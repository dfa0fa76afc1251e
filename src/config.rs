//! Configuration management for Ratekeeper.
//!
//! Configuration is plain data: it is deserialized from YAML (or layered from
//! a file plus `RATEKEEPER__*` environment variables) and only validated when
//! an engine or store is built from it.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{
    FixedWindowEngine, KeyedStateStore, LeakyBucketEngine, SlidingWindowCounterEngine,
    SlidingWindowLogEngine, Strategy, TokenBucketEngine,
};

/// Prefix for environment overrides, e.g. `RATEKEEPER__STORE__SHARDS=64`.
const ENV_PREFIX: &str = "RATEKEEPER";

/// Top-level configuration: shared store settings plus named policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Store configuration shared by every policy
    #[serde(default)]
    pub store: StoreConfig,

    /// Map of policy name to algorithm configuration
    #[serde(default)]
    pub policies: BTreeMap<String, AlgorithmConfig>,
}

/// Configuration for a single limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Admission algorithm and its parameters
    pub algorithm: AlgorithmConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Algorithm selection and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    FixedWindow { window_secs: f64, max_requests: u64 },
    SlidingLog { window_secs: f64, max_requests: u64 },
    SlidingCounter { window_secs: f64, max_requests: u64 },
    TokenBucket { capacity: u64, refill_rate: f64 },
    LeakyBucket { leak_rate: f64, queue_capacity: u64 },
}

/// Key-state store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of map shards; a power of two. Defaults to the map's own choice.
    #[serde(default)]
    pub shards: Option<usize>,

    /// Evict keys idle for this many seconds. Disabled when unset.
    #[serde(default)]
    pub idle_timeout_secs: Option<f64>,

    /// Seconds between idle eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: None,
            idle_timeout_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> f64 {
    60.0
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| {
        RatekeeperError::invalid(format!("{} is not a valid duration ({}): {}", field, value, e))
    })
}

impl AlgorithmConfig {
    /// Validate and build the configured engine.
    pub fn build(&self) -> Result<Strategy> {
        let strategy = match *self {
            AlgorithmConfig::FixedWindow {
                window_secs,
                max_requests,
            } => FixedWindowEngine::new(seconds("window_secs", window_secs)?, max_requests)?.into(),
            AlgorithmConfig::SlidingLog {
                window_secs,
                max_requests,
            } => SlidingWindowLogEngine::new(seconds("window_secs", window_secs)?, max_requests)?
                .into(),
            AlgorithmConfig::SlidingCounter {
                window_secs,
                max_requests,
            } => SlidingWindowCounterEngine::new(
                seconds("window_secs", window_secs)?,
                max_requests,
            )?
            .into(),
            AlgorithmConfig::TokenBucket {
                capacity,
                refill_rate,
            } => TokenBucketEngine::new(capacity, refill_rate)?.into(),
            AlgorithmConfig::LeakyBucket {
                leak_rate,
                queue_capacity,
            } => LeakyBucketEngine::new(leak_rate, queue_capacity)?.into(),
        };
        Ok(strategy)
    }
}

impl StoreConfig {
    /// Idle timeout, if eviction is enabled.
    pub fn idle_timeout(&self) -> Result<Option<Duration>> {
        self.idle_timeout_secs
            .map(|secs| seconds("idle_timeout_secs", secs))
            .transpose()
    }

    /// Interval between eviction sweeps.
    pub fn sweep_interval(&self) -> Result<Duration> {
        let interval = seconds("sweep_interval_secs", self.sweep_interval_secs)?;
        if interval.is_zero() {
            return Err(RatekeeperError::invalid(
                "sweep_interval_secs must be greater than 0",
            ));
        }
        Ok(interval)
    }

    /// Build an empty store with the configured sharding.
    pub fn build_store<S: Send + 'static>(&self) -> Result<KeyedStateStore<S>> {
        match self.shards {
            Some(shards) => KeyedStateStore::with_shards(shards),
            None => Ok(KeyedStateStore::new()),
        }
    }
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            RatekeeperError::invalid(format!("Failed to parse rate limit config: {}", e))
        })
    }

    /// Load configuration from `path`, overridden by `RATEKEEPER__*`
    /// environment variables (`__` separates nested keys).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading layered rate limit configuration");

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

impl LimiterConfig {
    /// Load a single limiter configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            RatekeeperError::invalid(format!("Failed to parse limiter config: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Engine;
    use parking_lot::Mutex;

    /// Held by tests that read or write `RATEKEEPER__*` variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_limiter_config() {
        let yaml = r#"
algorithm:
  type: token_bucket
  capacity: 100
  refill_rate: 10
store:
  shards: 64
  idle_timeout_secs: 300
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.algorithm,
            AlgorithmConfig::TokenBucket {
                capacity: 100,
                refill_rate: 10.0
            }
        );
        assert_eq!(config.store.shards, Some(64));
        assert_eq!(
            config.store.idle_timeout().unwrap(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.store.sweep_interval().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_policies() {
        let yaml = r#"
policies:
  api:
    type: sliding_counter
    window_secs: 60
    max_requests: 1000
  login:
    type: fixed_window
    window_secs: 300
    max_requests: 5
  egress:
    type: leaky_bucket
    leak_rate: 2.5
    queue_capacity: 20
"#;
        let config = RatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policies.len(), 3);
        assert_eq!(config.store, StoreConfig::default());
        assert_eq!(
            config.policies["login"],
            AlgorithmConfig::FixedWindow {
                window_secs: 300.0,
                max_requests: 5
            }
        );
    }

    #[test]
    fn test_build_each_algorithm() {
        let cases = [
            (
                AlgorithmConfig::FixedWindow {
                    window_secs: 1.0,
                    max_requests: 1,
                },
                "fixed_window",
            ),
            (
                AlgorithmConfig::SlidingLog {
                    window_secs: 1.0,
                    max_requests: 1,
                },
                "sliding_log",
            ),
            (
                AlgorithmConfig::SlidingCounter {
                    window_secs: 0.5,
                    max_requests: 1,
                },
                "sliding_counter",
            ),
            (
                AlgorithmConfig::TokenBucket {
                    capacity: 1,
                    refill_rate: 0.1,
                },
                "token_bucket",
            ),
            (
                AlgorithmConfig::LeakyBucket {
                    leak_rate: 3.0,
                    queue_capacity: 1,
                },
                "leaky_bucket",
            ),
        ];
        for (config, name) in cases {
            assert_eq!(config.build().unwrap().name(), name);
        }
    }

    #[test]
    fn test_invalid_values_fail_at_build() {
        let invalid = [
            AlgorithmConfig::FixedWindow {
                window_secs: 0.0,
                max_requests: 1,
            },
            AlgorithmConfig::SlidingLog {
                window_secs: -5.0,
                max_requests: 1,
            },
            AlgorithmConfig::SlidingCounter {
                window_secs: 10.0,
                max_requests: 0,
            },
            AlgorithmConfig::TokenBucket {
                capacity: 10,
                refill_rate: 0.0,
            },
            AlgorithmConfig::LeakyBucket {
                leak_rate: f64::NAN,
                queue_capacity: 1,
            },
        ];
        for config in invalid {
            let err = config.build().unwrap_err();
            assert!(
                matches!(err, RatekeeperError::InvalidConfiguration(_)),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_store_config_validation() {
        let store = StoreConfig {
            shards: Some(6),
            ..StoreConfig::default()
        };
        assert!(store.build_store::<u64>().is_err());

        let store = StoreConfig {
            sweep_interval_secs: 0.0,
            ..StoreConfig::default()
        };
        assert!(store.sweep_interval().is_err());

        let store = StoreConfig {
            idle_timeout_secs: Some(-1.0),
            ..StoreConfig::default()
        };
        assert!(store.idle_timeout().is_err());
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let yaml = r#"
algorithm:
  type: gcra
  rate: 10
"#;
        assert!(LimiterConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file_and_layered_load() {
        let path = std::env::temp_dir().join(format!(
            "ratekeeper-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "policies:\n  api:\n    type: token_bucket\n    capacity: 10\n    refill_rate: 1.0\n",
        )
        .unwrap();

        let from_file = RatekeeperConfig::from_file(&path).unwrap();
        let layered = {
            let _env = ENV_LOCK.lock();
            RatekeeperConfig::load(&path).unwrap()
        };
        std::fs::remove_file(&path).unwrap();

        assert_eq!(from_file, layered);
        assert_eq!(
            layered.policies["api"],
            AlgorithmConfig::TokenBucket {
                capacity: 10,
                refill_rate: 1.0
            }
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = std::env::temp_dir().join(format!(
            "ratekeeper-env-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "policies:\n  api:\n    type: token_bucket\n    capacity: 10\n    refill_rate: 1.0\n",
        )
        .unwrap();

        let _env = ENV_LOCK.lock();
        std::env::set_var("RATEKEEPER__STORE__SHARDS", "64");
        std::env::set_var("RATEKEEPER__POLICIES__API__CAPACITY", "20");
        let layered = RatekeeperConfig::load(&path);
        std::env::remove_var("RATEKEEPER__STORE__SHARDS");
        std::env::remove_var("RATEKEEPER__POLICIES__API__CAPACITY");
        std::fs::remove_file(&path).unwrap();

        let layered = layered.unwrap();
        assert_eq!(layered.store.shards, Some(64));
        assert_eq!(
            layered.policies["api"],
            AlgorithmConfig::TokenBucket {
                capacity: 20,
                refill_rate: 1.0
            }
        );
        assert!(layered.store.build_store::<u64>().is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RatekeeperConfig::from_file("/nonexistent/ratekeeper.yaml").unwrap_err();
        assert!(matches!(err, RatekeeperError::Io(_)));
    }
}
