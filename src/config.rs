//! Configuration for counter tables
//!
//! Settings come from a TOML document, from environment variables, or from
//! `Default`:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | COUNTERS_LEASE_SECS | 86400 | Mutator lease duration |
//! | COUNTERS_SAFETY_MARGIN_SECS | 3600 | Lease time kept in reserve before expiry |
//! | COUNTERS_GRACE_SECS | 3600 | Delay after expiry before a shard is collectable |
//! | COUNTERS_GC_ENABLED | true | Collect expired shards during reads |
//! | COUNTERS_KINDS | sum,min,max,approx_distinct | Tables a service exposes |

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::counter::CounterKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Counter kinds a `CounterService` creates tables for
    pub kinds: Vec<CounterKind>,
    pub lease: LeaseConfig,
    pub gc: GcConfig,
}

impl Default for CounterConfig {
    fn default() -> Self {
        CounterConfig {
            kinds: vec![
                CounterKind::ApproxDistinct,
                CounterKind::Sum,
                CounterKind::Min,
                CounterKind::Max,
            ],
            lease: LeaseConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl CounterConfig {
    /// Configuration for tests: every kind, collection enabled
    pub fn test() -> Self {
        CounterConfig {
            kinds: CounterKind::ALL.to_vec(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: CounterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = CounterConfig::default();
        if let Some(secs) = env_u64("COUNTERS_LEASE_SECS")? {
            config.lease.lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("COUNTERS_SAFETY_MARGIN_SECS")? {
            config.lease.safety_margin = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("COUNTERS_GRACE_SECS")? {
            config.lease.grace_period = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("COUNTERS_GC_ENABLED") {
            config.gc.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("COUNTERS_KINDS") {
            config.kinds = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().map_err(ConfigError::Invalid))
                .collect::<Result<_, _>>()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lease.validate()
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{} must be an integer, got {:?}", name, v))),
        Err(_) => Ok(None),
    }
}

/// Mutator lease timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a new mutator may write its shard (default: 24h)
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,
    /// A mutator stops writing this long before its lease ends (default: 1h)
    #[serde(with = "duration_millis")]
    pub safety_margin: Duration,
    /// Extra delay after expiry before a shard is collectable (default: 1h)
    #[serde(with = "duration_millis")]
    pub grace_period: Duration,
    /// Expiry timestamps are rounded to this boundary (default: 1 minute)
    #[serde(with = "duration_millis")]
    pub expiry_granularity: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            lease_duration: Duration::from_secs(24 * 3600),
            safety_margin: Duration::from_secs(3600),
            grace_period: Duration::from_secs(3600),
            expiry_granularity: Duration::from_secs(60),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety_margin.is_zero() {
            return Err(ConfigError::Invalid("safety_margin must be positive".into()));
        }
        if self.expiry_granularity.is_zero() {
            return Err(ConfigError::Invalid(
                "expiry_granularity must be positive".into(),
            ));
        }
        // Rounding may pull the expiry back by half a granularity step.
        if self.safety_margin + self.expiry_granularity / 2 >= self.lease_duration {
            return Err(ConfigError::Invalid(format!(
                "safety_margin ({:?}) must be shorter than lease_duration ({:?})",
                self.safety_margin, self.lease_duration
            )));
        }
        Ok(())
    }
}

/// Garbage collection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Collect expired shards as a side effect of reads
    pub enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig { enabled: true }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
