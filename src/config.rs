//! Operator configuration read from the environment
//!
//! Every setting has a default; durations use `humantime` syntax (`90s`,
//! `10m`, `1h 30m`).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::controller::BackoffConfig;
use crate::controller::remediation::{DEFAULT_REASONS, RemediationConfig};

/// Upper bound for the resync period
pub const MAX_RESYNC_PERIOD: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("RESYNC_PERIOD {0:?} exceeds the maximum of 30m")]
    ResyncTooLong(Duration),
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches every namespace
    pub watch_namespace: Option<String>,
    pub workers: usize,
    pub resync_period: Duration,
    pub reconcile_timeout: Duration,
    pub queue_capacity: usize,
    pub remediation: RemediationConfig,
    pub backoff: BackoffConfig,
    pub health_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            workers: 3,
            resync_period: Duration::from_secs(10 * 60),
            reconcile_timeout: Duration::from_secs(120),
            queue_capacity: 4096,
            remediation: RemediationConfig::default(),
            backoff: BackoffConfig::default(),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

fn parse_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_count(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

impl OperatorConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to resolve variables; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.watch_namespace = get("WATCH_NAMESPACE");
        if let Some(v) = get("WORKERS") {
            config.workers = parse_count("WORKERS", &v)?;
        }
        if let Some(v) = get("RESYNC_PERIOD") {
            config.resync_period = parse_duration("RESYNC_PERIOD", &v)?;
        }
        if config.resync_period > MAX_RESYNC_PERIOD {
            return Err(ConfigError::ResyncTooLong(config.resync_period));
        }
        if let Some(v) = get("RECONCILE_TIMEOUT") {
            config.reconcile_timeout = parse_duration("RECONCILE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("QUEUE_CAPACITY") {
            config.queue_capacity = parse_count("QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("REMEDIATION_REASONS") {
            let reasons: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            config.remediation.reasons = if reasons.is_empty() {
                DEFAULT_REASONS.iter().map(|r| r.to_string()).collect()
            } else {
                reasons
            };
        }
        if let Some(v) = get("REMEDIATION_BACKOFF") {
            config.remediation.backoff = parse_duration("REMEDIATION_BACKOFF", &v)?;
        }

        let initial = match get("BACKOFF_INITIAL") {
            Some(v) => parse_duration("BACKOFF_INITIAL", &v)?,
            None => config.backoff.initial_delay,
        };
        let max = match get("BACKOFF_MAX") {
            Some(v) => parse_duration("BACKOFF_MAX", &v)?,
            None => config.backoff.max_delay,
        };
        if max < initial {
            return Err(ConfigError::Invalid {
                var: "BACKOFF_MAX",
                value: humantime::format_duration(max).to_string(),
                reason: "must not be below BACKOFF_INITIAL".to_string(),
            });
        }
        config.backoff = BackoffConfig::new(initial, max);

        if let Some(v) = get("HEALTH_ADDR") {
            config.health_addr = v.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    var: "HEALTH_ADDR",
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(config)
    }
}
