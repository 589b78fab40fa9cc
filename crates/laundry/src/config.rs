//! Pool configuration.

use std::str::FromStr;
use std::time::Duration;

/// Longest wait-list TTL accepted by [`PoolConfig::validate`].
pub const MAX_RESERVATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of machines, fixed at startup.
    pub machines: u32,
    /// Duration used when a request omits one, and for promotions.
    pub default_duration_minutes: u32,
    pub reservation_ttl: Duration,
    /// How often the background monitor sweeps for finished washes.
    pub poll_interval: Duration,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            machines: 3,
            default_duration_minutes: 30,
            reservation_ttl: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(10),
            min_duration_minutes: 1,
            max_duration_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("pool needs at least one machine")]
    NoMachines,
    #[error("duration bounds {min}..={max} are invalid")]
    DurationBounds { min: u32, max: u32 },
    #[error("default duration {default} is outside {min}..={max}")]
    DefaultOutOfBounds { default: u32, min: u32, max: u32 },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("reservation TTL of {secs}s exceeds the {max_secs}s maximum")]
    TtlTooLong { secs: u64, max_secs: u64 },
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}

impl PoolConfig {
    /// Defaults overridden by `LAUNDRY_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            machines: env_or("LAUNDRY_MACHINES", defaults.machines),
            default_duration_minutes: env_or(
                "LAUNDRY_DEFAULT_DURATION_MINUTES",
                defaults.default_duration_minutes,
            ),
            reservation_ttl: Duration::from_secs(env_or(
                "LAUNDRY_RESERVATION_TTL_SECS",
                defaults.reservation_ttl.as_secs(),
            )),
            poll_interval: Duration::from_secs(env_or(
                "LAUNDRY_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            min_duration_minutes: env_or(
                "LAUNDRY_MIN_DURATION_MINUTES",
                defaults.min_duration_minutes,
            ),
            max_duration_minutes: env_or(
                "LAUNDRY_MAX_DURATION_MINUTES",
                defaults.max_duration_minutes,
            ),
        }
    }

    pub fn with_machines(mut self, machines: u32) -> Self {
        self.machines = machines;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machines == 0 {
            return Err(ConfigError::NoMachines);
        }
        if self.min_duration_minutes == 0 || self.min_duration_minutes > self.max_duration_minutes
        {
            return Err(ConfigError::DurationBounds {
                min: self.min_duration_minutes,
                max: self.max_duration_minutes,
            });
        }
        if !(self.min_duration_minutes..=self.max_duration_minutes)
            .contains(&self.default_duration_minutes)
        {
            return Err(ConfigError::DefaultOutOfBounds {
                default: self.default_duration_minutes,
                min: self.min_duration_minutes,
                max: self.max_duration_minutes,
            });
        }
        if self.reservation_ttl.is_zero() {
            return Err(ConfigError::ZeroInterval("reservation TTL"));
        }
        if self.reservation_ttl > MAX_RESERVATION_TTL {
            return Err(ConfigError::TtlTooLong {
                secs: self.reservation_ttl.as_secs(),
                max_secs: MAX_RESERVATION_TTL.as_secs(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("poll interval"));
        }
        Ok(())
    }

    pub(crate) fn reservation_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reservation_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = PoolConfig::default();
        assert_eq!(config.machines, 3);
        assert_eq!(config.default_duration_minutes, 30);
        assert_eq!(config.reservation_ttl, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(
            (config.min_duration_minutes, config.max_duration_minutes),
            (1, 120)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_pool() {
        let config = PoolConfig::default().with_machines(0);
        assert_eq!(config.validate(), Err(ConfigError::NoMachines));
    }

    #[test]
    fn validate_rejects_default_outside_bounds() {
        let config = PoolConfig {
            default_duration_minutes: 200,
            ..PoolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DefaultOutOfBounds { default: 200, .. })
        ));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let config = PoolConfig {
            min_duration_minutes: 60,
            max_duration_minutes: 10,
            ..PoolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationBounds { min: 60, max: 10 })
        ));
    }

    #[test]
    fn validate_rejects_oversized_ttl() {
        let config = PoolConfig {
            reservation_ttl: Duration::from_secs(u64::MAX),
            ..PoolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TtlTooLong { max_secs: 86_400, .. })
        ));

        let config = PoolConfig {
            reservation_ttl: MAX_RESERVATION_TTL,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let config = PoolConfig {
            poll_interval: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("poll interval"))
        );
    }
}
