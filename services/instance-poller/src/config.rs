//! Configuration for the instance poller.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::aggregator::AggregatorConfig;
use crate::instance::InstanceId;
use crate::poller::PollIntervals;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    /// A machine entry is not `machine=instance`.
    #[error("invalid machine entry {0:?}, expected machine=instance")]
    InvalidMachine(String),
}

/// A machine and the instance backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineEntry {
    pub machine_id: String,
    pub instance_id: InstanceId,
}

/// Instance poller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Aggregator settings.
    pub aggregator: AggregatorConfig,

    /// Machine polling schedule.
    pub intervals: PollIntervals,

    /// Machines to poll.
    pub machines: Vec<MachineEntry>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let gather_window_ms = parse_var(&lookup, "POLLER_GATHER_WINDOW_MS", 3000u64)?;
        let mailbox_size = parse_var(&lookup, "POLLER_MAILBOX_SIZE", 1024usize)?;
        let short_poll_ms = parse_var(&lookup, "POLLER_SHORT_POLL_MS", 1000u64)?;
        let long_poll_secs = parse_var(&lookup, "POLLER_LONG_POLL_SECS", 900u64)?;

        let backoff = parse_var(&lookup, "POLLER_SHORT_POLL_BACKOFF", 2.0f64)?;
        if !backoff.is_finite() || backoff < 1.0 {
            return Err(ConfigError::InvalidValue {
                name: "POLLER_SHORT_POLL_BACKOFF",
                value: backoff.to_string(),
            });
        }

        let machines = match lookup("POLLER_MACHINES") {
            Some(raw) => parse_machines(&raw)?,
            None => Vec::new(),
        };

        let log_level = lookup("POLLER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            aggregator: AggregatorConfig {
                gather_window: Duration::from_millis(gather_window_ms),
                mailbox_size,
            },
            intervals: PollIntervals {
                short: Duration::from_millis(short_poll_ms),
                backoff,
                long: Duration::from_secs(long_poll_secs),
            },
            machines,
            log_level,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

/// Parse `machine=instance` pairs separated by commas.
fn parse_machines(raw: &str) -> Result<Vec<MachineEntry>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((machine, instance)) if !machine.is_empty() && !instance.is_empty() => {
                Ok(MachineEntry {
                    machine_id: machine.to_string(),
                    instance_id: InstanceId::from(instance),
                })
            }
            _ => Err(ConfigError::InvalidMachine(entry.to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.aggregator.gather_window, Duration::from_secs(3));
        assert_eq!(config.aggregator.mailbox_size, 1024);
        assert_eq!(config.intervals.short, Duration::from_secs(1));
        assert_eq!(config.intervals.long, Duration::from_secs(900));
        assert!(config.machines.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("POLLER_GATHER_WINDOW_MS", "10"),
            ("POLLER_SHORT_POLL_BACKOFF", "1.5"),
            ("POLLER_MACHINES", "0=i-abc, 1=i-def"),
        ])
        .unwrap();

        assert_eq!(config.aggregator.gather_window, Duration::from_millis(10));
        assert_eq!(config.intervals.backoff, 1.5);
        assert_eq!(
            config.machines,
            vec![
                MachineEntry {
                    machine_id: "0".to_string(),
                    instance_id: "i-abc".into(),
                },
                MachineEntry {
                    machine_id: "1".to_string(),
                    instance_id: "i-def".into(),
                },
            ]
        );
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("POLLER_GATHER_WINDOW_MS", "soon")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "POLLER_GATHER_WINDOW_MS",
                value: "soon".to_string(),
            }
        );
    }

    #[test]
    fn test_invalid_backoff() {
        assert!(load(&[("POLLER_SHORT_POLL_BACKOFF", "0.5")]).is_err());
        assert!(load(&[("POLLER_SHORT_POLL_BACKOFF", "inf")]).is_err());
    }

    #[test]
    fn test_huge_backoff_schedules_long_interval() {
        let config = load(&[("POLLER_SHORT_POLL_BACKOFF", "1e20")]).unwrap();
        let intervals = &config.intervals;
        assert_eq!(intervals.next(intervals.short, None), intervals.long);
    }

    #[test]
    fn test_invalid_machine_entry() {
        let err = load(&[("POLLER_MACHINES", "0=i-abc,broken")]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidMachine("broken".to_string()));
    }
}
