//! Scheduler configuration from environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use drover_execution_runtime::LeaseConfig;

const ENV_KEYS: [&str; 5] = [
    "DROVER_MAX_RETRIES",
    "DROVER_LEASE_TIMEOUT_SECS",
    "DROVER_CLEANUP_BATCH_SIZE",
    "DROVER_CLEANUP_INTERVAL_SECS",
    "DROVER_TICK_INTERVAL_MS",
];

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Attempts allowed per node action chain before a job fails.
    pub max_retries: u32,
    /// A lease held this long without progress is recovered by the sweeper.
    pub lease_timeout: Duration,
    /// Upper bound on expired clusters handled per sweep.
    pub cleanup_batch_size: usize,
    pub cleanup_interval: StdDuration,
    pub tick_interval: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            lease_timeout: Duration::minutes(10),
            cleanup_batch_size: 100,
            cleanup_interval: StdDuration::from_secs(60),
            tick_interval: StdDuration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, String> {
        let defaults = Self::default();

        let max_retries = parse_positive::<u32>(envs, "DROVER_MAX_RETRIES")?
            .unwrap_or(defaults.max_retries);
        let lease_timeout = match parse_positive::<i64>(envs, "DROVER_LEASE_TIMEOUT_SECS")? {
            Some(secs) => Duration::try_seconds(secs).ok_or_else(|| {
                format!("DROVER_LEASE_TIMEOUT_SECS='{}' is out of range", secs)
            })?,
            None => defaults.lease_timeout,
        };
        let cleanup_batch_size = parse_positive::<usize>(envs, "DROVER_CLEANUP_BATCH_SIZE")?
            .unwrap_or(defaults.cleanup_batch_size);
        let cleanup_interval = parse_positive::<u64>(envs, "DROVER_CLEANUP_INTERVAL_SECS")?
            .map(StdDuration::from_secs)
            .unwrap_or(defaults.cleanup_interval);
        let tick_interval = parse_positive::<u64>(envs, "DROVER_TICK_INTERVAL_MS")?
            .map(StdDuration::from_millis)
            .unwrap_or(defaults.tick_interval);

        Ok(Self {
            max_retries,
            lease_timeout,
            cleanup_batch_size,
            cleanup_interval,
            tick_interval,
        })
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            lease_timeout: self.lease_timeout,
        }
    }
}

fn parse_positive<T>(envs: &HashMap<String, String>, key: &str) -> Result<Option<T>, String>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = envs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let value = raw
        .parse::<T>()
        .map_err(|_| format!("invalid {}='{}'. expected a positive integer", key, raw))?;
    if value <= T::default() {
        return Err(format!("invalid {}='{}'. must be greater than zero", key, raw));
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_defaults() {
        let cfg = SchedulerConfig::from_env_map(&HashMap::new()).expect("defaults");
        assert_eq!(cfg, SchedulerConfig::default());
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.lease_config().lease_timeout, Duration::minutes(10));
    }

    #[test]
    fn parse_overrides() {
        let cfg = SchedulerConfig::from_env_map(&envs(&[
            ("DROVER_MAX_RETRIES", "5"),
            ("DROVER_LEASE_TIMEOUT_SECS", " 90 "),
            ("DROVER_CLEANUP_BATCH_SIZE", "7"),
            ("DROVER_CLEANUP_INTERVAL_SECS", "15"),
            ("DROVER_TICK_INTERVAL_MS", "250"),
        ]))
        .expect("overrides");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.lease_timeout, Duration::seconds(90));
        assert_eq!(cfg.cleanup_batch_size, 7);
        assert_eq!(cfg.cleanup_interval, StdDuration::from_secs(15));
        assert_eq!(cfg.tick_interval, StdDuration::from_millis(250));
    }

    #[test]
    fn parse_rejects_garbage_and_zero() {
        let err = SchedulerConfig::from_env_map(&envs(&[("DROVER_MAX_RETRIES", "three")]))
            .expect_err("non-numeric must fail");
        assert!(err.contains("DROVER_MAX_RETRIES"));

        let err = SchedulerConfig::from_env_map(&envs(&[("DROVER_LEASE_TIMEOUT_SECS", "0")]))
            .expect_err("zero must fail");
        assert!(err.contains("greater than zero"));
    }
}
