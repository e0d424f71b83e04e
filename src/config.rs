//! Tracker configuration from environment variables

use std::env;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Variable is set but does not parse
    Invalid { key: &'static str, value: String },
    OutOfRange { key: &'static str, value: u64 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "{} has invalid value {:?}", key, value),
            ConfigError::OutOfRange { key, value } => write!(f, "{} out of range: {}", key, value),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the tracker and query binaries
///
/// Loaded from environment variables (after `dotenv`) with defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Durable store: systems, stations, measurements
    pub db_path: String,

    /// Raw snapshot store (separate file)
    pub raw_db_path: String,

    /// Directory of `.sql` migration files
    pub schema_dir: String,

    /// Seconds between feed polls
    pub query_interval_secs: u64,

    /// Minutes between merge cycles
    pub update_interval_mins: u64,

    /// Local hour (0-23) at which station lists are refreshed
    pub station_check_hour: u32,

    pub feed_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db_path: "data/bikeflow.db".to_string(),
            raw_db_path: "data/bikeflow-raw.db".to_string(),
            schema_dir: "sql".to_string(),
            query_interval_secs: 20,
            update_interval_mins: 20,
            station_check_hour: 4,
            feed_timeout_secs: 30,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BIKEFLOW_DB_PATH` (default: data/bikeflow.db)
    /// - `BIKEFLOW_RAW_DB_PATH` (default: data/bikeflow-raw.db)
    /// - `BIKEFLOW_SCHEMA_DIR` (default: sql)
    /// - `QUERY_INTERVAL_SECS` (default: 20)
    /// - `UPDATE_INTERVAL_MINS` (default: 20)
    /// - `STATION_CHECK_HOUR` (default: 4)
    /// - `FEED_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their default
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            db_path: lookup("BIKEFLOW_DB_PATH").unwrap_or(defaults.db_path),
            raw_db_path: lookup("BIKEFLOW_RAW_DB_PATH").unwrap_or(defaults.raw_db_path),
            schema_dir: lookup("BIKEFLOW_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            query_interval_secs: parse_var(&lookup, "QUERY_INTERVAL_SECS", defaults.query_interval_secs)?,
            update_interval_mins: parse_var(&lookup, "UPDATE_INTERVAL_MINS", defaults.update_interval_mins)?,
            station_check_hour: parse_var(&lookup, "STATION_CHECK_HOUR", defaults.station_check_hour)?,
            feed_timeout_secs: parse_var(&lookup, "FEED_TIMEOUT_SECS", defaults.feed_timeout_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.query_interval_secs == 0 {
            return Err(ConfigError::OutOfRange { key: "QUERY_INTERVAL_SECS", value: 0 });
        }
        if self.update_interval_mins == 0 {
            return Err(ConfigError::OutOfRange { key: "UPDATE_INTERVAL_MINS", value: 0 });
        }
        if self.station_check_hour > 23 {
            return Err(ConfigError::OutOfRange {
                key: "STATION_CHECK_HOUR",
                value: u64::from(self.station_check_hour),
            });
        }
        Ok(())
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_mins * 60)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.query_interval(), Duration::from_secs(20));
        assert_eq!(config.update_interval(), Duration::from_secs(1200));
        assert_eq!(config.feed_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_custom_config() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("BIKEFLOW_DB_PATH", "/tmp/test.db"),
            ("QUERY_INTERVAL_SECS", "60"),
            ("STATION_CHECK_HOUR", " 12 "),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.query_interval_secs, 60);
        assert_eq!(config.station_check_hour, 12);
        assert_eq!(config.raw_db_path, "data/bikeflow-raw.db");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = TrackerConfig::from_lookup(lookup_from(&[("UPDATE_INTERVAL_MINS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "UPDATE_INTERVAL_MINS",
                value: "soon".to_string()
            }
        );

        let err = TrackerConfig::from_lookup(lookup_from(&[("STATION_CHECK_HOUR", "24")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "STATION_CHECK_HOUR", .. }));
    }
}
