//! Node configuration.
//!
//! Deserialized from JSON with [`Config::parse`]; every tuning knob has a
//! default so a minimal file only names the local party and the peer
//! addresses.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::party::Party;

/// A malformed configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file is not valid JSON or is missing required fields.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A field value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration for one node.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Which of the three parties this node is.
    pub local_party: Party,
    /// Address this node listens on. Required for the data holders; the
    /// coordinator only dials out.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// Address of the first data holder, as seen from this node.
    #[serde(default)]
    pub db1: Option<SocketAddr>,
    /// Address of the second data holder, as seen from this node.
    #[serde(default)]
    pub db2: Option<SocketAddr>,
    /// Decimal scale used for intermediate arithmetic.
    #[serde(default = "default_calculation_scale")]
    pub calculation_scale: u32,
    /// Decimal scale of published results.
    #[serde(default = "default_result_scale")]
    pub result_scale: u32,
    /// Write buffer capacity per connection, in bytes.
    #[serde(default = "default_output_buffer")]
    pub channel_output_buffer_limit: usize,
    /// Rows or ring elements per wire batch.
    #[serde(default = "default_row_batch_size")]
    pub row_batch_size: usize,
    /// Capacity of the bounded queues between handlers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Idle connections kept per remote party.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Seconds between zombie sweeps. Zero disables the watchdog.
    #[serde(default = "default_zombie_cooldown")]
    pub zombie_check_cooldown: u64,
    /// Sweeps a query must sit idle through before it is aborted.
    #[serde(default = "default_zombie_threshold")]
    pub zombie_check_threshold: u32,
}

fn default_calculation_scale() -> u32 {
    12
}

fn default_result_scale() -> u32 {
    4
}

fn default_output_buffer() -> usize {
    1 << 16
}

fn default_row_batch_size() -> usize {
    1 << 10
}

fn default_queue_capacity() -> usize {
    16
}

fn default_pool_capacity() -> usize {
    4
}

fn default_zombie_cooldown() -> u64 {
    60
}

fn default_zombie_threshold() -> u32 {
    10
}

impl Config {
    /// Parses and validates a JSON configuration.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.local_party.is_db() && self.listen.is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} must set listen",
                self.local_party
            )));
        }
        if self.row_batch_size == 0 {
            return Err(ConfigError::Invalid("row_batch_size must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be > 0".into()));
        }
        // The coordinator holds an S1, S2 and S3 connection per holder for
        // the whole query, so a smaller pool can never finish a checkout.
        if self.local_party == Party::Ph && self.pool_capacity < 3 {
            return Err(ConfigError::Invalid(
                "the coordinator needs pool_capacity >= 3, one per query stream".into(),
            ));
        }
        if self.calculation_scale < self.result_scale {
            return Err(ConfigError::Invalid(
                "calculation_scale must be >= result_scale".into(),
            ));
        }
        Ok(())
    }

    /// Address of `party`, which must be a data holder this node dials.
    pub fn address_of(&self, party: Party) -> Result<SocketAddr, ConfigError> {
        let addr = match party {
            Party::Db1 => self.db1,
            Party::Db2 => self.db2,
            Party::Ph => None,
        };
        addr.ok_or_else(|| ConfigError::Invalid(format!("no address configured for {party}")))
    }

    /// The interval between zombie sweeps, or `None` when disabled.
    pub fn zombie_interval(&self) -> Option<Duration> {
        (self.zombie_check_cooldown > 0).then(|| Duration::from_secs(self.zombie_check_cooldown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_db_config() {
        let config = Config::parse(
            r#"{"local_party": "db1", "listen": "127.0.0.1:4401", "db2": "127.0.0.1:4402"}"#,
        )
        .unwrap();
        assert_eq!(config.local_party, Party::Db1);
        assert_eq!(config.calculation_scale, 12);
        assert_eq!(config.result_scale, 4);
        assert_eq!(
            config.address_of(Party::Db2).unwrap(),
            "127.0.0.1:4402".parse().unwrap()
        );
        assert!(config.address_of(Party::Db1).is_err());
        assert!(config.zombie_interval().is_some());
    }

    #[test]
    fn db_without_listen_is_rejected() {
        assert!(Config::parse(r#"{"local_party": "db2"}"#).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(
            Config::parse(r#"{"local_party": "ph", "db1": "1.2.3.4:1", "db2": "1.2.3.4:2", "bogus": 1}"#)
                .is_err()
        );
    }

    #[test]
    fn zero_capacities_are_rejected() {
        assert!(
            Config::parse(r#"{"local_party": "ph", "queue_capacity": 0}"#).is_err()
        );
    }

    #[test]
    fn coordinator_pool_must_fit_its_three_streams() {
        assert!(
            Config::parse(r#"{"local_party": "ph", "pool_capacity": 2}"#).is_err()
        );
        // Holders only serve inbound connections; small pools are fine there.
        let config = Config::parse(
            r#"{"local_party": "db1", "listen": "127.0.0.1:4401", "pool_capacity": 2}"#,
        )
        .unwrap();
        assert_eq!(config.pool_capacity, 2);
    }
}
