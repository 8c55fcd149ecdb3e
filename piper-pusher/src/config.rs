use std::net::SocketAddr;

use envconfig::Envconfig;
use piper_common::config::{EnvMsDuration, StoreConfig};
use piper_common::error::ConfigError;
use piper_common::retry::RetryPolicy;

use crate::batcher::BatcherConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:2003")]
    pub address: SocketAddr,

    #[envconfig(default = "51200")]
    pub max_batch_bytes: usize, // Per-record ceiling of the store, 50KiB

    #[envconfig(from = "MIN_FLUSH_INTERVAL_MS", default = "10000")]
    pub min_flush_interval: EnvMsDuration,

    #[envconfig(from = "MAX_FLUSH_INTERVAL_MS", default = "10000")]
    pub max_flush_interval: EnvMsDuration,

    #[envconfig(from = "IDLE_POLL_INTERVAL_MS", default = "1000")]
    pub idle_poll_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub queue_capacity: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "127.0.0.1:9102")]
    pub metrics_address: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub log_json: bool,

    #[envconfig(nested = true)]
    pub store: StoreConfig,
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(default = "2")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "1000")]
    pub retry_initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS")]
    pub retry_maximum_interval: Option<EnvMsDuration>,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.retry_backoff_coefficient,
            self.retry_initial_interval.0,
            self.retry_maximum_interval.map(|d| d.0),
        )
    }
}

impl Config {
    /// Cross-field checks envconfig cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_bytes == 0 {
            return Err(ConfigError::NotPositive {
                name: "MAX_BATCH_BYTES",
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NotPositive {
                name: "QUEUE_CAPACITY",
            });
        }
        if self.retry_policy.max_retries == 0 {
            return Err(ConfigError::NotPositive {
                name: "MAX_RETRIES",
            });
        }
        if self.idle_poll_interval.0.is_zero() {
            return Err(ConfigError::NotPositive {
                name: "IDLE_POLL_INTERVAL_MS",
            });
        }
        if self.min_flush_interval.0 > self.max_flush_interval.0 {
            return Err(ConfigError::FlushWindow {
                min_ms: self.min_flush_interval.0.as_millis(),
                max_ms: self.max_flush_interval.0.as_millis(),
            });
        }
        Ok(())
    }

    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            max_batch_bytes: self.max_batch_bytes,
            min_flush_interval: self.min_flush_interval.0,
            max_flush_interval: self.max_flush_interval.0,
            idle_poll_interval: self.idle_poll_interval.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn from_env(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).expect("invalid configuration")
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = from_env(&[]);

        assert_eq!(config.address, "127.0.0.1:2003".parse().unwrap());
        assert_eq!(config.max_batch_bytes, 51200);
        assert_eq!(config.min_flush_interval.0, Duration::from_secs(10));
        assert_eq!(config.max_flush_interval.0, Duration::from_secs(10));
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.retry_policy.provide(), RetryPolicy::default());
        assert_eq!(config.store.stream_name, "test");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn min_flush_interval_cannot_exceed_max() {
        let config = from_env(&[
            ("MIN_FLUSH_INTERVAL_MS", "20000"),
            ("MAX_FLUSH_INTERVAL_MS", "10000"),
        ]);

        assert_eq!(
            config.validate(),
            Err(ConfigError::FlushWindow {
                min_ms: 20000,
                max_ms: 10000
            })
        );
    }

    #[test]
    fn zero_retries_rejected() {
        let config = from_env(&[("MAX_RETRIES", "0")]);

        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                name: "MAX_RETRIES"
            })
        );
    }
}
