use envconfig::Envconfig;
use piper_common::config::{EnvMsDuration, StartPosition, StoreConfig};
use piper_common::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "POLL_INTERVAL_MS", default = "1000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub max_records_per_poll: usize,

    #[envconfig(default = "latest")]
    pub start_position: StartPosition,

    #[envconfig(default = "127.0.0.1:9103")]
    pub metrics_address: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub log_json: bool,

    #[envconfig(nested = true)]
    pub store: StoreConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.0.is_zero() {
            return Err(ConfigError::NotPositive {
                name: "POLL_INTERVAL_MS",
            });
        }
        if self.max_records_per_poll == 0 {
            return Err(ConfigError::NotPositive {
                name: "MAX_RECORDS_PER_POLL",
            });
        }
        Ok(())
    }
}
