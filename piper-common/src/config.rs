use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// A duration read from the environment as a whole number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Kinesis,
    Kafka,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "kinesis" => Ok(StoreBackend::Kinesis),
            "kafka" => Ok(StoreBackend::Kafka),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Unknown store backend: {s}")),
        }
    }
}

/// Where a freshly acquired cursor points inside its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only records appended after the cursor was acquired.
    #[default]
    Latest,
    /// The oldest record the store still retains.
    Earliest,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "latest" => Ok(StartPosition::Latest),
            "earliest" | "trim_horizon" => Ok(StartPosition::Earliest),
            _ => Err(format!("Unknown start position: {s}")),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct StoreConfig {
    #[envconfig(default = "kinesis")]
    pub store_backend: StoreBackend,

    #[envconfig(default = "test")]
    pub stream_name: String,

    #[envconfig(default = "ap-southeast-2")]
    pub aws_region: String,

    pub kinesis_endpoint: Option<String>, // Override for localstack and friends

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(from = "KAFKA_FETCH_TIMEOUT_MS", default = "500")]
    pub kafka_fetch_timeout: EnvMsDuration,

    #[envconfig(default = "1")]
    pub memory_partitions: usize,

    #[envconfig(from = "CURSOR_TTL_MS", default = "300000")]
    pub cursor_ttl: EnvMsDuration,
}
