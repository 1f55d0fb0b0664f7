// config.rs

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Port of the ingest line (U2)
pub const DEFAULT_INGEST_PORT: u16 = 52002;
/// Port of the output line (U3)
pub const DEFAULT_OUTPUT_PORT: u16 = 52003;
/// Depth of the ingest -> compute queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the simulated device
///
/// Every field may be omitted from a TOML file; durations are given in
/// milliseconds there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bind_host: IpAddr,
    pub ingest_port: u16,
    pub output_port: u16,
    pub queue_capacity: usize,
    /// Pause between ingest iterations
    #[serde(with = "millis")]
    pub ingest_interval: Duration,
    /// Pause between attempts to finish a short write
    #[serde(with = "millis")]
    pub write_retry_interval: Duration,
    /// Cadence of the accept/disconnect poller
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ingest_port: DEFAULT_INGEST_PORT,
            output_port: DEFAULT_OUTPUT_PORT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ingest_interval: Duration::from_millis(10),
            write_retry_interval: Duration::from_millis(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PipelineConfig {
    pub fn ingest_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.ingest_port)
    }

    pub fn output_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.output_port)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.ingest_port != 0 && self.ingest_port == self.output_port {
            return Err(ConfigError::Invalid(format!(
                "ingest and output lines both use port {}",
                self.ingest_port
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
