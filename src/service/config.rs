use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Port the original SuperTux test server listened on.
pub const DEFAULT_PORT: u16 = 3474;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// initial capacity of each connection's read buffer
    pub conn_read_buffer_size: usize,
    /// chunks queued for a slow peer before sends to it start failing
    pub outbound_queue_capacity: usize,
    /// how long a closed connection may keep flushing queued data before
    /// its socket is dropped
    pub close_grace_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connection: 1024,
            conn_read_buffer_size: 4 * 1024,
            outbound_queue_capacity: 256,
            close_grace_ms: 1_000,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// upper bound on buffered header bytes before the terminator shows up
    pub max_header_bytes: usize,
    /// a pending handshake that receives nothing for this long is rejected
    pub timeout_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            max_header_bytes: 8 * 1024,
            timeout_ms: 10_000,
            reap_interval_ms: 1_000,
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// how often the test client pushes a control snapshot
    pub send_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            send_interval_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub handshake: HandshakeConfig,
    pub client: ClientConfig,
}

impl RelayConfig {
    /// Loads the TOML file at `path`, then lets `TUX__SECTION__KEY` environment
    /// variables override single values. Fields missing from both keep their
    /// defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<RelayConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("TUX").separator("__"))
            .build()?;

        let relay_config: RelayConfig = config.try_deserialize()?;
        relay_config.validate()?;
        Ok(relay_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".into(),
            ));
        }
        if self.network.outbound_queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "network.outbound_queue_capacity must be greater than 0".into(),
            ));
        }
        // the header block must at least fit its own terminator
        if self.handshake.max_header_bytes < 4 {
            return Err(AppError::InvalidValue(format!(
                "handshake.max_header_bytes too small: {}",
                self.handshake.max_header_bytes
            )));
        }
        if self.handshake.reap_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "handshake.reap_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
