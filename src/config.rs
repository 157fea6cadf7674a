use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
}

/// Capacities of the per-connection scan regions, in bytes. Each field of a
/// request head must fit its region or the request is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSizes {
    #[serde(default = "default_method_capacity")]
    pub method: usize,
    #[serde(default = "default_path_capacity")]
    pub path: usize,
    #[serde(default = "default_protocol_capacity")]
    pub protocol: usize,
    #[serde(default = "default_header_name_capacity")]
    pub header_name: usize,
    #[serde(default = "default_header_value_capacity")]
    pub header_value: usize,
    /// Chunk size for body and response relay; bounds per-connection memory
    /// regardless of payload size.
    #[serde(default = "default_relay_chunk")]
    pub relay_chunk: usize,
}

fn default_method_capacity() -> usize {
    16
}

fn default_path_capacity() -> usize {
    2048
}

fn default_protocol_capacity() -> usize {
    16
}

fn default_header_name_capacity() -> usize {
    128
}

fn default_header_value_capacity() -> usize {
    4096
}

fn default_relay_chunk() -> usize {
    8192
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self {
            method: default_method_capacity(),
            path: default_path_capacity(),
            protocol: default_protocol_capacity(),
            header_name: default_header_name_capacity(),
            header_value: default_header_value_capacity(),
            relay_chunk: default_relay_chunk(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address for the TLS listener. Port 0 binds an ephemeral port; the
    /// actual address is logged and available from the bound gateway.
    pub listen_addr: SocketAddr,
    /// The internal, TLS-unaware HTTP listener requests are forwarded to.
    pub backend_addr: String,
    /// Replacement value for the `Host` header. `None` passes the client's
    /// value through.
    #[serde(default)]
    pub forward_host: Option<String>,
    /// Suppress all log output.
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Keep-alive connections idle longer than this are closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Optional plaintext listener for /metrics and /health.
    #[serde(default)]
    pub monitor_addr: Option<SocketAddr>,
    #[serde(default)]
    pub buffers: BufferSizes,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    90
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8443".parse().unwrap(),
            backend_addr: "127.0.0.1:8080".to_string(),
            forward_host: None,
            silent: false,
            private_key: None,
            certificate: None,
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            monitor_addr: None,
            buffers: BufferSizes::default(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.backend_addr.trim().is_empty() {
            return Err(ProxyError::Config("backend_addr must not be empty".to_string()));
        }

        match (&self.private_key, &self.certificate) {
            (Some(_), None) => {
                return Err(ProxyError::Config(
                    "private_key is set but certificate is missing".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(ProxyError::Config(
                    "certificate is set but private_key is missing".to_string(),
                ));
            }
            _ => {}
        }

        if self.connect_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "idle_timeout_secs must be greater than zero".to_string(),
            ));
        }

        let b = &self.buffers;
        if b.method == 0
            || b.path == 0
            || b.protocol == 0
            || b.header_name == 0
            || b.header_value == 0
            || b.relay_chunk == 0
        {
            return Err(ProxyError::Config(
                "buffer capacities must all be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
