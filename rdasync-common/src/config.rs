//! # Service Configuration
//!
//! Serde-loadable settings for a service: pool sizing, read buffer size and
//! the connection strings to register at start-up.

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::options::ConnectionOptions;

/// Pool size used when a connection does not name one.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Initial capacity of each connection's read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Maximum live connections per alias unless overridden.
    pub default_pool_size: usize,
    /// Bytes reserved up front for each connection's read buffer.
    pub read_buffer_size: usize,
    /// Connections registered when the service starts.
    pub connections: Vec<ConnectionSpec>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            default_pool_size: DEFAULT_POOL_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connections: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Loads a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One connection to register: a connection string plus an optional pool size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// `alias=schema://...` connection string.
    pub connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

impl ConnectionSpec {
    pub fn options(&self) -> Result<ConnectionOptions, ConnectionError> {
        ConnectionOptions::parse(&self.connection)
    }
}
