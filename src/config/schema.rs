use serde::Deserialize;

use crate::connection::ConnectionSettings;
use crate::protocol::{MAX_PACKET_SIZE, SERVER_CACHED_OBJECTS, SERVER_RESULT_SET_FETCH_SIZE};

#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connection-layer tuning for the server side.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base directory override applied to every client's parameters.
    #[serde(default)]
    pub base_dir: Option<String>,
    /// Refuse to create databases that do not exist yet.
    #[serde(default)]
    pub if_exists: bool,
    /// Per-connection object cache capacity.
    #[serde(default = "default_cached_objects")]
    pub cached_objects: usize,
    /// Rows sent with a query response before the client starts fetching.
    #[serde(default = "default_fetch_size")]
    pub result_set_fetch_size: usize,
    /// Hard cap on a frame's declared payload length.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Command worker threads shared by all connections.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_cached_objects() -> usize {
    SERVER_CACHED_OBJECTS
}

fn default_fetch_size() -> usize {
    SERVER_RESULT_SET_FETCH_SIZE
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_worker_threads() -> usize {
    4
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            if_exists: false,
            cached_objects: default_cached_objects(),
            result_set_fetch_size: default_fetch_size(),
            max_packet_size: default_max_packet_size(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
        }
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            cached_objects: config.cached_objects,
            fetch_size: config.result_set_fetch_size,
            max_packet_size: config.max_packet_size,
            base_dir: config.base_dir.clone(),
            if_exists: config.if_exists,
        }
    }
}
