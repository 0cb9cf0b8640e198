use std::collections::HashMap;

use bytes::Bytes;

/// Everything a session factory needs to open a database session: the
/// connection URL, credential material and a free-form property bag.
///
/// Built on the server from the `SESSION_INIT` payload, on the client from
/// the application's connect parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub url: String,
    pub database: String,
    pub user: String,
    pub user_password_hash: Bytes,
    pub file_password_hash: Bytes,
    pub file_encryption_key: Bytes,
    base_dir: Option<String>,
    properties: HashMap<String, String>,
}

impl ConnectionInfo {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Sloppy drivers may repeat a property name; the last value wins.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Property keys in a stable order, for serializing the bag.
    pub fn property_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.properties.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn set_base_dir(&mut self, base_dir: impl Into<String>) {
        self.base_dir = Some(base_dir.into());
    }

    pub fn base_dir(&self) -> Option<&str> {
        self.base_dir.as_deref()
    }
}
