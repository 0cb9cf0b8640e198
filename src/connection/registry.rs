use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::engine::Session;
use crate::error::DbError;

/// Per-connection map from wire connection id to logical session.
///
/// Sessions are created lazily on first use and all torn down when the
/// connection closes. Ids never leak across connections — every connection
/// owns its own registry.
pub struct SessionRegistry {
    sessions: DashMap<i32, Arc<dyn Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get_or_create(
        &self,
        connection_id: i32,
        create: impl FnOnce() -> Result<Arc<dyn Session>, DbError>,
    ) -> Result<Arc<dyn Session>, DbError> {
        match self.sessions.entry(connection_id) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let session = create()?;
                v.insert(session.clone());
                debug!(connection_id, "created logical session");
                Ok(session)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every logical session. Errors are reported but do not stop
    /// the teardown.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.is_closed() {
                session.close();
            }
        }
        let count = self.sessions.len();
        self.sessions.clear();
        if count > 0 {
            debug!(count, "closed logical sessions");
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            warn!(
                count = self.sessions.len(),
                "session registry dropped with live sessions"
            );
        }
    }
}
