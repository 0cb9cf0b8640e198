//! Client half of a connection.
//!
//! The same state machine serves both roles; this module holds the paths
//! taken when the direction bit marks a packet as a response. Outbound
//! requests register a single-shot callback under their request id; the
//! response handler looks it up, feeds it, and removes it.

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::Connection;
use crate::engine::ConnectionInfo;
use crate::error::{error_code, DbError};
use crate::protocol::{
    Opcode, Transfer, STATUS_CLOSED, STATUS_ERROR, STATUS_OK, STATUS_OK_STATE_CHANGED,
    TCP_PROTOCOL_VERSION_1,
};

/// A pending response handler, removed after fulfillment.
pub enum AsyncCallback {
    /// Materializes a single integer result (an update count).
    Int(oneshot::Sender<i32>),
    /// Hands the codec, positioned at the response payload, to user code.
    Codec(Box<dyn FnOnce(&mut Transfer) -> Result<(), DbError> + Send>),
}

impl Connection {
    /// Send the `SESSION_INIT` request that opens the exchange.
    pub fn write_init_packet(&self, ci: &ConnectionInfo) -> Result<(), DbError> {
        let mut t = self.core.transfer.lock();
        t.write_request_header(Opcode::SessionInit);
        t.write_i32(TCP_PROTOCOL_VERSION_1)
            .write_i32(TCP_PROTOCOL_VERSION_1);
        t.write_string(&ci.database);
        t.write_string(&ci.url);
        t.write_string(&ci.user);
        t.write_bytes(&ci.user_password_hash);
        t.write_bytes(&ci.file_password_hash);
        t.write_bytes(&ci.file_encryption_key);
        let keys = ci.property_keys();
        t.write_i32(keys.len() as i32);
        for key in keys {
            t.write_string(key);
            t.write_nullable_string(ci.property(key));
        }
        t.flush()
    }

    /// Register a handler that resolves to an integer result.
    pub fn register_int_callback(&self, id: i32) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        self.callbacks.insert(id, AsyncCallback::Int(tx));
        rx
    }

    /// Register a handler that consumes the raw response payload.
    pub fn register_callback(
        &self,
        id: i32,
        callback: impl FnOnce(&mut Transfer) -> Result<(), DbError> + Send + 'static,
    ) {
        self.callbacks
            .insert(id, AsyncCallback::Codec(Box::new(callback)));
    }

    fn take_callback(&self, id: i32) -> Option<AsyncCallback> {
        self.callbacks.remove(&id).map(|(_, cb)| cb)
    }

    /// Read the status prefix of a response. An error status consumes the
    /// rest of the frame and surfaces as the decoded [`DbError`].
    fn read_status(&mut self, t: &mut Transfer) -> Result<i32, DbError> {
        let status = t.read_i32()?;
        match status {
            STATUS_ERROR => Err(parse_error(t)?),
            STATUS_OK | STATUS_OK_STATE_CHANGED | STATUS_CLOSED => Ok(status),
            other => Err(DbError::protocol(format!("unexpected status {other}"))),
        }
    }

    pub(crate) fn dispatch_response(&mut self, t: &mut Transfer, raw_op: i32) -> Result<(), DbError> {
        let op = Opcode::from_i32(raw_op)
            .ok_or_else(|| DbError::protocol(format!("unknown opcode {raw_op} in response")))?;
        trace!(seq = self.core.seq, op = ?op, "dispatching response");
        let status = self.read_status(t)?;
        if status == STATUS_CLOSED {
            warn!(seq = self.core.seq, op = ?op, "peer reports session closed");
            self.core.set_stop();
            return Ok(());
        }

        use Opcode::*;
        match op {
            SessionInit => {
                let version = t.read_i32()?;
                t.set_version(version);
                self.client_version = version;
                debug!(seq = self.core.seq, version, "protocol version negotiated");
                t.write_request_header(SessionSetId);
                let session_id = self.session_id.clone();
                t.write_nullable_string(session_id.as_deref());
                t.flush()
            }
            SessionSetId => {
                self.auto_commit = t.read_bool()?;
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(());
                }
                Ok(())
            }
            CommandPrepare
            | CommandPrepareReadParams
            | CommandQuery
            | CommandPreparedQuery
            | CommandDistributedTransactionQuery
            | CommandDistributedTransactionPreparedQuery
            | CommandGetMetaData => {
                let id = t.read_i32()?;
                match self.take_callback(id) {
                    Some(AsyncCallback::Codec(callback)) => callback(t),
                    Some(AsyncCallback::Int(_)) => Err(DbError::general(format!(
                        "integer callback registered for response {id} carrying a payload"
                    ))),
                    None => {
                        warn!(seq = self.core.seq, id, "no callback for response");
                        Ok(())
                    }
                }
            }
            CommandUpdate
            | CommandPreparedUpdate
            | CommandReplicationUpdate
            | CommandReplicationPreparedUpdate
            | CommandDistributedTransactionUpdate
            | CommandDistributedTransactionPreparedUpdate => {
                let id = t.read_i32()?;
                if op.is_distributed() {
                    let names = t.read_string()?.unwrap_or_default();
                    if let Ok(session) = self.core.primary_session() {
                        session.transaction().add_local_transaction_names(&names);
                    }
                }
                let update_count = t.read_i32()?;
                match self.take_callback(id) {
                    Some(AsyncCallback::Int(tx)) => {
                        let _ = tx.send(update_count);
                        Ok(())
                    }
                    Some(AsyncCallback::Codec(callback)) => callback(t),
                    None => {
                        warn!(seq = self.core.seq, id, "no callback for update response");
                        Ok(())
                    }
                }
            }
            // status-only acknowledgements
            _ => Ok(()),
        }
    }
}

/// Decode the error frame fields into a [`DbError`]. A
/// `CONNECTION_BROKEN` code is the peer's reconnect-permitted signal,
/// which [`DbError::reconnect_allowed`] exposes.
pub(crate) fn parse_error(t: &mut Transfer) -> Result<DbError, DbError> {
    let sql_state = t.read_string()?.unwrap_or_default();
    let message = t.read_string()?.unwrap_or_default();
    let sql = t.read_string()?;
    let code = t.read_i32()?;
    let trace = t.read_string()?.unwrap_or_default();
    if code == error_code::CONNECTION_BROKEN {
        debug!(code, "peer allows re-connect");
    }
    Ok(DbError {
        code,
        sql_state,
        message,
        sql,
        trace,
    })
}
