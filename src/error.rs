use thiserror::Error;

/// Wire-level error codes shared with the peer.
///
/// The numeric values travel inside error frames and must not change.
pub mod error_code {
    /// Catch-all for engine failures without a more specific code.
    pub const GENERAL_ERROR: i32 = 50000;
    /// A value tag or storage type the codec does not know.
    pub const UNKNOWN_DATA_TYPE: i32 = 50004;
    /// Statement cancelled cooperatively.
    pub const STATEMENT_CANCELED: i32 = 57014;
    /// A cached object id that is no longer (or never was) registered.
    pub const OBJECT_CLOSED: i32 = 90007;
    /// Protocol version negotiation failed.
    pub const DRIVER_VERSION_ERROR: i32 = 90047;
    /// Malformed frame, unknown opcode, or transport failure. The peer may
    /// reconnect when it sees this code.
    pub const CONNECTION_BROKEN: i32 = 90067;
}

/// An error in the shape the wire carries: SQL state, message, the statement
/// text when one is involved, a numeric code and an optional rendered trace.
///
/// Every failure inside dispatch or command execution is converted to this
/// type before it reaches the error encoder.
#[derive(Debug, Clone, Error)]
#[error("{message} [{sql_state}-{code}]")]
pub struct DbError {
    pub code: i32,
    pub sql_state: String,
    pub message: String,
    pub sql: Option<String>,
    pub trace: String,
}

impl DbError {
    pub fn get(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: code.to_string(),
            message: message.into(),
            sql: None,
            trace: String::new(),
        }
    }

    /// Malformed frames, short reads, unknown opcodes. Fatal to the
    /// connection: the dispatcher stops after sending it.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::get(error_code::CONNECTION_BROKEN, message)
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::get(error_code::GENERAL_ERROR, message)
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Convert an arbitrary error into the wire shape, keeping an existing
    /// `DbError` untouched.
    pub fn convert<E: std::error::Error + 'static>(e: E) -> Self {
        let any: &dyn std::any::Any = &e;
        if let Some(db) = any.downcast_ref::<DbError>() {
            return db.clone();
        }
        Self::get(error_code::GENERAL_ERROR, e.to_string())
    }

    /// True when the peer is allowed to drop the connection and re-connect.
    pub fn reconnect_allowed(&self) -> bool {
        self.code == error_code::CONNECTION_BROKEN
    }

    /// Errors that must tear the connection down after being reported.
    pub fn is_fatal(&self) -> bool {
        self.code == error_code::CONNECTION_BROKEN
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        Self::get(error_code::CONNECTION_BROKEN, e.to_string())
    }
}
