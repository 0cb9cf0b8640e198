//! Facades over the local database engine.
//!
//! The connection layer never interprets SQL or touches storage pages
//! itself; everything goes through these traits. Implementations live in
//! the engine crates (or in test doubles) and are free to use interior
//! mutability — the handles here are shared between the reactor and the
//! command workers.

mod info;

pub use info::ConnectionInfo;

use bytes::Bytes;
use std::io::Read;
use std::sync::Arc;

use crate::error::DbError;
use crate::protocol::Value;

/// Creates logical sessions from connection parameters.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, ci: &ConnectionInfo) -> Result<Arc<dyn Session>, DbError>;
}

/// One logical database session. A connection owns a primary session plus
/// one per client-side connection id.
pub trait Session: Send + Sync {
    fn prepare_statement(
        &self,
        sql: &str,
        fetch_size: i32,
    ) -> Result<Arc<dyn PreparedStatement>, DbError>;

    fn get_storage_map(&self, name: &str) -> Result<Arc<dyn StorageMap>, DbError>;

    fn lob_storage(&self) -> Result<Arc<dyn LobStorage>, DbError>;

    fn transaction(&self) -> Arc<dyn Transaction>;

    fn set_auto_commit(&self, auto_commit: bool);
    fn is_auto_commit(&self) -> bool;

    /// Clear to mark this node as a non-root participant of a distributed
    /// transaction.
    fn set_root(&self, root: bool);

    /// Transient name attached to replication writes.
    fn set_replication_name(&self, name: &str);

    fn set_local(&self, local: bool);

    /// Monotonic counter bumped by state-affecting operations; the
    /// dispatcher snapshots it to detect state changes across a request.
    fn modification_id(&self) -> u64;

    fn is_closed(&self) -> bool;
    fn close(&self);

    fn commit(&self, local: bool, tx_names: Option<&str>) -> Result<(), DbError>;
    fn rollback(&self) -> Result<(), DbError>;
    fn add_savepoint(&self, name: &str) -> Result<(), DbError>;
    fn rollback_to_savepoint(&self, name: &str) -> Result<(), DbError>;
    fn validate_transaction(&self, name: &str) -> Result<bool, DbError>;
}

/// Handle to the session's current distributed transaction.
pub trait Transaction: Send + Sync {
    /// Comma-separated branch names the coordinator tracks; echoed in
    /// distributed-operation replies.
    fn local_transaction_names(&self) -> String;

    fn add_local_transaction_names(&self, names: &str);
}

/// A statement prepared against a session.
pub trait PreparedStatement: Send + Sync {
    fn is_query(&self) -> bool;

    fn query(&self, max_rows: i32, scrollable: bool) -> Result<Box<dyn QueryResult>, DbError>;

    fn update(&self) -> Result<i32, DbError>;

    fn metadata(&self) -> Result<Box<dyn QueryResult>, DbError>;

    fn parameters(&self) -> Vec<Arc<dyn CommandParameter>>;

    fn set_fetch_size(&self, fetch_size: i32);
    fn set_connection_id(&self, connection_id: i32);

    /// Cooperative cancellation; a running `query`/`update` is expected to
    /// observe it and fail with a cancellation error.
    fn cancel(&self);

    fn close(&self);
}

/// A bind parameter of a prepared statement.
pub trait CommandParameter: Send + Sync {
    fn set_value(&self, value: Value) -> Result<(), DbError>;
    fn value_type(&self) -> i32;
    fn precision(&self) -> i64;
    fn scale(&self) -> i32;
    fn nullable(&self) -> i32;
}

/// Column metadata as written into query responses.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    pub alias: String,
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub column_type: i32,
    pub precision: i64,
    pub scale: i32,
    pub display_size: i32,
    pub auto_increment: bool,
    pub nullable: i32,
}

/// A query result (or statement metadata) the dispatcher walks row by row.
pub trait QueryResult: Send {
    fn visible_column_count(&self) -> usize;

    /// Total row count, `-1` when not known up front.
    fn row_count(&self) -> i32;

    fn next(&mut self) -> Result<bool, DbError>;

    fn current_row(&self) -> &[Value];

    fn column_info(&self, column: usize) -> ColumnInfo;

    fn reset(&mut self);
    fn close(&mut self);
}

/// Key/value codec of a storage map. Raw bytes on the wire, typed values
/// inside the engine.
pub trait DataType: Send + Sync {
    fn read(&self, bytes: &[u8]) -> Result<Value, DbError>;
    fn write(&self, value: &Value) -> Bytes;
}

/// A named map in the storage engine.
pub trait StorageMap: Send + Sync {
    fn key_type(&self) -> Arc<dyn DataType>;
    fn value_type(&self) -> Arc<dyn DataType>;

    fn get(&self, key: &Value) -> Result<Option<Value>, DbError>;
    fn put(&self, key: Value, value: Value) -> Result<Option<Value>, DbError>;

    /// Maps that replicate expose leaf-page maintenance; others return
    /// `None` and the dispatcher accepts the request silently.
    fn as_replication(&self) -> Option<&dyn Replication> {
        None
    }
}

/// Leaf-page maintenance on a replicated storage map.
pub trait Replication: Send + Sync {
    fn add_leaf_page(&self, split_key: Bytes, page: Bytes) -> Result<(), DbError>;
    fn remove_leaf_page(&self, key: Bytes) -> Result<(), DbError>;
}

/// Access to large-object content by id.
pub trait LobStorage: Send + Sync {
    /// Open a stream over the LOB's bytes from the beginning; the caller
    /// skips to the offset it needs.
    fn open_input_stream(&self, lob_id: i64, hmac: &[u8]) -> Result<Box<dyn Read + Send>, DbError>;
}
