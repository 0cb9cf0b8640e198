//! In-memory engine doubles for connection tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use hermesdb_net::engine::{
    ColumnInfo, CommandParameter, ConnectionInfo, DataType, LobStorage, PreparedStatement,
    QueryResult, Replication, Session, SessionFactory, StorageMap, Transaction,
};
use hermesdb_net::error::DbError;
use hermesdb_net::protocol::Value;

/// Log to the test writer when `RUST_LOG` asks for it.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared observable state of the fake engine. All sessions created by one
/// factory view the same engine, which is what the dispatch tests inspect.
pub struct MockEngine {
    pub sessions_created: AtomicUsize,
    pub closed_sessions: AtomicUsize,
    pub modification_id: AtomicU64,
    pub auto_commit: AtomicBool,
    pub root: AtomicBool,
    pub local: AtomicBool,
    pub replication_name: Mutex<Option<String>>,
    pub bound_parameters: Mutex<Vec<Value>>,
    pub savepoints: Mutex<Vec<String>>,
    pub cancelled: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub leaf_pages_added: AtomicUsize,
    pub leaf_pages_removed: AtomicUsize,
    pub lob_opens: AtomicUsize,
    lob_data: Vec<u8>,
    tx: Arc<MockTransaction>,
    maps: Mutex<HashMap<String, Arc<MockMap>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            sessions_created: AtomicUsize::new(0),
            closed_sessions: AtomicUsize::new(0),
            modification_id: AtomicU64::new(0),
            auto_commit: AtomicBool::new(true),
            root: AtomicBool::new(true),
            local: AtomicBool::new(false),
            replication_name: Mutex::new(None),
            bound_parameters: Mutex::new(Vec::new()),
            savepoints: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            leaf_pages_added: AtomicUsize::new(0),
            leaf_pages_removed: AtomicUsize::new(0),
            lob_opens: AtomicUsize::new(0),
            lob_data: (0..4096).map(|i| (i % 251) as u8).collect(),
            tx: Arc::new(MockTransaction {
                names: Mutex::new("t1,t2".to_string()),
            }),
            maps: Mutex::new(HashMap::new()),
        }
    }
}

impl MockEngine {
    pub fn lob_data(&self) -> &[u8] {
        &self.lob_data
    }

    fn bump(&self) {
        self.modification_id.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockFactory {
    engine: Arc<MockEngine>,
}

impl MockFactory {
    pub fn new(engine: Arc<MockEngine>) -> Self {
        Self { engine }
    }

    /// Shorthand for tests that need a session without a handshake.
    pub fn create_session_for_test(&self) -> Result<Arc<dyn Session>, DbError> {
        self.create_session(&ConnectionInfo::default())
    }
}

impl SessionFactory for MockFactory {
    fn create_session(&self, _ci: &ConnectionInfo) -> Result<Arc<dyn Session>, DbError> {
        self.engine.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            engine: self.engine.clone(),
        }))
    }
}

pub struct MockSession {
    engine: Arc<MockEngine>,
}

impl Session for MockSession {
    fn prepare_statement(
        &self,
        sql: &str,
        _fetch_size: i32,
    ) -> Result<Arc<dyn PreparedStatement>, DbError> {
        let params = (0..sql.matches('?').count())
            .map(|_| {
                Arc::new(MockParameter {
                    engine: self.engine.clone(),
                    value: Mutex::new(None),
                }) as Arc<dyn CommandParameter>
            })
            .collect();
        Ok(Arc::new(MockStatement {
            sql: sql.to_string(),
            engine: self.engine.clone(),
            params,
        }))
    }

    fn get_storage_map(&self, name: &str) -> Result<Arc<dyn StorageMap>, DbError> {
        let mut maps = self.engine.maps.lock();
        let map = maps.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MockMap {
                engine: self.engine.clone(),
                entries: Mutex::new(HashMap::new()),
            })
        });
        Ok(map.clone())
    }

    fn lob_storage(&self) -> Result<Arc<dyn LobStorage>, DbError> {
        Ok(Arc::new(MockLobStorage {
            engine: self.engine.clone(),
        }))
    }

    fn transaction(&self) -> Arc<dyn Transaction> {
        self.engine.tx.clone()
    }

    fn set_auto_commit(&self, auto_commit: bool) {
        self.engine.auto_commit.store(auto_commit, Ordering::SeqCst);
    }

    fn is_auto_commit(&self) -> bool {
        self.engine.auto_commit.load(Ordering::SeqCst)
    }

    fn set_root(&self, root: bool) {
        self.engine.root.store(root, Ordering::SeqCst);
    }

    fn set_replication_name(&self, name: &str) {
        *self.engine.replication_name.lock() = Some(name.to_string());
    }

    fn set_local(&self, local: bool) {
        self.engine.local.store(local, Ordering::SeqCst);
    }

    fn modification_id(&self) -> u64 {
        self.engine.modification_id.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn close(&self) {
        self.engine.closed_sessions.fetch_add(1, Ordering::SeqCst);
    }

    fn commit(&self, _local: bool, _tx_names: Option<&str>) -> Result<(), DbError> {
        self.engine.commits.fetch_add(1, Ordering::SeqCst);
        self.engine.bump();
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.engine.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_savepoint(&self, name: &str) -> Result<(), DbError> {
        self.engine.savepoints.lock().push(name.to_string());
        Ok(())
    }

    fn rollback_to_savepoint(&self, name: &str) -> Result<(), DbError> {
        self.engine.savepoints.lock().retain(|s| s != name);
        Ok(())
    }

    fn validate_transaction(&self, _name: &str) -> Result<bool, DbError> {
        Ok(true)
    }
}

struct MockTransaction {
    names: Mutex<String>,
}

impl Transaction for MockTransaction {
    fn local_transaction_names(&self) -> String {
        self.names.lock().clone()
    }

    fn add_local_transaction_names(&self, names: &str) {
        let mut current = self.names.lock();
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(names);
    }
}

pub struct MockStatement {
    sql: String,
    engine: Arc<MockEngine>,
    params: Vec<Arc<dyn CommandParameter>>,
}

impl PreparedStatement for MockStatement {
    fn is_query(&self) -> bool {
        self.sql.starts_with("SELECT")
    }

    fn query(&self, _max_rows: i32, _scrollable: bool) -> Result<Box<dyn QueryResult>, DbError> {
        match self.sql.as_str() {
            "SELECT 1" => Ok(Box::new(MockResult::new(
                vec!["1".to_string()],
                vec![vec![Value::Int(1)]],
                None,
            ))),
            "SELECT POISON" => Ok(Box::new(MockResult::new(
                vec!["P".to_string()],
                vec![vec![Value::Int(1)], vec![Value::Int(2)]],
                Some(1),
            ))),
            _ => Ok(Box::new(MockResult::new(
                vec!["1".to_string()],
                Vec::new(),
                None,
            ))),
        }
    }

    fn update(&self) -> Result<i32, DbError> {
        if self.sql.starts_with("SET") {
            self.engine.bump();
            Ok(1)
        } else if self.sql.starts_with("INSERT BAD") {
            Err(DbError::general("bad insert").with_sql(&self.sql))
        } else if self.sql.starts_with("INSERT") {
            self.engine.bump();
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn metadata(&self) -> Result<Box<dyn QueryResult>, DbError> {
        Ok(Box::new(MockResult::new(
            vec!["1".to_string()],
            Vec::new(),
            None,
        )))
    }

    fn parameters(&self) -> Vec<Arc<dyn CommandParameter>> {
        self.params.clone()
    }

    fn set_fetch_size(&self, _fetch_size: i32) {}

    fn set_connection_id(&self, _connection_id: i32) {}

    fn cancel(&self) {
        self.engine.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {}
}

struct MockParameter {
    engine: Arc<MockEngine>,
    value: Mutex<Option<Value>>,
}

impl CommandParameter for MockParameter {
    fn set_value(&self, value: Value) -> Result<(), DbError> {
        self.engine.bound_parameters.lock().push(value.clone());
        *self.value.lock() = Some(value);
        Ok(())
    }

    fn value_type(&self) -> i32 {
        4
    }

    fn precision(&self) -> i64 {
        0
    }

    fn scale(&self) -> i32 {
        0
    }

    fn nullable(&self) -> i32 {
        1
    }
}

pub struct MockResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    next_calls: usize,
    current: Vec<Value>,
    fail_at: Option<usize>,
    pub closed: bool,
}

impl MockResult {
    fn new(columns: Vec<String>, rows: Vec<Vec<Value>>, fail_at: Option<usize>) -> Self {
        Self {
            columns,
            rows,
            next_calls: 0,
            current: Vec::new(),
            fail_at,
            closed: false,
        }
    }
}

impl QueryResult for MockResult {
    fn visible_column_count(&self) -> usize {
        self.columns.len()
    }

    fn row_count(&self) -> i32 {
        self.rows.len() as i32
    }

    fn next(&mut self) -> Result<bool, DbError> {
        if self.fail_at == Some(self.next_calls) {
            return Err(DbError::general("poisoned row"));
        }
        if self.next_calls < self.rows.len() {
            self.current = self.rows[self.next_calls].clone();
            self.next_calls += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn current_row(&self) -> &[Value] {
        &self.current
    }

    fn column_info(&self, column: usize) -> ColumnInfo {
        ColumnInfo {
            alias: self.columns[column].clone(),
            column_name: self.columns[column].clone(),
            column_type: 4,
            nullable: 1,
            ..ColumnInfo::default()
        }
    }

    fn reset(&mut self) {
        self.next_calls = 0;
        self.current.clear();
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct MockMap {
    engine: Arc<MockEngine>,
    entries: Mutex<HashMap<String, String>>,
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => format!("{other:?}"),
    }
}

struct TextType;

impl DataType for TextType {
    fn read(&self, bytes: &[u8]) -> Result<Value, DbError> {
        if bytes.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    fn write(&self, value: &Value) -> Bytes {
        match value {
            Value::Null => Bytes::new(),
            other => Bytes::from(text_of(other).into_bytes()),
        }
    }
}

impl StorageMap for MockMap {
    fn key_type(&self) -> Arc<dyn DataType> {
        Arc::new(TextType)
    }

    fn value_type(&self) -> Arc<dyn DataType> {
        Arc::new(TextType)
    }

    fn get(&self, key: &Value) -> Result<Option<Value>, DbError> {
        Ok(self
            .entries
            .lock()
            .get(&text_of(key))
            .map(|v| Value::String(v.clone())))
    }

    fn put(&self, key: Value, value: Value) -> Result<Option<Value>, DbError> {
        self.engine.bump();
        Ok(self
            .entries
            .lock()
            .insert(text_of(&key), text_of(&value))
            .map(Value::String))
    }

    fn as_replication(&self) -> Option<&dyn Replication> {
        Some(self)
    }
}

impl Replication for MockMap {
    fn add_leaf_page(&self, _split_key: Bytes, _page: Bytes) -> Result<(), DbError> {
        self.engine.leaf_pages_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_leaf_page(&self, _key: Bytes) -> Result<(), DbError> {
        self.engine.leaf_pages_removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockLobStorage {
    engine: Arc<MockEngine>,
}

impl LobStorage for MockLobStorage {
    fn open_input_stream(&self, _lob_id: i64, _hmac: &[u8]) -> Result<Box<dyn Read + Send>, DbError> {
        self.engine.lob_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.engine.lob_data.clone())))
    }
}
