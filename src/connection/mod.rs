//! One [`Connection`] per accepted socket (or per outbound client link).
//!
//! The reactor side feeds raw TCP chunks into [`Connection::handle`]; the
//! reassembler slices them into packets, and the dispatcher runs each
//! packet synchronously. SQL executions are deferred onto the shared
//! command worker pool; everything else answers directly. The write side of
//! the frame codec is shared with the workers behind a mutex, which keeps
//! reply frames whole and per-connection replies in dispatch order.

mod cache;
pub mod client;
mod registry;

pub use cache::{CachedObject, CachedReader, LobCache, ObjectCache, SharedResult};
pub use client::AsyncCallback;
pub use registry::SessionRegistry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, trace, warn};

use crate::command::{CommandHandler, CommandQueue, CommandTarget, PreparedCommand};
use crate::engine::{ConnectionInfo, QueryResult, Session, SessionFactory};
use crate::error::{error_code, DbError};
use crate::protocol::{
    split_header, Opcode, PacketReassembler, Transfer, TransferSink, Value, EXECUTE_FAILED,
    IO_BUFFER_SIZE, MAX_PACKET_SIZE, SERVER_CACHED_OBJECTS, SERVER_RESULT_SET_FETCH_SIZE,
    STATUS_CLOSED, STATUS_ERROR, STATUS_OK, STATUS_OK_STATE_CHANGED, TCP_PROTOCOL_VERSION_CURRENT,
    TCP_PROTOCOL_VERSION_MAX, TCP_PROTOCOL_VERSION_MIN,
};

/// Global counter for connection sequence numbers; used for worker
/// affinity and log correlation.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Knobs of one connection, distilled from [`crate::config::NetConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Object cache capacity (statements, results).
    pub cached_objects: usize,
    /// Result-set fetch size; the LOB cache floor is five times this.
    pub fetch_size: usize,
    /// Hard cap on a frame's declared payload length.
    pub max_packet_size: usize,
    /// Server-side base directory override applied to client parameters.
    pub base_dir: Option<String>,
    /// When set, sessions may only open databases that already exist.
    pub if_exists: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            cached_objects: SERVER_CACHED_OBJECTS,
            fetch_size: SERVER_RESULT_SET_FETCH_SIZE,
            max_packet_size: MAX_PACKET_SIZE,
            base_dir: None,
            if_exists: false,
        }
    }
}

/// State shared between the reactor and the command workers.
pub(crate) struct ConnectionCore {
    pub(crate) seq: u64,
    pub(crate) transfer: Mutex<Transfer>,
    pub(crate) cache: Mutex<ObjectCache>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) command_queue: CommandQueue,
    /// Primary (control) session, created by `SESSION_INIT`.
    pub(crate) session: RwLock<Option<Arc<dyn Session>>>,
    stop: AtomicBool,
}

impl ConnectionCore {
    fn new(sink: TransferSink, settings: &ConnectionSettings) -> Self {
        Self {
            seq: CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst),
            transfer: Mutex::new(Transfer::new(sink)),
            cache: Mutex::new(ObjectCache::new(settings.cached_objects)),
            sessions: SessionRegistry::new(),
            command_queue: CommandQueue::new(),
            session: RwLock::new(None),
            stop: AtomicBool::new(false),
        }
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn set_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn primary_session(&self) -> Result<Arc<dyn Session>, DbError> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| DbError::protocol("session is not initialized"))
    }

    /// Encode a failure into the wire error frame, replacing whatever part
    /// of a response was already buffered. A transport failure here stops
    /// the connection.
    pub(crate) fn send_error(&self, response_header: i32, e: &DbError) {
        debug!(seq = self.seq, code = e.code, error = %e, "sending error frame");
        let mut t = self.transfer.lock();
        t.write_raw_header(response_header);
        t.write_i32(STATUS_ERROR);
        t.write_string(&e.sql_state);
        t.write_string(&e.message);
        t.write_nullable_string(e.sql.as_deref());
        t.write_i32(e.code);
        t.write_string(&e.trace);
        if t.flush().is_err() {
            self.set_stop();
        }
    }
}

impl CommandTarget for ConnectionCore {
    fn execute_one_command(&self) {
        let Some(command) = self.command_queue.pop() else {
            return;
        };
        let op = command.op;
        trace!(seq = self.seq, op = ?op, "executing deferred command");
        if let Err(e) = command.run() {
            self.send_error(op.response_header(), &e);
            if e.is_fatal() {
                self.set_stop();
            }
        }
    }
}

/// Status of a response given the modification-id snapshot taken at
/// request entry.
fn get_state(session: &Arc<dyn Session>, old_modification_id: u64) -> i32 {
    if session.is_closed() {
        STATUS_CLOSED
    } else if session.modification_id() == old_modification_id {
        STATUS_OK
    } else {
        STATUS_OK_STATE_CHANGED
    }
}

fn write_column(t: &mut Transfer, result: &dyn QueryResult, column: usize) {
    let info = result.column_info(column);
    t.write_string(&info.alias);
    t.write_string(&info.schema_name);
    t.write_string(&info.table_name);
    t.write_string(&info.column_name);
    t.write_i32(info.column_type);
    t.write_i64(info.precision);
    t.write_i32(info.scale);
    t.write_i32(info.display_size);
    t.write_bool(info.auto_increment);
    t.write_i32(info.nullable);
}

/// Write up to `count` rows as `true, values...` groups, then `false` on
/// exhaustion. A failure while stepping the result still terminates the
/// row stream before the error propagates.
fn write_row(t: &mut Transfer, result: &mut dyn QueryResult, count: i32) -> Result<(), DbError> {
    let visible = result.visible_column_count();
    let mut walk = || -> Result<(), DbError> {
        for _ in 0..count {
            if result.next()? {
                t.write_bool(true);
                let row = result.current_row();
                for value in row.iter().take(visible) {
                    t.write_value(value);
                }
            } else {
                t.write_bool(false);
                break;
            }
        }
        Ok(())
    };
    let outcome = walk();
    if let Err(e) = outcome {
        t.write_bool(false);
        return Err(e);
    }
    Ok(())
}

/// A multiplexed database connection, server or client end.
///
/// Both roles share the frame codec and the opcode table; the direction
/// bit of each packet header picks the handler side. A server connection
/// needs a session factory and the worker pool; a client connection needs
/// neither and correlates responses through its callback table.
pub struct Connection {
    core: Arc<ConnectionCore>,
    settings: ConnectionSettings,
    reassembler: PacketReassembler,
    pending: BytesMut,
    factory: Option<Arc<dyn SessionFactory>>,
    handler: Option<Arc<CommandHandler>>,
    /// Lazily created; most connections never stream LOBs.
    lobs: Option<LobCache>,
    /// Peer-assigned session id, used to gate statement cancellation.
    session_id: Option<String>,
    /// Connection parameters retained for lazy per-connection-id sessions.
    connection_info: Option<ConnectionInfo>,
    client_version: i32,
    // client role
    pub(crate) callbacks: DashMap<i32, AsyncCallback>,
    pub(crate) ready: Option<oneshot::Sender<()>>,
    pub(crate) auto_commit: bool,
}

impl Connection {
    pub fn new_server(
        sink: TransferSink,
        factory: Arc<dyn SessionFactory>,
        handler: Arc<CommandHandler>,
        settings: ConnectionSettings,
    ) -> Self {
        let core = Arc::new(ConnectionCore::new(sink, &settings));
        info!(seq = core.seq, "server connection created");
        Self {
            reassembler: PacketReassembler::new(settings.max_packet_size),
            core,
            settings,
            pending: BytesMut::with_capacity(4 * 1024),
            factory: Some(factory),
            handler: Some(handler),
            lobs: None,
            session_id: None,
            connection_info: None,
            client_version: 0,
            callbacks: DashMap::new(),
            ready: None,
            auto_commit: true,
        }
    }

    pub fn new_client(sink: TransferSink, settings: ConnectionSettings) -> Self {
        let core = Arc::new(ConnectionCore::new(sink, &settings));
        core.transfer.lock().set_verify_lobs(false);
        info!(seq = core.seq, "client connection created");
        Self {
            reassembler: PacketReassembler::new(settings.max_packet_size),
            core,
            settings,
            pending: BytesMut::with_capacity(4 * 1024),
            factory: None,
            handler: None,
            lobs: None,
            session_id: None,
            connection_info: None,
            client_version: 0,
            callbacks: DashMap::new(),
            ready: None,
            auto_commit: true,
        }
    }

    /// One-shot signal fired when the init/set-id exchange completes.
    pub fn with_ready_signal(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn seq(&self) -> u64 {
        self.core.seq
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stopped()
    }

    pub fn client_version(&self) -> i32 {
        self.client_version
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// The shared frame codec. Exposed so embedders (and the client role's
    /// user code) can write requests; hold the lock for a whole frame.
    pub fn transfer(&self) -> &Mutex<Transfer> {
        &self.core.transfer
    }

    /// The key LOB MAC tags are issued and verified with.
    pub fn lob_mac_key(&self) -> [u8; crate::protocol::transfer::LOB_MAC_KEY_LENGTH] {
        *self.core.transfer.lock().lob_mac_key()
    }

    /// Attach a session out of band (used by peers that already own one).
    pub fn set_primary_session(&self, session: Arc<dyn Session>) {
        *self.core.session.write() = Some(session);
    }

    /// Feed raw bytes from the socket. Whole packets are dispatched in
    /// arrival order; a partial tail is kept for the next chunk.
    pub fn handle(&mut self, chunk: &[u8]) {
        if self.core.stopped() {
            return;
        }
        self.pending.extend_from_slice(chunk);
        loop {
            if self.core.stopped() {
                return;
            }
            match self.reassembler.decode(&mut self.pending) {
                Ok(Some(payload)) => self.process_packet(payload),
                Ok(None) => return,
                Err(e) => {
                    let err = DbError::protocol(e.to_string());
                    self.core
                        .send_error(Opcode::SessionInit.response_header(), &err);
                    self.core.set_stop();
                    return;
                }
            }
        }
    }

    fn process_packet(&mut self, payload: Bytes) {
        let core = self.core.clone();
        let mut t = core.transfer.lock();
        t.set_buffer(payload);
        let header = match t.read_i32() {
            Ok(h) => h,
            Err(e) => {
                drop(t);
                core.send_error(Opcode::SessionInit.response_header(), &e);
                core.set_stop();
                return;
            }
        };
        let (is_request, raw_op) = split_header(header);
        let result = if is_request {
            self.dispatch_request(&mut t, raw_op)
        } else {
            self.dispatch_response(&mut t, raw_op)
        };
        if let Err(e) = result {
            drop(t);
            if is_request {
                core.send_error((raw_op << 1) | 1, &e);
            } else {
                warn!(seq = core.seq, op = raw_op, error = %e, "response handling failed");
            }
            if e.is_fatal() {
                core.set_stop();
            }
        }
    }

    /// Tear the connection down: stop processing, close sessions, release
    /// the writer. Close errors are reported but not re-raised.
    pub fn close(&mut self) {
        self.core.set_stop();
        if let Err(e) = self.close_session() {
            debug!(seq = self.core.seq, error = %e, "error while closing session");
        }
        debug!(seq = self.core.seq, "connection closed");
    }

    // ---------------------------------------------------------------
    // server side: request dispatch
    // ---------------------------------------------------------------

    fn dispatch_request(&mut self, t: &mut Transfer, raw_op: i32) -> Result<(), DbError> {
        let Some(op) = Opcode::from_i32(raw_op) else {
            // protocol violation: report, then tear everything down
            let _ = self.close_session();
            return Err(DbError::protocol(format!("unknown opcode {raw_op}")));
        };
        trace!(seq = self.core.seq, op = ?op, "dispatching request");
        use Opcode::*;
        match op {
            SessionInit => self.handle_session_init(t).map_err(|e| {
                self.core.set_stop();
                e
            }),
            SessionSetId => self.handle_session_set_id(t),
            SessionSetAutoCommit => self.handle_set_auto_commit(t),
            SessionClose => self.handle_session_close(t),
            SessionCancelStatement => self.handle_cancel_statement(t),
            CommandPrepare | CommandPrepareReadParams => self.handle_prepare(t, op),
            CommandQuery | CommandDistributedTransactionQuery => {
                if op.is_distributed() {
                    self.distributed_prelude()?;
                }
                self.handle_query(t, op, false)
            }
            CommandPreparedQuery | CommandDistributedTransactionPreparedQuery => {
                if op.is_distributed() {
                    self.distributed_prelude()?;
                }
                self.handle_query(t, op, true)
            }
            CommandUpdate | CommandReplicationUpdate | CommandDistributedTransactionUpdate => {
                if op.is_distributed() {
                    self.distributed_prelude()?;
                }
                self.handle_update(t, op, false)
            }
            CommandPreparedUpdate
            | CommandReplicationPreparedUpdate
            | CommandDistributedTransactionPreparedUpdate => {
                if op.is_distributed() {
                    self.distributed_prelude()?;
                }
                self.handle_update(t, op, true)
            }
            CommandStoragePut | CommandStorageReplicationPut | CommandStorageDistributedPut => {
                if op.is_distributed() {
                    self.distributed_prelude()?;
                }
                self.handle_storage_put(t, op)
            }
            CommandStorageGet | CommandStorageDistributedGet => {
                if op.is_distributed() {
                    self.distributed_prelude()?;
                }
                self.handle_storage_get(t, op)
            }
            CommandStorageMoveLeafPage => self.handle_move_leaf_page(t, op),
            CommandStorageRemoveLeafPage => self.handle_remove_leaf_page(t, op),
            CommandGetMetaData => self.handle_get_metadata(t, op),
            CommandDistributedTransactionCommit => self.handle_commit(t, op),
            CommandDistributedTransactionRollback => self.handle_rollback(t, op),
            CommandDistributedTransactionAddSavepoint
            | CommandDistributedTransactionRollbackSavepoint => self.handle_savepoint(t, op),
            CommandDistributedTransactionValidate => self.handle_validate(t, op),
            CommandBatchStatementUpdate => self.handle_batch_update(t, op),
            CommandBatchStatementPreparedUpdate => self.handle_batch_prepared_update(t, op),
            CommandClose => self.handle_command_close(t, op),
            CommandReadLob => self.handle_read_lob(t, op),
            ResultFetchRows => self.handle_fetch_rows(t, op),
            ResultReset => self.handle_result_reset(t, op),
            ResultChangeId => self.handle_result_change_id(t, op),
            ResultClose => self.handle_result_close(t, op),
        }
    }

    fn create_session_from_info(&self, ci: &ConnectionInfo) -> Result<Arc<dyn Session>, DbError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| DbError::protocol("connection has no session factory"))?;
        let session = factory.create_session(ci)?;
        if let Some(local) = ci.property("IS_LOCAL") {
            session.set_local(local.eq_ignore_ascii_case("true"));
        }
        Ok(session)
    }

    fn get_or_create_session(&self, connection_id: i32) -> Result<Arc<dyn Session>, DbError> {
        let ci = self.connection_info.clone();
        self.core.sessions.get_or_create(connection_id, || {
            let ci = ci.ok_or_else(|| DbError::protocol("session is not initialized"))?;
            self.create_session_from_info(&ci)
        })
    }

    fn distributed_prelude(&self) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        session.set_auto_commit(false);
        session.set_root(false);
        Ok(())
    }

    fn close_session(&self) -> Result<(), DbError> {
        let mut close_error = None;
        if let Some(session) = self.core.session.write().take() {
            match session
                .prepare_statement("ROLLBACK", -1)
                .and_then(|s| s.update())
            {
                Ok(_) => {}
                Err(e) => close_error = Some(e),
            }
            session.close();
        }
        self.core.sessions.close_all();
        match close_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_session_init(&mut self, t: &mut Transfer) -> Result<(), DbError> {
        let min_client_version = t.read_i32()?;
        if min_client_version < TCP_PROTOCOL_VERSION_MIN {
            return Err(DbError::get(
                error_code::DRIVER_VERSION_ERROR,
                format!(
                    "client version {min_client_version} is below the minimum {TCP_PROTOCOL_VERSION_MIN}"
                ),
            ));
        } else if min_client_version > TCP_PROTOCOL_VERSION_MAX {
            return Err(DbError::get(
                error_code::DRIVER_VERSION_ERROR,
                format!(
                    "client version {min_client_version} is above the maximum {TCP_PROTOCOL_VERSION_MAX}"
                ),
            ));
        }
        let max_client_version = t.read_i32()?;
        let version = if max_client_version >= TCP_PROTOCOL_VERSION_MAX {
            TCP_PROTOCOL_VERSION_CURRENT
        } else {
            min_client_version
        };

        let database = t.read_string()?.unwrap_or_default();
        let url = t.read_string()?.unwrap_or_default();
        let user = t.read_string()?.unwrap_or_default().to_uppercase();
        let mut ci = ConnectionInfo::new(url, database);
        ci.user = user;
        ci.user_password_hash = t.read_bytes()?.unwrap_or_default();
        ci.file_password_hash = t.read_bytes()?.unwrap_or_default();
        ci.file_encryption_key = t.read_bytes()?.unwrap_or_default();
        let properties = t.read_i32()?;
        for _ in 0..properties {
            let key = t.read_string()?.unwrap_or_default();
            let value = t.read_string()?.unwrap_or_default();
            ci.set_property(key, value);
        }
        if let Some(base_dir) = &self.settings.base_dir {
            ci.set_base_dir(base_dir.clone());
        }
        if self.settings.if_exists {
            ci.set_property("IFEXISTS", "TRUE");
        }

        let session = self.create_session_from_info(&ci)?;
        *self.core.session.write() = Some(session);
        self.connection_info = Some(ci);
        self.client_version = version;
        t.set_version(version);

        info!(seq = self.core.seq, version, "session initialized");
        t.write_response_header(Opcode::SessionInit);
        t.write_i32(STATUS_OK).write_i32(version);
        t.flush()
    }

    fn handle_session_set_id(&mut self, t: &mut Transfer) -> Result<(), DbError> {
        self.session_id = t.read_string()?;
        let session = self.core.primary_session()?;
        t.write_response_header(Opcode::SessionSetId);
        t.write_i32(STATUS_OK).write_bool(session.is_auto_commit());
        t.flush()
    }

    fn handle_set_auto_commit(&mut self, t: &mut Transfer) -> Result<(), DbError> {
        let auto_commit = t.read_bool()?;
        let session = self.core.primary_session()?;
        session.set_auto_commit(auto_commit);
        t.write_response_header(Opcode::SessionSetAutoCommit);
        t.write_i32(STATUS_OK);
        t.flush()
    }

    fn handle_session_close(&mut self, t: &mut Transfer) -> Result<(), DbError> {
        self.core.set_stop();
        self.close_session()?;
        t.write_response_header(Opcode::SessionClose);
        t.write_i32(STATUS_OK);
        t.flush()
    }

    fn handle_cancel_statement(&mut self, t: &mut Transfer) -> Result<(), DbError> {
        let target_session_id = t.read_string()?;
        let statement_id = t.read_i32()?;
        if target_session_id.as_deref() == self.session_id.as_deref() {
            let cached = self.core.cache.lock().try_get_object(statement_id);
            if let Some(CachedObject::Statement(stmt)) = cached {
                stmt.cancel();
                stmt.close();
                self.core.cache.lock().free_object(statement_id);
                info!(seq = self.core.seq, statement_id, "statement cancelled");
            }
        }
        t.write_response_header(Opcode::SessionCancelStatement);
        t.write_i32(STATUS_OK);
        t.flush()
    }

    fn handle_prepare(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let connection_id = t.read_i32()?;
        let session = self.get_or_create_session(connection_id)?;
        let sql = t.read_string()?.unwrap_or_default();
        let old = session.modification_id();
        let stmt = session.prepare_statement(&sql, -1)?;
        stmt.set_connection_id(connection_id);
        self.core
            .cache
            .lock()
            .add_object(id, CachedObject::Statement(stmt.clone()));
        let is_query = stmt.is_query();
        t.write_response_header(op);
        t.write_i32(get_state(&session, old))
            .write_i32(id)
            .write_bool(is_query);
        if op == Opcode::CommandPrepareReadParams {
            let params = stmt.parameters();
            t.write_i32(params.len() as i32);
            for p in &params {
                t.write_i32(p.value_type());
                t.write_i64(p.precision());
                t.write_i32(p.scale());
                t.write_i32(p.nullable());
            }
        }
        t.flush()
    }

    fn set_parameters(
        &self,
        t: &mut Transfer,
        stmt: &Arc<dyn crate::engine::PreparedStatement>,
    ) -> Result<(), DbError> {
        let len = t.read_i32()?;
        let params = stmt.parameters();
        if len < 0 || len as usize > params.len() {
            return Err(DbError::protocol(format!(
                "{len} parameter values for {} parameters",
                params.len()
            )));
        }
        for p in params.iter().take(len as usize) {
            p.set_value(t.read_value()?)?;
        }
        Ok(())
    }

    fn handle_query(&mut self, t: &mut Transfer, op: Opcode, prepared: bool) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let connection_id = t.read_i32()?;
        let session = self.get_or_create_session(connection_id)?;
        let (stmt, object_id, max_rows, fetch_size, old) = if prepared {
            let object_id = t.read_i32()?;
            let max_rows = t.read_i32()?;
            let fetch_size = t.read_i32()?;
            let stmt = self.core.cache.lock().get_statement(id)?;
            stmt.set_fetch_size(fetch_size);
            self.set_parameters(t, &stmt)?;
            let old = session.modification_id();
            (stmt, object_id, max_rows, fetch_size, old)
        } else {
            let sql = t.read_string()?.unwrap_or_default();
            let object_id = t.read_i32()?;
            let max_rows = t.read_i32()?;
            let fetch_size = t.read_i32()?;
            let old = session.modification_id();
            let stmt = session.prepare_statement(&sql, fetch_size)?;
            stmt.set_connection_id(connection_id);
            self.core
                .cache
                .lock()
                .add_object(id, CachedObject::Statement(stmt.clone()));
            (stmt, object_id, max_rows, fetch_size, old)
        };

        let core = self.core.clone();
        let action = {
            let core = core.clone();
            let session = session.clone();
            let stmt = stmt.clone();
            move || -> Result<(), DbError> {
                let result = stmt.query(max_rows, false)?;
                let row_count = result.row_count();
                let column_count = result.visible_column_count();
                let shared: SharedResult = Arc::new(Mutex::new(result));
                core.cache
                    .lock()
                    .add_object(object_id, CachedObject::Result(shared.clone()));
                let mut t = core.transfer.lock();
                t.write_response_header(op);
                t.write_i32(get_state(&session, old)).write_i32(id);
                if op.is_distributed() {
                    t.write_string(&session.transaction().local_transaction_names());
                }
                t.write_i32(column_count as i32);
                t.write_i32(row_count);
                let mut result = shared.lock();
                for column in 0..column_count {
                    write_column(&mut t, &**result, column);
                }
                let fetch = if row_count != -1 {
                    row_count.min(fetch_size)
                } else {
                    fetch_size
                };
                write_row(&mut t, &mut **result, fetch)?;
                t.flush()
            }
        };
        core.command_queue
            .push(PreparedCommand::new(op, session, stmt, action));
        self.schedule();
        Ok(())
    }

    fn handle_update(&mut self, t: &mut Transfer, op: Opcode, prepared: bool) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let connection_id = t.read_i32()?;
        let session = self.get_or_create_session(connection_id)?;
        let (stmt, old) = if prepared {
            if op == Opcode::CommandReplicationPreparedUpdate {
                let name = t.read_string()?.unwrap_or_default();
                session.set_replication_name(&name);
            }
            let stmt = self.core.cache.lock().get_statement(id)?;
            self.set_parameters(t, &stmt)?;
            let old = session.modification_id();
            (stmt, old)
        } else {
            let sql = t.read_string()?.unwrap_or_default();
            let old = session.modification_id();
            if op == Opcode::CommandReplicationUpdate {
                let name = t.read_string()?.unwrap_or_default();
                session.set_replication_name(&name);
            }
            let stmt = session.prepare_statement(&sql, -1)?;
            stmt.set_connection_id(connection_id);
            self.core
                .cache
                .lock()
                .add_object(id, CachedObject::Statement(stmt.clone()));
            (stmt, old)
        };

        let core = self.core.clone();
        let action = {
            let core = core.clone();
            let session = session.clone();
            let stmt = stmt.clone();
            move || -> Result<(), DbError> {
                let update_count = stmt.update()?;
                let mut t = core.transfer.lock();
                t.write_response_header(op);
                t.write_i32(get_state(&session, old)).write_i32(id);
                if op.is_distributed() {
                    t.write_string(&session.transaction().local_transaction_names());
                }
                t.write_i32(update_count);
                t.flush()
            }
        };
        core.command_queue
            .push(PreparedCommand::new(op, session, stmt, action));
        self.schedule();
        Ok(())
    }

    fn schedule(&self) {
        if let Some(handler) = &self.handler {
            handler.schedule(self.core.seq, self.core.clone());
        }
    }

    fn handle_storage_put(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let map_name = t.read_string()?.unwrap_or_default();
        let key = t
            .read_bytes()?
            .ok_or_else(|| DbError::protocol("null storage key"))?;
        let value = t
            .read_bytes()?
            .ok_or_else(|| DbError::protocol("null storage value"))?;
        let old = session.modification_id();
        if op == Opcode::CommandStorageReplicationPut {
            let name = t.read_string()?.unwrap_or_default();
            session.set_replication_name(&name);
        }
        let map = session.get_storage_map(&map_name)?;
        let k = map.key_type().read(&key)?;
        let v = map.value_type().read(&value)?;
        let previous = map.put(k, v)?;
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        if op == Opcode::CommandStorageDistributedPut {
            t.write_string(&session.transaction().local_transaction_names());
        }
        let encoded = map.value_type().write(&previous.unwrap_or(Value::Null));
        t.write_byte_buffer(&encoded);
        t.flush()
    }

    fn handle_storage_get(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let map_name = t.read_string()?.unwrap_or_default();
        let key = t
            .read_bytes()?
            .ok_or_else(|| DbError::protocol("null storage key"))?;
        let old = session.modification_id();
        let map = session.get_storage_map(&map_name)?;
        let k = map.key_type().read(&key)?;
        let result = map.get(&k)?;
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        if op == Opcode::CommandStorageDistributedGet {
            t.write_string(&session.transaction().local_transaction_names());
        }
        let encoded = map.value_type().write(&result.unwrap_or(Value::Null));
        t.write_byte_buffer(&encoded);
        t.flush()
    }

    fn handle_move_leaf_page(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let map_name = t.read_string()?.unwrap_or_default();
        let split_key = t.read_byte_buffer()?;
        let page = t.read_byte_buffer()?;
        let old = session.modification_id();
        let map = session.get_storage_map(&map_name)?;
        if let Some(replication) = map.as_replication() {
            replication.add_leaf_page(split_key, page)?;
        }
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        t.flush()
    }

    fn handle_remove_leaf_page(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let map_name = t.read_string()?.unwrap_or_default();
        let key = t.read_byte_buffer()?;
        let old = session.modification_id();
        let map = session.get_storage_map(&map_name)?;
        if let Some(replication) = map.as_replication() {
            replication.remove_leaf_page(key)?;
        }
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        t.flush()
    }

    fn handle_get_metadata(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let object_id = t.read_i32()?;
        let stmt = self.core.cache.lock().get_statement(id)?;
        let result = stmt.metadata()?;
        let column_count = result.visible_column_count();
        let shared: SharedResult = Arc::new(Mutex::new(result));
        self.core
            .cache
            .lock()
            .add_object(object_id, CachedObject::Result(shared.clone()));
        t.write_response_header(op);
        t.write_i32(STATUS_OK)
            .write_i32(id)
            .write_i32(column_count as i32)
            .write_i32(0);
        let result = shared.lock();
        for column in 0..column_count {
            write_column(t, &**result, column);
        }
        t.flush()
    }

    fn handle_commit(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let old = session.modification_id();
        let tx_names = t.read_string()?;
        session.commit(false, tx_names.as_deref())?;
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        t.flush()
    }

    fn handle_rollback(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let old = session.modification_id();
        session.rollback()?;
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        t.flush()
    }

    fn handle_savepoint(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let old = session.modification_id();
        let name = t.read_string()?.unwrap_or_default();
        if op == Opcode::CommandDistributedTransactionAddSavepoint {
            session.add_savepoint(&name)?;
        } else {
            session.rollback_to_savepoint(&name)?;
        }
        t.write_response_header(op);
        t.write_i32(get_state(&session, old));
        t.flush()
    }

    fn handle_validate(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let old = session.modification_id();
        let name = t.read_string()?.unwrap_or_default();
        let is_valid = session.validate_transaction(&name)?;
        t.write_response_header(op);
        t.write_i32(get_state(&session, old)).write_bool(is_valid);
        t.flush()
    }

    fn handle_batch_update(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let size = t.read_i32()?;
        if size < 0 {
            return Err(DbError::protocol("negative batch size"));
        }
        let old = session.modification_id();
        let mut results = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let sql = t.read_string()?.unwrap_or_default();
            let count = session
                .prepare_statement(&sql, -1)
                .and_then(|stmt| stmt.update())
                .unwrap_or(EXECUTE_FAILED);
            results.push(count);
        }
        write_batch_result(t, op, &session, old, &results)
    }

    fn handle_batch_prepared_update(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let connection_id = t.read_i32()?;
        let session = self.get_or_create_session(connection_id)?;
        let size = t.read_i32()?;
        if size < 0 {
            return Err(DbError::protocol("negative batch size"));
        }
        let stmt = self.core.cache.lock().get_statement(id)?;
        let params = stmt.parameters();
        let old = session.modification_id();
        let mut results = Vec::with_capacity(size as usize);
        for _ in 0..size {
            for p in &params {
                p.set_value(t.read_value()?)?;
            }
            results.push(stmt.update().unwrap_or(EXECUTE_FAILED));
        }
        write_batch_result(t, op, &session, old, &results)
    }

    fn handle_command_close(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let cached = self.core.cache.lock().try_get_object(id);
        if let Some(CachedObject::Statement(stmt)) = cached {
            stmt.close();
            self.core.cache.lock().free_object(id);
        }
        t.write_response_header(op);
        t.write_i32(STATUS_OK);
        t.flush()
    }

    fn handle_read_lob(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let session = self.core.primary_session()?;
        let capacity = self
            .settings
            .cached_objects
            .max(self.settings.fetch_size * 5);
        let lobs = self.lobs.get_or_insert_with(|| LobCache::new(capacity));

        let lob_id = t.read_i64()?;
        let hmac = t
            .read_bytes()?
            .ok_or_else(|| DbError::protocol("lob read without MAC"))?;
        let offset = t.read_i64()?;
        let length = t.read_i32()?;
        t.verify_lob_mac(&hmac, lob_id)?;

        let continuation = matches!(lobs.get_mut(lob_id), Some(reader) if reader.pos() == offset);
        if !continuation {
            let storage = session.lob_storage()?;
            let stream = storage.open_input_stream(lob_id, &hmac)?;
            let mut reader = CachedReader::new(stream);
            reader.skip(offset)?;
            lobs.put(lob_id, reader);
            debug!(seq = self.core.seq, lob_id, offset, "opened lob stream");
        }

        let length = (length.max(0) as usize).min(16 * IO_BUFFER_SIZE);
        let mut buf = vec![0u8; length];
        let reader = lobs
            .get_mut(lob_id)
            .ok_or_else(|| DbError::general(format!("lob {lob_id} stream is gone")))?;
        let read = reader.read_fully(&mut buf)?;

        t.write_response_header(op);
        t.write_i32(STATUS_OK).write_i32(read as i32);
        t.write_bytes(&buf[..read]);
        t.flush()
    }

    fn handle_fetch_rows(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let count = t.read_i32()?;
        let result = self.core.cache.lock().get_result(id)?;
        t.write_response_header(op);
        t.write_i32(STATUS_OK);
        let mut result = result.lock();
        write_row(t, &mut **result, count)?;
        t.flush()
    }

    fn handle_result_reset(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let result = self.core.cache.lock().get_result(id)?;
        result.lock().reset();
        t.write_response_header(op);
        t.write_i32(STATUS_OK);
        t.flush()
    }

    fn handle_result_change_id(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let old_id = t.read_i32()?;
        let new_id = t.read_i32()?;
        let mut cache = self.core.cache.lock();
        let obj = cache.get_object(old_id)?;
        cache.free_object(old_id);
        cache.add_object(new_id, obj);
        drop(cache);
        t.write_response_header(op);
        t.write_i32(STATUS_OK);
        t.flush()
    }

    fn handle_result_close(&mut self, t: &mut Transfer, op: Opcode) -> Result<(), DbError> {
        let id = t.read_i32()?;
        let cached = self.core.cache.lock().try_get_object(id);
        if let Some(CachedObject::Result(result)) = cached {
            result.lock().close();
            self.core.cache.lock().free_object(id);
        }
        t.write_response_header(op);
        t.write_i32(STATUS_OK);
        t.flush()
    }
}

fn write_batch_result(
    t: &mut Transfer,
    op: Opcode,
    session: &Arc<dyn Session>,
    old_modification_id: u64,
    results: &[i32],
) -> Result<(), DbError> {
    t.write_response_header(op);
    t.write_i32(get_state(session, old_modification_id));
    for count in results {
        t.write_i32(*count);
    }
    t.flush()
}

/// Drive a connection over a stream: a writer task drains flushed frames
/// while the read loop feeds chunks into the dispatcher. Returns when the
/// peer disconnects or the connection stops itself.
pub async fn run_connection<S>(
    mut conn: Connection,
    stream: S,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let seq = conn.seq();
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(seq, error = %e, "connection writer failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut packets = FramedRead::new(
        read_half,
        PacketReassembler::new(conn.settings.max_packet_size),
    );
    loop {
        if conn.is_stopped() {
            break;
        }
        match packets.next().await {
            Some(Ok(payload)) => conn.process_packet(payload),
            Some(Err(e)) => {
                let err = DbError::protocol(e.to_string());
                conn.core
                    .send_error(Opcode::SessionInit.response_header(), &err);
                conn.close();
                return Err(e);
            }
            None => break,
        }
    }
    conn.close();
    Ok(())
}
