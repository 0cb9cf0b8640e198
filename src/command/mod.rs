//! Deferred command execution.
//!
//! The reactor never blocks on the database: query and update requests are
//! packaged as [`PreparedCommand`] units, pushed onto the connection's FIFO
//! and scheduled onto a shared [`CommandHandler`] pool. Each connection is
//! pinned to one worker (by its sequence number), so replies for a
//! connection leave in the order its requests were dispatched.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::engine::{PreparedStatement, Session};
use crate::error::DbError;
use crate::protocol::Opcode;

/// One unit of deferred work: a statement execution plus the response
/// write, bound to the session it runs against. Exactly one execution
/// attempt; failures are turned into wire error frames by the owner.
pub struct PreparedCommand {
    pub op: Opcode,
    pub session: Arc<dyn Session>,
    pub statement: Arc<dyn PreparedStatement>,
    action: Box<dyn FnOnce() -> Result<(), DbError> + Send>,
}

impl PreparedCommand {
    pub fn new(
        op: Opcode,
        session: Arc<dyn Session>,
        statement: Arc<dyn PreparedStatement>,
        action: impl FnOnce() -> Result<(), DbError> + Send + 'static,
    ) -> Self {
        Self {
            op,
            session,
            statement,
            action: Box::new(action),
        }
    }

    pub fn run(self) -> Result<(), DbError> {
        (self.action)()
    }
}

/// Per-connection FIFO of deferred commands.
pub struct CommandQueue {
    inner: Mutex<VecDeque<PreparedCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, command: PreparedCommand) {
        self.inner.lock().push_back(command);
    }

    pub fn pop(&self) -> Option<PreparedCommand> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Something a worker can ask to make progress: pop one queued command and
/// run it, converting failures to wire errors. Implemented by the
/// connection core.
pub trait CommandTarget: Send + Sync {
    fn execute_one_command(&self);
}

/// Shared pool of command workers.
///
/// Workers are plain threads: engine calls are synchronous and may touch
/// the disk, so they must stay off the async reactor. Scheduling a target
/// is a non-blocking channel send; a connection's sequence number picks the
/// worker, which keeps per-connection execution single-flight and FIFO.
pub struct CommandHandler {
    senders: Vec<mpsc::UnboundedSender<Arc<dyn CommandTarget>>>,
}

impl CommandHandler {
    pub fn start(workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<Arc<dyn CommandTarget>>();
            senders.push(tx);
            thread::Builder::new()
                .name(format!("command-handler-{index}"))
                .spawn(move || {
                    trace!(worker = index, "command worker started");
                    while let Some(target) = rx.blocking_recv() {
                        target.execute_one_command();
                    }
                    trace!(worker = index, "command worker stopped");
                })
                .expect("failed to spawn command worker");
        }
        debug!(workers, "command handler pool started");
        Arc::new(Self { senders })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Wake the worker this connection is pinned to.
    pub fn schedule(&self, affinity: u64, target: Arc<dyn CommandTarget>) {
        let index = (affinity % self.senders.len() as u64) as usize;
        if self.senders[index].send(target).is_err() {
            warn!(worker = index, "command worker is gone, dropping work");
        }
    }
}
