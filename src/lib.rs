//! HermesDB network layer.
//!
//! Implements the length-prefixed binary protocol that multiplexes logical
//! database sessions over one TCP connection: framing and the typed value
//! codec, the per-connection opcode dispatcher, deferred command execution
//! on a shared worker pool, client-side response correlation, and the
//! per-connection LOB streaming cache.
//!
//! The SQL and storage engines are reached exclusively through the traits
//! in [`engine`]; the TCP acceptor and TLS setup live with the embedding
//! server.

pub mod command;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod protocol;

pub use command::{CommandHandler, CommandQueue, PreparedCommand};
pub use config::{load_config, NetConfig};
pub use connection::{run_connection, Connection, ConnectionSettings};
pub use engine::ConnectionInfo;
pub use error::DbError;
pub use protocol::{transfer_channel, Opcode, Transfer, TransferSink, Value};
