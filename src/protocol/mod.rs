pub mod opcode;
pub mod reassembler;
pub mod transfer;
pub mod value;

pub use opcode::{split_header, Opcode};
pub use reassembler::PacketReassembler;
pub use transfer::{transfer_channel, Transfer, TransferSink, LOB_MAC_LENGTH};
pub use value::{LobRef, Value};

/// Response status codes. The first i32 of a response payload after the
/// opcode header; values are contractual.
pub const STATUS_OK: i32 = 1;
pub const STATUS_ERROR: i32 = 2;
pub const STATUS_CLOSED: i32 = 3;
pub const STATUS_OK_STATE_CHANGED: i32 = 4;

/// Protocol version negotiation bounds.
pub const TCP_PROTOCOL_VERSION_1: i32 = 1;
pub const TCP_PROTOCOL_VERSION_MIN: i32 = 1;
pub const TCP_PROTOCOL_VERSION_MAX: i32 = 2;
pub const TCP_PROTOCOL_VERSION_CURRENT: i32 = 2;

/// Sentinel update count for a failed item inside a batch.
pub const EXECUTE_FAILED: i32 = -3;

/// Unit for the LOB read cap: a single `READ_LOB` answer carries at most
/// `16 * IO_BUFFER_SIZE` bytes.
pub const IO_BUFFER_SIZE: usize = 4096;

/// Default object-cache capacity per connection.
pub const SERVER_CACHED_OBJECTS: usize = 64;

/// Default result-set fetch size; also the floor (×5) for LOB cache sizing.
pub const SERVER_RESULT_SET_FETCH_SIZE: usize = 100;

/// Default cap on a single frame's declared payload length.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
