use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;

use super::opcode::Opcode;
use crate::error::DbError;

type HmacSha256 = Hmac<Sha256>;

/// Length of the per-connection LOB MAC key.
pub const LOB_MAC_KEY_LENGTH: usize = 16;
/// Length of a LOB MAC tag on the wire (HMAC-SHA256).
pub const LOB_MAC_LENGTH: usize = 32;

/// Outbound half of a [`Transfer`]: flushed frames are handed to a writer
/// task over a channel so frame producers never block on the socket.
#[derive(Clone)]
pub struct TransferSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl TransferSink {
    pub fn send(&self, frame: Bytes) -> Result<(), DbError> {
        self.tx
            .send(frame)
            .map_err(|_| DbError::protocol("connection writer is gone"))
    }
}

/// Create a sink and the receiving end a writer task drains.
pub fn transfer_channel() -> (TransferSink, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransferSink { tx }, rx)
}

/// The frame codec. One per connection.
///
/// All multi-byte integers are big-endian. A frame is `u32 length` followed
/// by `length` payload bytes; the payload of a request or response begins
/// with `opcode << 1 | direction`.
///
/// The read side operates over the payload of the packet currently being
/// dispatched (`set_buffer`). The write side builds exactly one outbound
/// frame at a time: a header entry point starts the frame, `flush` patches
/// the length prefix and sends it, and `reset` discards everything written
/// since the frame began so an error frame can replace a partial response.
pub struct Transfer {
    input: Bytes,
    out: BytesMut,
    sink: TransferSink,
    version: i32,
    lob_mac_key: [u8; LOB_MAC_KEY_LENGTH],
    /// Only the endpoint that issued the MACs checks them; its peer
    /// carries the tags as opaque bytes.
    verify_lobs: bool,
}

impl Transfer {
    pub fn new(sink: TransferSink) -> Self {
        let mut lob_mac_key = [0u8; LOB_MAC_KEY_LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut lob_mac_key[..]);
        let mut t = Self {
            input: Bytes::new(),
            out: BytesMut::with_capacity(4 * 1024),
            sink,
            version: super::TCP_PROTOCOL_VERSION_1,
            lob_mac_key,
            verify_lobs: true,
        };
        t.reset();
        t
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    /// Point the read side at the payload of the next packet.
    pub fn set_buffer(&mut self, payload: Bytes) {
        self.input = payload;
    }

    pub fn remaining(&self) -> usize {
        self.input.remaining()
    }

    fn need(&self, n: usize) -> Result<(), DbError> {
        if self.input.remaining() < n {
            return Err(DbError::protocol(format!(
                "truncated frame: need {n} bytes, {} left",
                self.input.remaining()
            )));
        }
        Ok(())
    }

    // -- primitive readers ---------------------------------------------

    pub fn read_byte(&mut self) -> Result<u8, DbError> {
        self.need(1)?;
        Ok(self.input.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, DbError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, DbError> {
        self.need(4)?;
        Ok(self.input.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, DbError> {
        self.need(8)?;
        Ok(self.input.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32, DbError> {
        self.need(4)?;
        Ok(self.input.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64, DbError> {
        self.need(8)?;
        Ok(self.input.get_f64())
    }

    /// Length-prefixed UTF-8 string; length `-1` encodes null.
    pub fn read_string(&mut self) -> Result<Option<String>, DbError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len)?;
        let raw = self.input.split_to(len);
        let s = std::str::from_utf8(&raw)
            .map_err(|e| DbError::protocol(format!("invalid UTF-8 in string field: {e}")))?;
        Ok(Some(s.to_owned()))
    }

    /// Length-prefixed byte array; length `-1` encodes null.
    pub fn read_bytes(&mut self) -> Result<Option<Bytes>, DbError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len)?;
        Ok(Some(self.input.split_to(len)))
    }

    /// A raw sized blob. Same layout as a byte array, but null is not a
    /// legal value.
    pub fn read_byte_buffer(&mut self) -> Result<Bytes, DbError> {
        self.read_bytes()?
            .ok_or_else(|| DbError::protocol("null byte buffer"))
    }

    // -- primitive writers ---------------------------------------------

    pub fn write_byte(&mut self, v: u8) -> &mut Self {
        self.out.put_u8(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.out.put_u8(v as u8);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.out.put_i32(v);
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.out.put_i64(v);
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.out.put_f32(v);
        self
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.out.put_f64(v);
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.out.put_i32(s.len() as i32);
        self.out.extend_from_slice(s.as_bytes());
        self
    }

    pub fn write_nullable_string(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            Some(s) => self.write_string(s),
            None => {
                self.out.put_i32(-1);
                self
            }
        }
    }

    pub fn write_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.out.put_i32(b.len() as i32);
        self.out.extend_from_slice(b);
        self
    }

    pub fn write_nullable_bytes(&mut self, b: Option<&[u8]>) -> &mut Self {
        match b {
            Some(b) => self.write_bytes(b),
            None => {
                self.out.put_i32(-1);
                self
            }
        }
    }

    pub fn write_byte_buffer(&mut self, b: &[u8]) -> &mut Self {
        self.write_bytes(b)
    }

    // -- framing --------------------------------------------------------

    /// Discard everything written into the current outbound frame and
    /// rewind to its start, keeping only the length placeholder.
    pub fn reset(&mut self) {
        self.out.clear();
        self.out.put_u32(0);
    }

    pub fn write_request_header(&mut self, op: Opcode) -> &mut Self {
        self.reset();
        self.write_i32(op.request_header())
    }

    pub fn write_response_header(&mut self, op: Opcode) -> &mut Self {
        self.reset();
        self.write_i32(op.response_header())
    }

    /// Start an outbound frame from a raw header int. Used when echoing a
    /// header the opcode table does not know.
    pub fn write_raw_header(&mut self, header: i32) -> &mut Self {
        self.reset();
        self.write_i32(header)
    }

    /// Patch the length prefix and hand the finished frame to the writer.
    pub fn flush(&mut self) -> Result<(), DbError> {
        debug_assert!(self.out.len() >= 4, "flush before any frame was started");
        let len = (self.out.len() - 4) as u32;
        self.out[..4].copy_from_slice(&len.to_be_bytes());
        let frame = self.out.split().freeze();
        self.reset();
        self.sink.send(frame)
    }

    // -- LOB MAC --------------------------------------------------------

    pub fn lob_mac_key(&self) -> &[u8; LOB_MAC_KEY_LENGTH] {
        &self.lob_mac_key
    }

    /// Connections that talk to each other must agree on the key; the
    /// client copies the server session's key out of band.
    pub fn set_lob_mac_key(&mut self, key: [u8; LOB_MAC_KEY_LENGTH]) {
        self.lob_mac_key = key;
    }

    pub fn verifies_lobs(&self) -> bool {
        self.verify_lobs
    }

    pub fn set_verify_lobs(&mut self, verify: bool) {
        self.verify_lobs = verify;
    }

    pub fn calculate_lob_mac(&self, lob_id: i64) -> Bytes {
        let mut mac = HmacSha256::new_from_slice(&self.lob_mac_key)
            .expect("HMAC accepts any key length");
        mac.update(&lob_id.to_be_bytes());
        Bytes::copy_from_slice(&mac.finalize().into_bytes())
    }

    pub fn verify_lob_mac(&self, tag: &[u8], lob_id: i64) -> Result<(), DbError> {
        let mut mac = HmacSha256::new_from_slice(&self.lob_mac_key)
            .expect("HMAC accepts any key length");
        mac.update(&lob_id.to_be_bytes());
        mac.verify_slice(tag)
            .map_err(|_| DbError::protocol(format!("invalid MAC for lob {lob_id}")))
    }
}
