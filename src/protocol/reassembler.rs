use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Reassembles arbitrary TCP chunks into whole protocol packets.
///
/// Yields the payload of each packet (the 4-byte length prefix stripped) in
/// exactly the order the bytes arrived. Partial frames stay in the source
/// buffer until the rest shows up; frames larger than `max_frame` are a
/// protocol violation and surface as an error.
#[derive(Debug, Clone)]
pub struct PacketReassembler {
    max_frame: usize,
}

impl PacketReassembler {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for PacketReassembler {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit of {}", self.max_frame),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}
