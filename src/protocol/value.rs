use bytes::Bytes;

use super::transfer::Transfer;
use crate::error::{error_code, DbError};

/// Value type tags on the wire. One byte each, contractual.
pub mod tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const BYTE: u8 = 2;
    pub const SHORT: u8 = 3;
    pub const INT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DECIMAL: u8 = 6;
    pub const DOUBLE: u8 = 7;
    pub const FLOAT: u8 = 8;
    pub const STRING: u8 = 9;
    pub const BYTES: u8 = 10;
    pub const BLOB: u8 = 11;
    pub const CLOB: u8 = 12;
    pub const ARRAY: u8 = 13;
}

/// Reference to a large object held by the server. No bytes travel inline;
/// the client streams the content with `COMMAND_READ_LOB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobRef {
    pub lob_id: i64,
    pub length: i64,
    pub hmac: Bytes,
    pub precision: i64,
}

/// A typed SQL value as it crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    /// Arbitrary-precision decimals travel as their canonical string form.
    Decimal(String),
    Double(f64),
    Float(f32),
    String(String),
    Bytes(Bytes),
    Blob(LobRef),
    Clob(LobRef),
    Array(Vec<Value>),
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => tag::NULL,
            Value::Boolean(_) => tag::BOOLEAN,
            Value::Byte(_) => tag::BYTE,
            Value::Short(_) => tag::SHORT,
            Value::Int(_) => tag::INT,
            Value::Long(_) => tag::LONG,
            Value::Decimal(_) => tag::DECIMAL,
            Value::Double(_) => tag::DOUBLE,
            Value::Float(_) => tag::FLOAT,
            Value::String(_) => tag::STRING,
            Value::Bytes(_) => tag::BYTES,
            Value::Blob(_) => tag::BLOB,
            Value::Clob(_) => tag::CLOB,
            Value::Array(_) => tag::ARRAY,
        }
    }
}

impl Transfer {
    pub fn write_value(&mut self, v: &Value) {
        self.write_byte(v.tag());
        match v {
            Value::Null => {}
            Value::Boolean(b) => {
                self.write_bool(*b);
            }
            Value::Byte(b) => {
                self.write_byte(*b as u8);
            }
            Value::Short(s) => {
                self.write_i32(*s as i32);
            }
            Value::Int(i) => {
                self.write_i32(*i);
            }
            Value::Long(l) => {
                self.write_i64(*l);
            }
            Value::Decimal(d) => {
                self.write_string(d);
            }
            Value::Double(d) => {
                self.write_f64(*d);
            }
            Value::Float(f) => {
                self.write_f32(*f);
            }
            Value::String(s) => {
                self.write_string(s);
            }
            Value::Bytes(b) => {
                self.write_bytes(b);
            }
            Value::Blob(lob) | Value::Clob(lob) => {
                self.write_i64(lob.length);
                self.write_i64(lob.lob_id);
                self.write_bytes(&lob.hmac);
                self.write_i64(lob.precision);
            }
            Value::Array(items) => {
                self.write_i32(items.len() as i32);
                for item in items {
                    self.write_value(item);
                }
            }
        }
    }

    pub fn read_value(&mut self) -> Result<Value, DbError> {
        let t = self.read_byte()?;
        Ok(match t {
            tag::NULL => Value::Null,
            tag::BOOLEAN => Value::Boolean(self.read_bool()?),
            tag::BYTE => Value::Byte(self.read_byte()? as i8),
            tag::SHORT => Value::Short(self.read_i32()? as i16),
            tag::INT => Value::Int(self.read_i32()?),
            tag::LONG => Value::Long(self.read_i64()?),
            tag::DECIMAL => Value::Decimal(
                self.read_string()?
                    .ok_or_else(|| DbError::protocol("null decimal body"))?,
            ),
            tag::DOUBLE => Value::Double(self.read_f64()?),
            tag::FLOAT => Value::Float(self.read_f32()?),
            tag::STRING => Value::String(
                self.read_string()?
                    .ok_or_else(|| DbError::protocol("null string body"))?,
            ),
            tag::BYTES => Value::Bytes(
                self.read_bytes()?
                    .ok_or_else(|| DbError::protocol("null bytes body"))?,
            ),
            tag::BLOB | tag::CLOB => {
                let lob = self.read_lob_ref()?;
                if t == tag::BLOB {
                    Value::Blob(lob)
                } else {
                    Value::Clob(lob)
                }
            }
            tag::ARRAY => {
                let len = self.read_i32()?;
                if len < 0 {
                    return Err(DbError::protocol("negative array length"));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Value::Array(items)
            }
            other => {
                return Err(DbError::get(
                    error_code::UNKNOWN_DATA_TYPE,
                    format!("unknown value tag {other}"),
                ))
            }
        })
    }

    fn read_lob_ref(&mut self) -> Result<LobRef, DbError> {
        let length = self.read_i64()?;
        let lob_id = self.read_i64()?;
        let hmac = self
            .read_bytes()?
            .ok_or_else(|| DbError::protocol("lob without MAC"))?;
        let precision = self.read_i64()?;
        if self.verifies_lobs() {
            self.verify_lob_mac(&hmac, lob_id)?;
        }
        Ok(LobRef {
            lob_id,
            length,
            hmac,
            precision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transfer::transfer_channel;
    use crate::protocol::Opcode;

    fn round_trip(values: &[Value]) -> Vec<Value> {
        let (sink, mut rx) = transfer_channel();
        let mut t = Transfer::new(sink);
        t.write_request_header(Opcode::CommandQuery);
        for v in values {
            t.write_value(v);
        }
        t.flush().unwrap();
        let frame = rx.try_recv().unwrap();
        t.set_buffer(frame.slice(4..));
        t.read_i32().unwrap();
        values.iter().map(|_| t.read_value().unwrap()).collect()
    }

    #[test]
    fn scalar_values_round_trip() {
        let values = vec![
            Value::Null,
            Value::Boolean(true),
            Value::Byte(-3),
            Value::Short(1024),
            Value::Int(-1),
            Value::Long(i64::MIN),
            Value::Decimal("3.14159265358979323846".into()),
            Value::Double(2.5),
            Value::Float(-0.5),
            Value::String("snow ❄".into()),
            Value::Bytes(Bytes::from_static(b"\xde\xad")),
            Value::Array(vec![Value::Int(1), Value::Null, Value::String("x".into())]),
        ];
        assert_eq!(round_trip(&values), values);
    }

    #[test]
    fn lob_values_verify_their_mac() {
        let (sink, mut rx) = transfer_channel();
        let mut t = Transfer::new(sink);
        let lob = LobRef {
            lob_id: 42,
            length: 1 << 20,
            hmac: t.calculate_lob_mac(42),
            precision: -1,
        };
        t.write_request_header(Opcode::CommandQuery);
        t.write_value(&Value::Blob(lob.clone()));
        t.flush().unwrap();
        let frame = rx.try_recv().unwrap();
        t.set_buffer(frame.slice(4..));
        t.read_i32().unwrap();
        assert_eq!(t.read_value().unwrap(), Value::Blob(lob));
    }

    #[test]
    fn forged_lob_mac_is_rejected() {
        let (sink, mut rx) = transfer_channel();
        let mut t = Transfer::new(sink);
        let lob = LobRef {
            lob_id: 42,
            length: 10,
            hmac: Bytes::from(vec![0u8; 32]),
            precision: -1,
        };
        t.write_request_header(Opcode::CommandQuery);
        t.write_value(&Value::Blob(lob));
        t.flush().unwrap();
        let frame = rx.try_recv().unwrap();
        t.set_buffer(frame.slice(4..));
        t.read_i32().unwrap();
        assert!(t.read_value().unwrap_err().is_fatal());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let (sink, _rx) = transfer_channel();
        let mut t = Transfer::new(sink);
        t.set_buffer(Bytes::from_static(&[200]));
        let e = t.read_value().unwrap_err();
        assert_eq!(e.code, error_code::UNKNOWN_DATA_TYPE);
    }
}
