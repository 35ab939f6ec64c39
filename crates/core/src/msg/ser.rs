//! Serializer primitives for the binary protocol.
//!
//! Every encodable entity reports its exact byte count through
//! [`ToSerial::serial_size`] before writing, so message buffers are
//! allocated once at the exact size and never grow. Integers are stored
//! little-endian with no padding between fields; strings are written as
//! their UTF-8 bytes followed by a single NUL. A missing (`None`) string
//! is written as a lone NUL.

use bytes::{BufMut, BytesMut};

/// Binary encoding of an entity into a pre-sized buffer.
pub trait ToSerial {
    /// Exact number of bytes [`ToSerial::to_serial`] will append.
    fn serial_size(&self) -> usize;

    /// Append the binary representation to `buf`.
    fn to_serial(&self, buf: &mut BytesMut);
}

/// Byte count of a NUL-terminated string field.
pub fn str_serial_size(s: Option<&str>) -> usize {
    s.map(str::len).unwrap_or(0) + 1
}

/// Append a NUL-terminated string field.
pub fn put_str(buf: &mut BytesMut, s: Option<&str>) {
    if let Some(s) = s {
        buf.put_slice(s.as_bytes());
    }
    buf.put_u8(0);
}

/// Serialize an entity into a fresh buffer of exactly [`ToSerial::serial_size`] bytes.
pub fn to_serial_vec<T: ToSerial>(value: &T) -> BytesMut {
    let mut buf = BytesMut::with_capacity(value.serial_size());
    value.to_serial(&mut buf);
    debug_assert_eq!(buf.len(), value.serial_size());
    buf
}
