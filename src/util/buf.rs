use bytes::{Buf, BufMut};
use crate::error::SessionError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Strings on the wire are a u32 byte length followed by UTF-8 bytes
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    let len: u32 = s.len().prechecked_cast();
    buf.put_u32(len);
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> Result<String, SessionError> {
    let len: usize = buf.try_get_u32()?.safe_cast();
    if len > buf.remaining() {
        return Err(SessionError::Framing(format!("string length {} exceeds remaining {} bytes", len, buf.remaining())));
    }

    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw)
        .map_err(|e| SessionError::Framing(format!("string is not valid UTF-8: {}", e)))
}
