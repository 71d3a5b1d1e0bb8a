//! Application message header: `[2-byte message id][payload]` inside a frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Size of the message id prefix carried at the start of every frame.
pub const MSG_ID_LEN: usize = 2;

/// Byte order used for both the frame length prefix and the message id.
///
/// Serialized as `"big"` / `"little"` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    #[default]
    #[serde(rename = "big")]
    BigEndian,
    #[serde(rename = "little")]
    LittleEndian,
}

impl ByteOrder {
    /// Appends `value` to `dst` in this byte order.
    pub fn put_u16(self, dst: &mut BytesMut, value: u16) {
        match self {
            Self::BigEndian => dst.put_u16(value),
            Self::LittleEndian => dst.put_u16_le(value),
        }
    }

    /// Reads a `u16` from the first two bytes of `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src` is shorter than two bytes. Callers check the length first.
    #[must_use]
    pub fn read_u16(self, src: &[u8]) -> u16 {
        let raw = [src[0], src[1]];
        match self {
            Self::BigEndian => u16::from_be_bytes(raw),
            Self::LittleEndian => u16::from_le_bytes(raw),
        }
    }
}

/// A routed application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Route key used to pick the handler.
    pub msg_id: u16,
    /// Opaque handler payload.
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(msg_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_id,
            payload: payload.into(),
        }
    }

    /// Serializes the message as `[msg_id][payload]`, ready to be framed.
    #[must_use]
    pub fn pack(&self, order: ByteOrder) -> Bytes {
        let mut buf = BytesMut::with_capacity(MSG_ID_LEN + self.payload.len());
        order.put_u16(&mut buf, self.msg_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Splits a decoded frame into its message id and payload without copying.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Truncated` if the frame cannot hold a message id.
    pub fn parse(mut frame: Bytes, order: ByteOrder) -> Result<Self, CodecError> {
        if frame.len() < MSG_ID_LEN {
            return Err(CodecError::Truncated { len: frame.len() });
        }
        let msg_id = order.read_u16(&frame);
        frame.advance(MSG_ID_LEN);
        Ok(Self {
            msg_id,
            payload: frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_is_big_endian() {
        assert_eq!(ByteOrder::default(), ByteOrder::BigEndian);
    }

    #[test]
    fn pack_big_endian_header() {
        let msg = Message::new(0x0102, &b"hi"[..]);
        assert_eq!(&msg.pack(ByteOrder::BigEndian)[..], &[0x01, 0x02, b'h', b'i']);
    }

    #[test]
    fn pack_little_endian_header() {
        let msg = Message::new(0x0102, &b"hi"[..]);
        assert_eq!(&msg.pack(ByteOrder::LittleEndian)[..], &[0x02, 0x01, b'h', b'i']);
    }

    #[test]
    fn parse_splits_id_and_payload() {
        let frame = Bytes::from_static(&[0x00, 0x07, 1, 2, 3]);
        let msg = Message::parse(frame, ByteOrder::BigEndian).unwrap();
        assert_eq!(msg.msg_id, 7);
        assert_eq!(&msg.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn parse_accepts_empty_payload() {
        let msg = Message::parse(Bytes::from_static(&[0x07, 0x00]), ByteOrder::LittleEndian).unwrap();
        assert_eq!(msg.msg_id, 7);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn parse_rejects_short_frame() {
        let err = Message::parse(Bytes::from_static(&[0x01]), ByteOrder::BigEndian).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { len: 1 }));
    }

    #[test]
    fn byte_order_serde_names() {
        assert_eq!(serde_json::to_string(&ByteOrder::LittleEndian).unwrap(), "\"little\"");
        let order: ByteOrder = serde_json::from_str("\"big\"").unwrap();
        assert_eq!(order, ByteOrder::BigEndian);
    }
}
