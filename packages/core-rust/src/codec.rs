//! Length-prefixed frame codec.
//!
//! Every frame on the wire is a 2-byte length header followed by exactly that
//! many payload bytes. The header uses the configured [`ByteOrder`]. Declared
//! lengths are checked against the receive limit before any payload is read,
//! so an oversized frame never causes a large allocation.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::ByteOrder;

/// Size of the frame length header.
pub const HEADER_LEN: usize = 2;

/// Largest payload a 2-byte length header can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("refusing to encode an empty payload")]
    NilPayload,

    #[error("frame of {len} bytes is too short to carry a message id")]
    Truncated { len: usize },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec parameterised by byte order and per-direction size limits.
///
/// Implements `tokio_util::codec::{Decoder, Encoder}` for use with `Framed`,
/// and also offers direct async read/write helpers for one-off exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    order: ByteOrder,
    max_recv: usize,
    max_send: usize,
}

impl FrameCodec {
    /// Creates a codec. Limits above [`MAX_FRAME_LEN`] are clamped to it.
    #[must_use]
    pub fn new(order: ByteOrder, max_recv: usize, max_send: usize) -> Self {
        Self {
            order,
            max_recv: max_recv.min(MAX_FRAME_LEN),
            max_send: max_send.min(MAX_FRAME_LEN),
        }
    }

    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    #[must_use]
    pub fn max_recv(&self) -> usize {
        self.max_recv
    }

    #[must_use]
    pub fn max_send(&self) -> usize {
        self.max_send
    }

    /// Checks that a payload of `len` bytes may be sent.
    ///
    /// # Errors
    ///
    /// `NilPayload` for an empty payload, `FrameTooLarge` above the send limit.
    pub fn check_send(&self, len: usize) -> Result<u16, CodecError> {
        if len == 0 {
            return Err(CodecError::NilPayload);
        }
        if len > self.max_send {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_send,
            });
        }
        u16::try_from(len).map_err(|_| CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        })
    }

    /// Produces `[len][payload]` as a single buffer.
    ///
    /// # Errors
    ///
    /// See [`FrameCodec::check_send`].
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.write_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Reads exactly one frame from `reader`.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` when the declared length exceeds the receive limit.
    /// A short read surfaces as `Io` with `UnexpectedEof`.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Bytes, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let len = usize::from(self.order.read_u16(&header));
        if len > self.max_recv {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_recv,
            });
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Bytes::from(payload))
    }

    /// Writes one frame to `writer` and flushes it.
    ///
    /// # Errors
    ///
    /// Size violations as in [`FrameCodec::check_send`], otherwise `Io`.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode_frame(payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn write_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = self.check_send(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        self.order.put_u16(dst, len);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(ByteOrder::default(), 8 * 1024, 8 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(self.order.read_u16(&src[..HEADER_LEN]));
        if len > self.max_recv {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_recv,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.write_into(&item, dst)
    }
}
