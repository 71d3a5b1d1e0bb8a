//! framewire core: frame codec, message header and atomic scalars shared by servers and clients.

pub mod atomic;
pub mod codec;
pub mod message;

pub use atomic::{AtomicBoolean, AtomicInt32, AtomicInt64, AtomicUint64};
pub use codec::{CodecError, FrameCodec, HEADER_LEN, MAX_FRAME_LEN};
pub use message::{ByteOrder, Message, MSG_ID_LEN};
