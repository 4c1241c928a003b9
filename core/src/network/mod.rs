//! Network layer
//!
//! Contains:
//! - `message`: typed wire messages and the frame codec
//! - `handshake`: SPAKE2 network-secret handshake
//! - `transport`: encrypted record streams with timeouts and file streaming

pub mod handshake;
pub mod message;
pub mod transport;

pub use message::{CodecError, Message, MessageKind, REASON_HAVE_FILE, REASON_NO_SPACE};
pub use transport::{SecureStream, TransportError, MAX_FRAME_LEN, TLS_CHUNK_SIZE};
