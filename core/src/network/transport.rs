//! Secure stream transport
//!
//! One TCP connection per logical request, carrying ChaCha20-Poly1305
//! records after the handshake. A record is `u32 length | ciphertext`;
//! message frames travel as single records, file payloads as a run of
//! records of at most [`TLS_CHUNK_SIZE`] plaintext bytes. Each stream is
//! owned by exactly one task and closed on every exit path.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::chord::id::PeerRef;
use crate::security::{self, CryptoError};

use super::handshake::{self, Role};
use super::message::{CodecError, Message, MessageKind};

/// Plaintext bytes per file-streaming record.
pub const TLS_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on an encoded message frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const MAX_RECORD_LEN: usize = MAX_FRAME_LEN + security::TAG_LEN;

/// Transport failure, confined to the task owning the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the peer (connect refused or timed out).
    Unreachable,
    /// Handshake did not complete; usually a network-secret mismatch.
    HandshakeFailed,
    /// No full reply arrived within the deadline.
    Timeout,
    /// The connection broke mid-operation.
    Io(String),
    /// The peer sent something outside the protocol.
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unreachable => write!(f, "peer unreachable"),
            TransportError::HandshakeFailed => write!(f, "handshake failed"),
            TransportError::Timeout => write!(f, "timed out waiting for reply"),
            TransportError::Io(e) => write!(f, "connection error: {}", e),
            TransportError::Protocol(e) => write!(f, "protocol violation: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

impl From<CryptoError> for TransportError {
    fn from(e: CryptoError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// An authenticated, encrypted message stream.
///
/// Generic over the byte stream so tests can run on in-memory pipes.
pub struct SecureStream<S> {
    io: S,
    send_key: [u8; security::KEY_LEN],
    recv_key: [u8; security::KEY_LEN],
    send_seq: u64,
    recv_seq: u64,
}

impl SecureStream<TcpStream> {
    /// Dial a peer and run the handshake.
    pub async fn connect(
        addr: SocketAddr,
        secret: &[u8; 32],
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Unreachable)?
            .map_err(|_| TransportError::Unreachable)?;
        stream.set_nodelay(true).ok();
        Self::establish(stream, secret).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureStream<S> {
    /// Dialer side of the handshake over an already-open stream.
    pub async fn establish(mut io: S, secret: &[u8; 32]) -> Result<Self, TransportError> {
        let keys = handshake::run(&mut io, secret, Role::Dialer).await?;
        Ok(Self {
            io,
            send_key: keys.dialer,
            recv_key: keys.listener,
            // counter 0 was spent on handshake confirmation
            send_seq: 1,
            recv_seq: 1,
        })
    }

    /// Listener side of the handshake for an accepted stream.
    pub async fn accept(mut io: S, secret: &[u8; 32]) -> Result<Self, TransportError> {
        let keys = handshake::run(&mut io, secret, Role::Listener).await?;
        Ok(Self {
            io,
            send_key: keys.listener,
            recv_key: keys.dialer,
            send_seq: 1,
            recv_seq: 1,
        })
    }

    async fn write_record(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        let record = security::seal(&self.send_key, self.send_seq, plaintext)?;
        self.send_seq += 1;
        self.io.write_u32(record.len() as u32).await?;
        self.io.write_all(&record).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn read_record(&mut self) -> Result<Vec<u8>, TransportError> {
        let len = self.io.read_u32().await? as usize;
        if len < security::TAG_LEN || len > MAX_RECORD_LEN {
            return Err(TransportError::Protocol(format!(
                "record length {} out of bounds",
                len
            )));
        }
        let mut record = vec![0u8; len];
        self.io.read_exact(&mut record).await?;
        let plaintext = security::open(&self.recv_key, self.recv_seq, &record)?;
        self.recv_seq += 1;
        Ok(plaintext)
    }

    /// Send one framed message.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let frame = message.encode();
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::Protocol(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }
        self.write_record(&frame).await
    }

    /// Receive one framed message, waiting at most `timeout`.
    pub async fn receive_blocking(&mut self, timeout: Duration) -> Result<Message, TransportError> {
        let plaintext = tokio::time::timeout(timeout, self.read_record())
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(Message::decode(&plaintext)?)
    }

    /// Stream exactly `size` bytes from `source` in chunk records.
    pub async fn send_file<R>(&mut self, source: &mut R, size: u64) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; TLS_CHUNK_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(TLS_CHUNK_SIZE as u64) as usize;
            let got = source.read(&mut buf[..want]).await?;
            if got == 0 {
                return Err(TransportError::Io(format!(
                    "source ended with {} bytes left to send",
                    remaining
                )));
            }
            self.write_record(&buf[..got]).await?;
            remaining -= got as u64;
        }
        Ok(())
    }

    /// Consume exactly `size` streamed bytes into `sink`.
    pub async fn receive_file<W>(&mut self, sink: &mut W, size: u64) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = size;
        while remaining > 0 {
            let chunk = self.read_record().await?;
            if chunk.is_empty() || chunk.len() as u64 > remaining {
                return Err(TransportError::Protocol(format!(
                    "chunk of {} bytes with {} expected",
                    chunk.len(),
                    remaining
                )));
            }
            sink.write_all(&chunk).await?;
            remaining -= chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(())
    }

    /// Close the stream. Consuming `self` makes a second close impossible.
    pub async fn close(mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Outbound connection settings shared by everything that dials peers.
#[derive(Clone)]
pub struct Dialer {
    local: PeerRef,
    secret: [u8; 32],
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(local: PeerRef, secret: [u8; 32], connect_timeout: Duration) -> Self {
        Self {
            local,
            secret,
            connect_timeout,
        }
    }

    /// This peer's own reference, stamped on every outbound frame.
    pub fn local(&self) -> PeerRef {
        self.local
    }

    pub async fn dial(&self, addr: SocketAddr) -> Result<SecureStream<TcpStream>, TransportError> {
        SecureStream::connect(addr, &self.secret, self.connect_timeout).await
    }

    /// Build a frame from this peer.
    pub fn message(&self, kind: MessageKind) -> Message {
        Message::new(self.local, kind)
    }
}
