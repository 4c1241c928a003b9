//! Session cryptography
//!
//! ChaCha20-Poly1305 record sealing for peer connections. Each established
//! session carries two 32-byte keys, one per direction, derived from the
//! handshake secret with BLAKE3's KDF under distinct context strings. Nonces
//! are the per-direction record counter, so a key must never outlive a
//! single connection — the handshake guarantees that.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};

/// Session key length.
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

const DIALER_CONTEXT: &str = "capstan session dialer to listener v1";
const LISTENER_CONTEXT: &str = "capstan session listener to dialer v1";

/// Record sealing/opening failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Sealing failed (invalid inputs).
    SealFailed,
    /// Tag verification failed: wrong key, wrong counter, or tampering.
    OpenFailed,
    /// Ciphertext shorter than the authentication tag.
    RecordTooShort,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::SealFailed => write!(f, "record sealing failed"),
            CryptoError::OpenFailed => write!(f, "record authentication failed"),
            CryptoError::RecordTooShort => {
                write!(f, "record shorter than {} bytes", TAG_LEN)
            }
        }
    }
}

impl std::error::Error for CryptoError {}

/// The two directional keys of one session.
#[derive(Clone, Copy)]
pub struct SessionKeys {
    /// Seals records sent by the connecting side.
    pub dialer: [u8; KEY_LEN],
    /// Seals records sent by the accepting side.
    pub listener: [u8; KEY_LEN],
}

/// Derive both directional keys from the handshake shared secret.
pub fn session_keys(shared_secret: &[u8]) -> SessionKeys {
    SessionKeys {
        dialer: blake3::derive_key(DIALER_CONTEXT, shared_secret),
        listener: blake3::derive_key(LISTENER_CONTEXT, shared_secret),
    }
}

fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[..8].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(bytes)
}

/// Seal one record under the directional key and record counter.
pub fn seal(key: &[u8; KEY_LEN], counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(&counter_nonce(counter), plaintext)
        .map_err(|_| CryptoError::SealFailed)
}

/// Open one record; the counter must match the sealing counter exactly.
pub fn open(key: &[u8; KEY_LEN], counter: u64, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if record.len() < TAG_LEN {
        return Err(CryptoError::RecordTooShort);
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(&counter_nonce(counter), record)
        .map_err(|_| CryptoError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = [7u8; KEY_LEN];
        let sealed = seal(&key, 0, b"stored bytes").unwrap();
        assert_eq!(sealed.len(), b"stored bytes".len() + TAG_LEN);
        let opened = open(&key, 0, &sealed).unwrap();
        assert_eq!(opened, b"stored bytes");
    }

    #[test]
    fn test_open_rejects_counter_mismatch() {
        let key = [7u8; KEY_LEN];
        let sealed = seal(&key, 3, b"payload").unwrap();
        assert_eq!(open(&key, 4, &sealed), Err(CryptoError::OpenFailed));
        assert!(open(&key, 3, &sealed).is_ok());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let sealed = seal(&[1u8; KEY_LEN], 0, b"payload").unwrap();
        assert_eq!(open(&[2u8; KEY_LEN], 0, &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [9u8; KEY_LEN];
        let mut sealed = seal(&key, 0, b"payload").unwrap();
        sealed[2] ^= 0x80;
        assert_eq!(open(&key, 0, &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_open_rejects_short_record() {
        let key = [9u8; KEY_LEN];
        assert_eq!(open(&key, 0, &[0u8; 7]), Err(CryptoError::RecordTooShort));
    }

    #[test]
    fn test_empty_plaintext_is_tag_only() {
        let key = [3u8; KEY_LEN];
        let sealed = seal(&key, 0, b"").unwrap();
        assert_eq!(sealed.len(), TAG_LEN);
        assert!(open(&key, 0, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_directional_keys_differ() {
        let keys = session_keys(b"shared secret material");
        assert_ne!(keys.dialer, keys.listener);
    }

    #[test]
    fn test_session_keys_deterministic() {
        let a = session_keys(b"same material");
        let b = session_keys(b"same material");
        assert_eq!(a.dialer, b.dialer);
        assert_eq!(a.listener, b.listener);
    }
}
