//! Connection handshake
//!
//! SPAKE2 over the shared network secret, then key confirmation. Both sides
//! exchange one length-prefixed SPAKE2 message, finish to a shared secret,
//! and derive the two directional session keys. Confirmation records (the
//! dialer's first, sealed under each side's own key with counter 0) prove
//! both ends hold the network secret before any protocol traffic flows; a
//! peer with the wrong secret fails here and never sees plaintext.

use spake2::{Ed25519Group, Identity, Password, Spake2};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::security::{self, SessionKeys};

use super::transport::TransportError;

/// Upper bound on a SPAKE2 exchange message.
const MAX_PAKE_LEN: usize = 1024;

const PAKE_IDENTITY: &[u8] = b"capstan ring handshake v1";
const CONFIRM: &[u8] = b"capstan-confirm";

/// Role in the handshake; decides which directional key seals our records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

async fn exchange_pake<S>(io: &mut S, outbound: &[u8]) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_u32(outbound.len() as u32).await?;
    io.write_all(outbound).await?;
    io.flush().await?;

    let len = io.read_u32().await? as usize;
    if len == 0 || len > MAX_PAKE_LEN {
        return Err(TransportError::HandshakeFailed);
    }
    let mut inbound = vec![0u8; len];
    io.read_exact(&mut inbound).await?;
    Ok(inbound)
}

async fn read_confirm<S>(io: &mut S, key: &[u8; 32]) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len != CONFIRM.len() + security::TAG_LEN {
        return Err(TransportError::HandshakeFailed);
    }
    let mut record = vec![0u8; len];
    io.read_exact(&mut record).await?;
    let opened = security::open(key, 0, &record).map_err(|_| TransportError::HandshakeFailed)?;
    if opened != CONFIRM {
        return Err(TransportError::HandshakeFailed);
    }
    Ok(())
}

async fn write_confirm<S>(io: &mut S, key: &[u8; 32]) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = security::seal(key, 0, CONFIRM).map_err(|_| TransportError::HandshakeFailed)?;
    io.write_u32(record.len() as u32).await?;
    io.write_all(&record).await?;
    io.flush().await?;
    Ok(())
}

/// Run the handshake and derive the session keys.
///
/// Symmetric SPAKE2 keeps both flows identical up to confirmation order:
/// the dialer confirms first, the listener answers.
pub async fn run<S>(io: &mut S, secret: &[u8; 32], role: Role) -> Result<SessionKeys, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (state, outbound) = Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(secret),
        &Identity::new(PAKE_IDENTITY),
    );
    let inbound = exchange_pake(io, &outbound).await?;
    let shared = state
        .finish(&inbound)
        .map_err(|_| TransportError::HandshakeFailed)?;
    let keys = security::session_keys(&shared);

    match role {
        Role::Dialer => {
            write_confirm(io, &keys.dialer).await?;
            read_confirm(io, &keys.listener).await?;
        }
        Role::Listener => {
            read_confirm(io, &keys.dialer).await?;
            write_confirm(io, &keys.listener).await?;
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_pair(
        dialer_secret: [u8; 32],
        listener_secret: [u8; 32],
    ) -> (
        Result<SessionKeys, TransportError>,
        Result<SessionKeys, TransportError>,
    ) {
        let (mut a, b) = tokio::io::duplex(4096);
        // listener owns its half so a failure drops it and unblocks the dialer
        let listener = tokio::spawn(async move {
            let mut b = b;
            run(&mut b, &listener_secret, Role::Listener).await
        });
        let dialer = run(&mut a, &dialer_secret, Role::Dialer).await;
        drop(a);
        (dialer, listener.await.unwrap())
    }

    #[tokio::test]
    async fn test_matching_secret_yields_same_keys() {
        let secret = [0x11u8; 32];
        let (d, l) = run_pair(secret, secret).await;
        let d = d.unwrap();
        let l = l.unwrap();
        assert_eq!(d.dialer, l.dialer);
        assert_eq!(d.listener, l.listener);
        assert_ne!(d.dialer, d.listener);
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_confirmation() {
        let (d, l) = run_pair([0x11u8; 32], [0x22u8; 32]).await;
        // at least the listener must reject; the dialer may see either a
        // handshake failure or a broken pipe depending on shutdown order
        assert!(l.is_err());
        assert!(d.is_err());
    }

    #[tokio::test]
    async fn test_sessions_do_not_repeat_keys() {
        let secret = [0x33u8; 32];
        let (d1, _) = run_pair(secret, secret).await;
        let (d2, _) = run_pair(secret, secret).await;
        // SPAKE2 uses fresh ephemerals per run
        assert_ne!(d1.unwrap().dialer, d2.unwrap().dialer);
    }
}
