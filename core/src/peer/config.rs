//! Peer configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Storage capacity granted to other peers' files by default: 1 GiB.
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Configuration for a capstan peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to listen on. Port 0 picks an ephemeral port; the GUID is
    /// derived from the actual bound address.
    pub listen_addr: SocketAddr,

    /// Peer to join through. `None` (or own address) starts a new ring.
    pub bootstrap: Option<SocketAddr>,

    /// Root directory; this peer's blobs and state live under
    /// `<root>/<guid>/`.
    pub root: PathBuf,

    /// Shared network secret; peers without it cannot complete a handshake.
    pub secret: [u8; 32],

    /// Storage capacity in bytes granted to other peers' files.
    /// Default: [`DEFAULT_CAPACITY`]
    pub capacity: u64,

    /// Ring maintenance cadence (stabilize, fix fingers, check predecessor).
    /// Default: 1000 ms
    pub stabilize_ms: u64,

    /// Concurrent client commands.
    /// Default: 8
    pub client_pool_size: usize,

    /// Concurrent per-target protocol tasks.
    /// Default: 16
    pub protocol_pool_size: usize,

    /// TCP connect deadline.
    /// Default: 1000 ms
    pub connect_timeout_ms: u64,

    /// Deadline for a remote find-successor answer.
    /// Default: 500 ms
    pub lookup_timeout_ms: u64,

    /// Deadline for the first BACKUP acknowledgement.
    /// Default: 100 ms
    pub backup_ack_timeout_ms: u64,

    /// Deadline for the post-stream BACKUP acknowledgement.
    /// Default: 2000 ms
    pub transfer_ack_timeout_ms: u64,

    /// Deadline for the RESTORE acknowledgement.
    /// Default: 500 ms
    pub restore_ack_timeout_ms: u64,

    /// Idle deadline for inbound connections.
    /// Default: 5000 ms
    pub inbound_idle_timeout_ms: u64,

    /// Notification channel depth.
    /// Default: 64
    pub notification_buffer: usize,

    /// Seed for the backup key generator; `None` seeds from entropy.
    /// Fixed seeds make key draws reproducible in tests.
    pub rng_seed: Option<u64>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("static address"),
            bootstrap: None,
            root: PathBuf::from("capstan_data"),
            secret: [0u8; 32],
            capacity: DEFAULT_CAPACITY,
            stabilize_ms: 1000,
            client_pool_size: 8,
            protocol_pool_size: 16,
            connect_timeout_ms: 1000,
            lookup_timeout_ms: 500,
            backup_ack_timeout_ms: 100,
            transfer_ack_timeout_ms: 2000,
            restore_ack_timeout_ms: 500,
            inbound_idle_timeout_ms: 5000,
            notification_buffer: 64,
            rng_seed: None,
        }
    }
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_bootstrap(mut self, addr: SocketAddr) -> Self {
        self.bootstrap = Some(addr);
        self
    }

    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = root;
        self
    }

    pub fn with_secret(mut self, secret: [u8; 32]) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn with_stabilize_ms(mut self, ms: u64) -> Self {
        self.stabilize_ms = ms;
        self
    }

    pub fn with_pools(mut self, client: usize, protocol: usize) -> Self {
        self.client_pool_size = client;
        self.protocol_pool_size = protocol;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Configuration for tests: fast ring maintenance, small capacity, and
    /// deadlines slack enough for a loaded test runner.
    pub fn for_testing() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("static address"),
            bootstrap: None,
            root: PathBuf::from("capstan_test_data"),
            secret: [0xCAu8; 32],
            capacity: 10 * 1024 * 1024, // 10 MB
            stabilize_ms: 50,
            client_pool_size: 8,
            protocol_pool_size: 16,
            connect_timeout_ms: 1000,
            lookup_timeout_ms: 1000,
            backup_ack_timeout_ms: 1000,
            transfer_ack_timeout_ms: 2000,
            restore_ack_timeout_ms: 1000,
            inbound_idle_timeout_ms: 2000,
            notification_buffer: 64,
            rng_seed: None,
        }
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub(crate) fn backup_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_ack_timeout_ms)
    }

    pub(crate) fn transfer_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_ack_timeout_ms)
    }

    pub(crate) fn restore_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_ack_timeout_ms)
    }

    pub(crate) fn inbound_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = PeerConfig::default();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.stabilize_ms, 1000);
        assert_eq!(config.client_pool_size, 8);
        assert_eq!(config.protocol_pool_size, 16);
        assert_eq!(config.backup_ack_timeout_ms, 100);
        assert_eq!(config.transfer_ack_timeout_ms, 2000);
        assert_eq!(config.restore_ack_timeout_ms, 500);
        assert!(config.bootstrap.is_none());
        assert!(config.rng_seed.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let boot: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let config = PeerConfig::new()
            .with_bootstrap(boot)
            .with_capacity(4096)
            .with_pools(2, 4)
            .with_rng_seed(7)
            .with_secret([9u8; 32]);
        assert_eq!(config.bootstrap, Some(boot));
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.client_pool_size, 2);
        assert_eq!(config.protocol_pool_size, 4);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.secret, [9u8; 32]);
    }

    #[test]
    fn test_testing_config_is_fast() {
        let config = PeerConfig::for_testing();
        assert!(config.stabilize_ms <= 100);
        assert!(config.capacity <= 10 * 1024 * 1024);
    }
}
