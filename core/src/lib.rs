//! Capstan Core
//!
//! A peer node for a distributed, content-addressed file backup network
//! organized as a Chord ring. Every peer stores blobs on behalf of others
//! and coordinates BACKUP / RESTORE / DELETE / RECLAIM for files it owns.
//!
//! # Module Structure
//!
//! - `peer/`: Public interface (Peer, config, errors, command façade)
//! - `chord/`: Identifier space, ring state, routing, maintenance tasks
//! - `network/`: Wire codec, handshake, encrypted stream transport
//! - `handlers/`: Inbound connection dispatch (storer/owner side)
//! - `protocols/`: Outbound protocol engine (initiator side)
//! - `data/`: SQLite persistence for the file registries and capacity
//! - `security/`: Record sealing and session key derivation
//! - `pool`: Bounded task pools
//!
//! # Quick Start
//!
//! ```ignore
//! use capstan_core::{Peer, PeerConfig};
//!
//! // first peer of a new ring
//! let config = PeerConfig::new()
//!     .with_listen_addr("127.0.0.1:7000".parse()?)
//!     .with_secret(secret);
//! let peer = Peer::start(config).await?;
//!
//! // back a file up onto two other peers
//! let mut notifications = peer.notifications().await.unwrap();
//! peer.backup("notes.txt", 2);
//! println!("{}", notifications.recv().await.unwrap());
//! ```

// Public interface
pub mod peer;

// Internal modules
pub(crate) mod handlers;
pub(crate) mod protocols;

// Infrastructure modules (pub for flexibility)
pub mod chord;
pub mod data;
pub mod network;
pub mod pool;
pub mod security;

// Re-export main API types for convenience
pub use chord::id::{ChordId, PeerRef, CHORD_MAX_PEERS, M};
pub use chord::RingSnapshot;
pub use network::TLS_CHUNK_SIZE;
pub use peer::{Peer, PeerConfig, PeerError, DEFAULT_CAPACITY};
