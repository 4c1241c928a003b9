//! Peer composition root
//!
//! `Peer` owns the Chord overlay, the dialer, the state database, and the
//! two task pools, and exposes the command façade: `backup`, `restore`,
//! `delete`, `reclaim`, `state`, `chord`, `lookup`. Commands are scheduled
//! on the client pool and answer asynchronously through the notification
//! channel; none of them blocks the caller.

pub mod config;
pub mod error;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rusqlite::Connection;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::chord::id::{ChordId, PeerRef, CHORD_MAX_PEERS};
use crate::chord::Chord;
use crate::data;
use crate::network::transport::Dialer;
use crate::pool::TaskPool;

pub use config::{PeerConfig, DEFAULT_CAPACITY};
pub use error::PeerError;

/// A running backup peer.
pub struct Peer {
    pub(crate) config: PeerConfig,
    pub(crate) local: PeerRef,
    pub(crate) chord: Arc<Chord>,
    pub(crate) dialer: Dialer,
    /// State database; capacity and occupation share this lock because they
    /// are one invariant pair.
    pub(crate) db: Arc<Mutex<Connection>>,
    /// `<root>/<guid>`, holding stored blobs and the state database.
    pub(crate) files_dir: PathBuf,
    pub(crate) notify_tx: mpsc::Sender<String>,
    notify_rx: RwLock<Option<mpsc::Receiver<String>>>,
    pub(crate) running: Arc<RwLock<bool>>,
    tasks: RwLock<Vec<tokio::task::JoinHandle<()>>>,
    pub(crate) client_pool: TaskPool,
    pub(crate) protocol_pool: TaskPool,
    /// Backup key generator; seedable for reproducible draws.
    pub(crate) rng: Mutex<StdRng>,
}

impl Peer {
    /// Start the peer: bind the listener, open the state database, launch
    /// ring maintenance, and join through the configured bootstrap.
    pub async fn start(config: PeerConfig) -> Result<Arc<Self>, PeerError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| PeerError::StartFailed(format!("bind {}: {}", config.listen_addr, e)))?;
        let actual = listener
            .local_addr()
            .map_err(|e| PeerError::StartFailed(e.to_string()))?;
        let local = PeerRef::new(actual);

        let files_dir = config.root.join(local.guid.to_string());
        std::fs::create_dir_all(&files_dir)
            .map_err(|e| PeerError::StartFailed(format!("create {:?}: {}", files_dir, e)))?;

        let conn = Connection::open(files_dir.join("state"))
            .map_err(|e| PeerError::StartFailed(format!("state database: {}", e)))?;
        data::create_tables(&conn, config.capacity)
            .map_err(|e| PeerError::StartFailed(format!("state schema: {}", e)))?;

        let dialer = Dialer::new(local, config.secret, config.connect_timeout());
        let chord = Arc::new(Chord::new(local, dialer.clone(), config.lookup_timeout()));
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer.max(1));
        let running = Arc::new(RwLock::new(true));
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let peer = Arc::new(Self {
            client_pool: TaskPool::new(config.client_pool_size),
            protocol_pool: TaskPool::new(config.protocol_pool_size),
            local,
            chord: chord.clone(),
            dialer,
            db: Arc::new(Mutex::new(conn)),
            files_dir,
            notify_tx,
            notify_rx: RwLock::new(Some(notify_rx)),
            running: running.clone(),
            tasks: RwLock::new(Vec::new()),
            rng: Mutex::new(rng),
            config,
        });

        let interval = std::time::Duration::from_millis(peer.config.stabilize_ms.max(10));
        let handles = vec![
            tokio::spawn(peer.clone().run_listener(listener)),
            tokio::spawn(chord.clone().run_stabilize(running.clone(), interval)),
            tokio::spawn(chord.clone().run_fix_fingers(running.clone(), interval)),
            tokio::spawn(chord.clone().run_check_predecessor(running.clone(), interval)),
        ];
        *peer.tasks.write().await = handles;

        if let Some(bootstrap) = peer.config.bootstrap {
            if let Err(e) = chord.join(bootstrap).await {
                peer.stop().await;
                return Err(PeerError::StartFailed(format!(
                    "bootstrap {}: {}",
                    bootstrap, e
                )));
            }
        }

        info!(peer = %local, "peer started");
        Ok(peer)
    }

    /// This peer's reference (address + GUID).
    pub fn reference(&self) -> PeerRef {
        self.local
    }

    /// Current routing view.
    pub async fn ring_snapshot(&self) -> crate::chord::RingSnapshot {
        self.chord.snapshot().await
    }

    /// Current sent-files registry, keyed by local filename.
    pub async fn sent_files(&self) -> Result<Vec<(String, data::PeerFile)>, PeerError> {
        let db = self.db.lock().await;
        Ok(data::list_sent_files(&db)?)
    }

    /// Current stored-files registry.
    pub async fn stored_files(&self) -> Result<Vec<data::PeerFile>, PeerError> {
        let db = self.db.lock().await;
        Ok(data::list_stored_files(&db)?)
    }

    /// Capacity and occupation, in bytes.
    pub async fn storage_info(&self) -> Result<(u64, u64), PeerError> {
        let db = self.db.lock().await;
        Ok((data::capacity(&db)?, data::occupation(&db)?))
    }

    /// Take the notification receiver. Single consumer; subsequent calls
    /// return `None`.
    pub async fn notifications(&self) -> Option<mpsc::Receiver<String>> {
        self.notify_rx.write().await.take()
    }

    /// Deliver a notification to the sink. Best effort: a full channel or a
    /// dropped receiver is logged and the message discarded.
    pub(crate) fn notify(&self, message: String) {
        if let Err(e) = self.notify_tx.try_send(message) {
            warn!(error = %e, "notification sink unavailable, dropping message");
        }
    }

    /// Stop background tasks. Idempotent.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        for task in self.tasks.write().await.drain(..) {
            task.abort();
        }
        info!(peer = %self.local, "peer stopped");
    }

    // ---- command façade -------------------------------------------------

    /// BACKUP: replicate `filename` onto `replication_degree` peers.
    pub fn backup(self: &Arc<Self>, filename: impl Into<String>, replication_degree: u32) {
        let peer = self.clone();
        let filename = filename.into();
        self.client_pool.spawn(async move {
            peer.run_backup(&filename, replication_degree, &HashSet::new())
                .await;
        });
    }

    /// RESTORE: fetch a backed-up file from one of its storers.
    pub fn restore(self: &Arc<Self>, filename: impl Into<String>) {
        let peer = self.clone();
        let filename = filename.into();
        self.client_pool.spawn(async move {
            peer.run_restore(&filename).await;
        });
    }

    /// DELETE: drop a backed-up file from every storer.
    pub fn delete(self: &Arc<Self>, filename: impl Into<String>) {
        let peer = self.clone();
        let filename = filename.into();
        self.client_pool.spawn(async move {
            peer.run_delete(&filename).await;
        });
    }

    /// RECLAIM: shrink local storage to `target_bytes` (0 = evict all and
    /// reset to the default capacity).
    pub fn reclaim(self: &Arc<Self>, target_bytes: u64) {
        let peer = self.clone();
        self.client_pool.spawn(async move {
            peer.run_reclaim(target_bytes).await;
        });
    }

    /// STATE: deliver the full internal state as text.
    pub fn state(self: &Arc<Self>) {
        let peer = self.clone();
        self.client_pool.spawn(async move {
            match peer.state_report().await {
                Ok(report) => peer.notify(report),
                Err(e) => peer.notify(format!("Could not assemble state: {}", e)),
            }
        });
    }

    /// CHORD: deliver the routing view as text.
    pub fn chord(self: &Arc<Self>) {
        let peer = self.clone();
        self.client_pool.spawn(async move {
            let snapshot = peer.chord.snapshot().await;
            peer.notify(snapshot.render());
        });
    }

    /// LOOKUP: resolve the successor of `guid` and deliver it.
    pub fn lookup(self: &Arc<Self>, guid: ChordId) {
        let peer = self.clone();
        self.client_pool.spawn(async move {
            let answer = peer.chord.find_successor(guid % CHORD_MAX_PEERS).await;
            peer.notify(format!("Successor of {}: {}", guid % CHORD_MAX_PEERS, answer));
        });
    }

    // ---- shared helpers -------------------------------------------------

    /// On-disk location of a stored blob.
    pub(crate) fn blob_path(&self, file_id: &str) -> PathBuf {
        self.files_dir.join(file_id)
    }

    /// Destination of a restored file.
    pub(crate) fn restored_path(&self, filename: &str) -> PathBuf {
        let base = std::path::Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());
        self.files_dir.join(format!("restored_{}", base))
    }

    /// Render both registries plus the routing view.
    pub(crate) async fn state_report(&self) -> Result<String, PeerError> {
        let (sent, stored, capacity, occupation) = {
            let db = self.db.lock().await;
            (
                data::list_sent_files(&db)?,
                data::list_stored_files(&db)?,
                data::capacity(&db)?,
                data::occupation(&db)?,
            )
        };

        let mut out = String::new();
        out.push_str(&format!("=== Peer {} ===\n", self.local));
        out.push_str(&format!(
            "Capacity: {} bytes, Occupation: {} bytes\n",
            capacity, occupation
        ));

        out.push_str("Sent files:\n");
        if sent.is_empty() {
            out.push_str("  (none)\n");
        }
        for (name, file) in &sent {
            out.push_str(&format!(
                "  {} id={} size={} degree={} keys={:?}{}\n",
                name,
                file.file_id,
                file.size,
                file.replication_degree,
                file.keys,
                if file.being_deleted { " (deleting)" } else { "" },
            ));
        }

        out.push_str("Stored files:\n");
        if stored.is_empty() {
            out.push_str("  (none)\n");
        }
        for file in &stored {
            out.push_str(&format!(
                "  id={} owner={} size={} key={}\n",
                file.file_id,
                file.owner,
                file.size,
                file.local_key.map(|k| k.to_string()).unwrap_or_else(|| "-".into()),
            ));
        }

        out.push_str("Ring:\n");
        out.push_str(&self.chord.snapshot().await.render());
        Ok(out)
    }
}
