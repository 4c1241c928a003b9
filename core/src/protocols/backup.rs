//! BACKUP: replicate a file onto the peers responsible for random keys
//!
//! Draws `4·r` candidate keys, resolves each through the overlay, and keeps
//! the first `r` distinct non-self targets. One task per target runs the
//! store dialogue; the aggregate notification lists the per-target outcomes
//! in target order. A re-backup triggered by REMOVED uses the same flow
//! with the peers still holding copies excluded.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::chord::id::{ChordId, PeerRef, CHORD_MAX_PEERS};
use crate::data::{self, PeerFile};
use crate::network::{MessageKind, SecureStream, TransportError, REASON_HAVE_FILE, REASON_NO_SPACE};
use crate::peer::{Peer, PeerError};

impl Peer {
    pub(crate) async fn run_backup(
        self: &Arc<Self>,
        filename: &str,
        replication_degree: u32,
        exclude: &HashSet<ChordId>,
    ) {
        if replication_degree == 0 {
            self.notify(format!(
                "Could not BACKUP {}: replication degree must be positive",
                filename
            ));
            return;
        }
        if !self.chord.has_peers().await {
            self.notify(format!(
                "Could not start BACKUP for {}: {}",
                filename,
                PeerError::NotBootstrapped
            ));
            return;
        }

        let (file_id, size) = match data::file_id_for_path(Path::new(filename)) {
            Ok(v) => v,
            Err(e) => {
                self.notify(format!("Failed to BACKUP {}: {}", filename, e));
                return;
            }
        };

        info!(
            filename,
            replication_degree,
            file_id = %file_id,
            size,
            "starting BACKUP"
        );

        let keys = self.draw_keys(replication_degree as usize * 4).await;
        debug!(?keys, "candidate keys");

        let mut targets: Vec<(PeerRef, ChordId)> = Vec::new();
        for key in keys {
            let target = self.chord.find_successor(key).await;
            if target.guid == self.local.guid
                || exclude.contains(&target.guid)
                || targets.iter().any(|(t, _)| t.guid == target.guid)
            {
                continue;
            }
            targets.push((target, key));
            if targets.len() == replication_degree as usize {
                break;
            }
        }

        if targets.is_empty() {
            self.notify(format!("Could not find peers to backup {}!", filename));
            return;
        }

        // register the sent entry before any copy lands
        {
            let db = self.db.lock().await;
            let existing = match data::get_sent_file(&db, filename) {
                Ok(entry) => entry,
                Err(e) => {
                    self.notify(format!("Failed to BACKUP {}: {}", filename, e));
                    return;
                }
            };
            if existing.is_none() {
                let entry = PeerFile::sent(file_id.clone(), self.local, size, replication_degree);
                if let Err(e) = data::add_sent_file(&db, filename, &entry) {
                    self.notify(format!("Failed to BACKUP {}: {}", filename, e));
                    return;
                }
            }
        }

        info!(targets = ?targets.iter().map(|(t, k)| (t.guid, *k)).collect::<Vec<_>>(), "sending file");

        let mut handles = Vec::with_capacity(targets.len());
        for (target, key) in &targets {
            let peer = self.clone();
            let filename = filename.to_string();
            let file_id = file_id.clone();
            let (target, key) = (*target, *key);
            handles.push(self.protocol_pool.spawn(async move {
                peer.backup_on_target(&filename, &file_id, size, replication_degree, target, key)
                    .await
            }));
        }

        let mut result =
            String::from("----------------------------------------------------------------\n");
        result.push_str(&format!(
            "Result for {} with replication degree {}\n",
            filename, replication_degree
        ));
        for handle in handles {
            match handle.await {
                Ok(line) => {
                    result.push_str(&line);
                    result.push('\n');
                }
                Err(e) => {
                    result.push_str(&format!("Backup task failed: {}\n", e));
                }
            }
        }
        result.push_str("----------------------------------------------------------------");
        self.notify(result);
    }

    /// Draw `count` distinct identifiers, capped by the size of the space.
    async fn draw_keys(&self, count: usize) -> Vec<ChordId> {
        let count = count.min(CHORD_MAX_PEERS as usize);
        let mut rng = self.rng.lock().await;
        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(count);
        while keys.len() < count {
            let key = rng.gen_range(0..CHORD_MAX_PEERS);
            if seen.insert(key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Store one copy on `target`; returns the outcome line for the
    /// aggregate notification. Never propagates an error.
    async fn backup_on_target(
        &self,
        filename: &str,
        file_id: &str,
        size: u64,
        replication_degree: u32,
        target: PeerRef,
        key: ChordId,
    ) -> String {
        debug!(%target, key, "starting backup dialogue");
        let mut conn = match self.dialer.dial(target.addr).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%target, error = %e, "backup connect failed");
                return format!("Failed to Backup file on Peer {}", target);
            }
        };
        let outcome = self
            .backup_dialogue(&mut conn, filename, file_id, size, replication_degree, target, key)
            .await;
        conn.close().await;
        match outcome {
            Ok(line) => line,
            Err(e) => {
                debug!(%target, error = %e, "backup dialogue failed");
                format!("Failed to Backup file on Peer {}", target)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn backup_dialogue(
        &self,
        conn: &mut SecureStream<tokio::net::TcpStream>,
        filename: &str,
        file_id: &str,
        size: u64,
        replication_degree: u32,
        target: PeerRef,
        key: ChordId,
    ) -> Result<String, TransportError> {
        conn.send(&self.dialer.message(MessageKind::Backup {
            file_id: file_id.to_string(),
            size,
            owner: self.local,
            key,
            replication_degree,
        }))
        .await?;

        let reply = conn
            .receive_blocking(self.config.backup_ack_timeout())
            .await?;
        match reply.kind {
            MessageKind::Ack { .. } => {}
            MessageKind::Nack { reason } => {
                return Ok(match reason.as_deref() {
                    Some(REASON_NO_SPACE) => format!("Peer {} has no space", target),
                    Some(REASON_HAVE_FILE) => {
                        // the copy exists; the key counts
                        self.record_backup_key(filename, key).await;
                        format!("Peer {} already has the file", target)
                    }
                    _ => format!("Received unexpected message from Peer {}", target),
                });
            }
            _ => return Ok(format!("Received unexpected message from Peer {}", target)),
        }

        let mut file = tokio::fs::File::open(filename).await?;
        conn.send_file(&mut file, size).await?;
        debug!(%target, "file sent, waiting for final ack");

        match conn
            .receive_blocking(self.config.transfer_ack_timeout())
            .await
        {
            Ok(reply) if matches!(reply.kind, MessageKind::Ack { .. }) => {}
            Ok(_) | Err(_) => return Ok("Failed to receive ACK".to_string()),
        }

        self.record_backup_key(filename, key).await;
        Ok(format!("Backup Successful on Peer {}", target))
    }

    /// Record a confirmed copy's key in the sent-files entry.
    async fn record_backup_key(&self, filename: &str, key: ChordId) {
        let db = self.db.lock().await;
        if let Err(e) = data::add_sent_key(&db, filename, key) {
            warn!(filename, key, error = %e, "failed to persist backup key");
        }
    }
}
