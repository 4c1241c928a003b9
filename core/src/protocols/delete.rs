//! DELETE: drop a backed-up file from every storer
//!
//! Fire-and-forget: one DELETE per key, no acknowledgement awaited.
//! Receivers treat repeats as no-ops, so a re-issued DELETE is harmless.
//! Once every dispatch has run, the sent-files entry is purged.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chord::id::PeerRef;
use crate::data;
use crate::network::MessageKind;
use crate::peer::{Peer, PeerError};

impl Peer {
    pub(crate) async fn run_delete(self: &Arc<Self>, filename: &str) {
        info!(filename, "starting DELETE");

        let entry = {
            let db = self.db.lock().await;
            data::get_sent_file(&db, filename)
        };
        let file = match entry {
            Ok(Some(file)) => file,
            Ok(None) => {
                self.notify(format!(
                    "Could not DELETE: {}",
                    PeerError::NotFound(format!("{} was not backed up", filename))
                ));
                return;
            }
            Err(e) => {
                self.notify(format!("Failed to DELETE {}: {}", filename, e));
                return;
            }
        };

        {
            let db = self.db.lock().await;
            if let Err(e) = data::set_being_deleted(&db, filename, true) {
                warn!(filename, error = %e, "failed to flag deletion");
            }
        }

        let mut targets: HashSet<PeerRef> = HashSet::new();
        let mut handles = Vec::new();
        for key in &file.keys {
            let target = self.chord.find_successor(*key).await;
            if target.guid == self.local.guid {
                continue;
            }
            targets.insert(target);
            let peer = self.clone();
            let file_id = file.file_id.clone();
            handles.push(self.protocol_pool.spawn(async move {
                peer.send_delete(target, &file_id).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        // every DELETE dispatched; the entry has served its purpose
        {
            let db = self.db.lock().await;
            if let Err(e) = data::remove_sent_file(&db, filename) {
                warn!(filename, error = %e, "failed to purge sent entry");
            }
        }

        let peers = targets
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.notify(format!("DELETE for {} was sent to: [{}]", filename, peers));
    }

    async fn send_delete(&self, target: PeerRef, file_id: &str) {
        match self.dialer.dial(target.addr).await {
            Ok(mut conn) => {
                let message = self.dialer.message(MessageKind::Delete {
                    file_id: file_id.to_string(),
                });
                if let Err(e) = conn.send(&message).await {
                    debug!(%target, error = %e, "DELETE send failed");
                } else {
                    debug!(%target, file_id, "sent DELETE");
                }
                conn.close().await;
            }
            Err(e) => {
                debug!(%target, error = %e, "DELETE connect failed");
            }
        }
    }
}
