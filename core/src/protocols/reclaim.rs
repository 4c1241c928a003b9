//! RECLAIM: evict stored files until local storage fits a target
//!
//! Walks the stored-files registry in map order, deleting blobs and telling
//! each owner which key went away so it can re-establish its replication
//! degree. A target of zero evicts everything and resets the capacity to
//! the default.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::data::{self, PeerFile};
use crate::network::MessageKind;
use crate::peer::config::DEFAULT_CAPACITY;
use crate::peer::Peer;

impl Peer {
    pub(crate) async fn run_reclaim(self: &Arc<Self>, target_bytes: u64) {
        info!(target_bytes, "starting RECLAIM");

        let stored = {
            let db = self.db.lock().await;
            match data::list_stored_files(&db) {
                Ok(files) => files,
                Err(e) => {
                    self.notify(format!("Failed to RECLAIM: {}", e));
                    return;
                }
            }
        };

        for file in stored {
            {
                let db = self.db.lock().await;
                let occupation = data::occupation(&db).unwrap_or(0);
                if target_bytes > 0 && occupation <= target_bytes {
                    break;
                }
            }

            let _ = tokio::fs::remove_file(self.blob_path(&file.file_id)).await;
            {
                let db = self.db.lock().await;
                if let Err(e) = data::remove_stored_file(&db, &file.file_id) {
                    warn!(file_id = %file.file_id, error = %e, "failed to drop stored entry");
                }
                if let Err(e) = data::update_occupation(&db, &self.files_dir) {
                    warn!(error = %e, "failed to update occupation");
                }
            }
            info!(file_id = %file.file_id, "evicted stored file");

            self.send_removed(&file).await;
        }

        let new_capacity = if target_bytes == 0 {
            DEFAULT_CAPACITY
        } else {
            target_bytes
        };
        {
            let db = self.db.lock().await;
            if let Err(e) = data::set_capacity(&db, new_capacity) {
                warn!(error = %e, "failed to set capacity");
            }
        }

        self.notify(format!(
            "Reclaim successful! Capacity is now {} bytes",
            new_capacity
        ));
    }

    /// Best-effort REMOVED to the file's owner; a dead owner is its own
    /// problem.
    async fn send_removed(self: &Arc<Self>, file: &PeerFile) {
        let Some(key) = file.local_key else {
            // restored copies carry no serving key and nobody to notify
            return;
        };

        if file.owner.guid == self.local.guid {
            // we own the file ourselves; apply the key removal directly
            self.apply_removed(&file.file_id, key).await;
            return;
        }

        match self.dialer.dial(file.owner.addr).await {
            Ok(mut conn) => {
                let message = self.dialer.message(MessageKind::Removed {
                    file_id: file.file_id.clone(),
                    key,
                });
                if let Err(e) = conn.send(&message).await {
                    debug!(owner = %file.owner, error = %e, "REMOVED send failed");
                }
                conn.close().await;
            }
            Err(e) => {
                debug!(owner = %file.owner, error = %e, "REMOVED connect failed");
            }
        }
    }
}
