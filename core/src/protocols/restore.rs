//! RESTORE: fetch a backed-up file from one of its storers
//!
//! Tries the entry's keys in order, short-circuiting on the first storer
//! that streams the file back. The wire dialogue sends GET twice: the first
//! asks whether the storer has the file, the second tells it to stream.

use std::sync::Arc;

use tracing::{debug, info};

use crate::chord::id::PeerRef;
use crate::data::{self, PeerFile};
use crate::network::{MessageKind, SecureStream, TransportError};
use crate::peer::{Peer, PeerError};

impl Peer {
    pub(crate) async fn run_restore(self: &Arc<Self>, filename: &str) {
        info!(filename, "starting RESTORE");

        let entry = {
            let db = self.db.lock().await;
            data::get_sent_file(&db, filename)
        };
        let file = match entry {
            Ok(Some(file)) => file,
            Ok(None) => {
                self.notify(format!(
                    "Could not RESTORE: {}",
                    PeerError::NotFound(format!("{} was not backed up", filename))
                ));
                return;
            }
            Err(e) => {
                self.notify(format!("Failed to RESTORE {}: {}", filename, e));
                return;
            }
        };

        for key in &file.keys {
            let target = self.chord.find_successor(*key).await;
            if target.guid == self.local.guid {
                continue;
            }
            match self.restore_from(target, filename, &file).await {
                Ok(()) => {
                    info!(filename, storer = %target, "restored");
                    self.notify(format!("File: {} restored successfully!", filename));
                    return;
                }
                Err(e) => {
                    debug!(storer = %target, key = *key, error = %e, "storer could not serve file");
                }
            }
        }

        self.notify(format!("File: {} could not be restored!", filename));
    }

    async fn restore_from(
        &self,
        target: PeerRef,
        filename: &str,
        file: &PeerFile,
    ) -> Result<(), TransportError> {
        let mut conn = self.dialer.dial(target.addr).await?;
        let outcome = self.restore_dialogue(&mut conn, filename, file).await;
        conn.close().await;
        outcome
    }

    async fn restore_dialogue(
        &self,
        conn: &mut SecureStream<tokio::net::TcpStream>,
        filename: &str,
        file: &PeerFile,
    ) -> Result<(), TransportError> {
        let get = self.dialer.message(MessageKind::Get {
            file_id: file.file_id.clone(),
        });
        conn.send(&get).await?;

        let reply = conn
            .receive_blocking(self.config.restore_ack_timeout())
            .await?;
        match reply.kind {
            MessageKind::Ack { .. } => {}
            MessageKind::Nack { .. } => {
                return Err(TransportError::Protocol(
                    "peer does not have the file".to_string(),
                ))
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected ack for GET, got {:?}",
                    other
                )))
            }
        }

        // second GET starts the stream
        conn.send(&get).await?;

        let path = self.restored_path(filename);
        let mut out = tokio::fs::File::create(&path).await?;
        if let Err(e) = conn.receive_file(&mut out, file.size).await {
            drop(out);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        // register the restored copy with the metadata that came with the
        // backup; it now counts toward this peer's occupation
        let db = self.db.lock().await;
        let restored = PeerFile {
            file_id: file.file_id.clone(),
            owner: file.owner,
            size: file.size,
            replication_degree: file.replication_degree,
            keys: Default::default(),
            local_key: file.local_key,
            being_deleted: false,
        };
        data::add_stored_file(&db, &restored)
            .map_err(|e| TransportError::Io(format!("state database: {}", e)))?;
        Ok(())
    }
}
