//! Inbound message dispatch
//!
//! The storer/owner side of the backup protocols plus the ring maintenance
//! answers. One connection carries one logical request: a file operation
//! ends the dispatch loop, while lightweight ring messages may follow each
//! other on the same stream (a stabilize round sends three).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::chord::id::{ChordId, PeerRef};
use crate::data::{self, PeerFile};
use crate::network::{
    MessageKind, SecureStream, TransportError, REASON_HAVE_FILE, REASON_NO_SPACE,
};
use crate::peer::Peer;

type Conn = SecureStream<TcpStream>;

impl Peer {
    /// Handshake and dispatch one inbound connection.
    pub(crate) async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut conn = match SecureStream::accept(stream, &self.config.secret).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%remote, error = %e, "inbound handshake failed");
                return;
            }
        };

        loop {
            let message = match conn
                .receive_blocking(self.config.inbound_idle_timeout())
                .await
            {
                Ok(message) => message,
                Err(TransportError::Timeout) => {
                    debug!(%remote, "inbound connection idle, closing");
                    break;
                }
                Err(TransportError::Io(_)) => break, // peer closed
                Err(e) => {
                    warn!(%remote, error = %e, "closing misbehaving connection");
                    break;
                }
            };

            let sender = message.sender;
            match message.kind {
                MessageKind::Backup {
                    file_id,
                    size,
                    owner,
                    key,
                    replication_degree,
                } => {
                    self.handle_backup(&mut conn, file_id, size, owner, key, replication_degree)
                        .await;
                    break;
                }
                MessageKind::Get { file_id } => {
                    self.handle_get(&mut conn, &file_id).await;
                    break;
                }
                MessageKind::Delete { file_id } => {
                    self.handle_delete(&file_id).await;
                    break;
                }
                MessageKind::Removed { file_id, key } => {
                    self.apply_removed(&file_id, key).await;
                    break;
                }
                MessageKind::Lookup { key } => {
                    let answer = self.chord.find_successor(key).await;
                    if self
                        .reply(&mut conn, MessageKind::Successor { peer: answer })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                MessageKind::GetPredecessor => {
                    let peer = self.chord.predecessor().await;
                    if self
                        .reply(&mut conn, MessageKind::Predecessor { peer })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                MessageKind::GetSuccessors => {
                    let peers = self.chord.successors().await;
                    if self
                        .reply(&mut conn, MessageKind::Successors { peers })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                MessageKind::Notify => {
                    self.chord.notify_received(sender).await;
                }
                MessageKind::Ping => {
                    if self
                        .reply(&mut conn, MessageKind::Ack { status: None })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                other => {
                    warn!(%remote, kind = ?other, "unexpected message, closing connection");
                    break;
                }
            }
        }
        conn.close().await;
    }

    async fn reply(&self, conn: &mut Conn, kind: MessageKind) -> Result<(), TransportError> {
        conn.send(&self.dialer.message(kind)).await
    }

    /// Storer side of BACKUP: refuse on space or duplicate, otherwise
    /// receive the blob and register it.
    async fn handle_backup(
        &self,
        conn: &mut Conn,
        file_id: String,
        size: u64,
        owner: PeerRef,
        key: ChordId,
        replication_degree: u32,
    ) {
        let refusal = {
            let db = self.db.lock().await;
            match (
                data::has_space(&db, size),
                data::has_stored_file(&db, &file_id),
            ) {
                (Ok(false), _) => Some(REASON_NO_SPACE),
                (_, Ok(true)) => Some(REASON_HAVE_FILE),
                (Ok(true), Ok(false)) => None,
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "state database failed during backup check");
                    return;
                }
            }
        };

        if let Some(reason) = refusal {
            debug!(file_id = %file_id, reason, "refusing BACKUP");
            let _ = self
                .reply(
                    conn,
                    MessageKind::Nack {
                        reason: Some(reason.to_string()),
                    },
                )
                .await;
            return;
        }

        if self.reply(conn, MessageKind::Ack { status: None }).await.is_err() {
            return;
        }

        let path = self.blob_path(&file_id);
        let mut blob = match tokio::fs::File::create(&path).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "could not create blob file");
                return;
            }
        };
        if let Err(e) = conn.receive_file(&mut blob, size).await {
            debug!(file_id = %file_id, error = %e, "backup stream broke, dropping partial blob");
            drop(blob);
            let _ = tokio::fs::remove_file(&path).await;
            return;
        }

        {
            let db = self.db.lock().await;
            let entry = PeerFile::stored(file_id.clone(), owner, size, replication_degree, key);
            if let Err(e) = data::add_stored_file(&db, &entry) {
                warn!(file_id = %file_id, error = %e, "failed to register stored file");
                drop(db);
                let _ = tokio::fs::remove_file(&path).await;
                return;
            }
        }

        let _ = self.reply(conn, MessageKind::Ack { status: None }).await;
        info!(file_id = %file_id, size, owner = %owner, key, "stored file");
    }

    /// Storer side of GET: confirm availability, then stream on the second
    /// GET.
    async fn handle_get(&self, conn: &mut Conn, file_id: &str) {
        let stored = {
            let db = self.db.lock().await;
            data::get_stored_file(&db, file_id)
        };
        let file = match stored {
            Ok(Some(file)) => file,
            Ok(None) => {
                debug!(file_id, "GET for unknown file");
                let _ = self.reply(conn, MessageKind::Nack { reason: None }).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "state database failed during GET");
                return;
            }
        };

        if self.reply(conn, MessageKind::Ack { status: None }).await.is_err() {
            return;
        }

        // the requester repeats the GET when it is ready to receive
        match conn
            .receive_blocking(self.config.inbound_idle_timeout())
            .await
        {
            Ok(message) if matches!(message.kind, MessageKind::Get { .. }) => {}
            Ok(message) => {
                warn!(kind = ?message.kind, "expected second GET, closing");
                return;
            }
            Err(e) => {
                debug!(error = %e, "second GET never arrived");
                return;
            }
        }

        let mut blob = match tokio::fs::File::open(self.blob_path(file_id)).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(file_id, error = %e, "stored blob unreadable");
                return;
            }
        };
        match conn.send_file(&mut blob, file.size).await {
            Ok(()) => info!(file_id, size = file.size, "served file"),
            Err(e) => debug!(file_id, error = %e, "file stream broke"),
        }
    }

    /// Storer side of DELETE. Idempotent: deleting an unknown file is a
    /// no-op.
    async fn handle_delete(&self, file_id: &str) {
        let _ = tokio::fs::remove_file(self.blob_path(file_id)).await;
        let db = self.db.lock().await;
        if let Err(e) = data::remove_stored_file(&db, file_id) {
            warn!(file_id, error = %e, "failed to drop stored entry");
            return;
        }
        if let Err(e) = data::update_occupation(&db, &self.files_dir) {
            warn!(error = %e, "failed to update occupation");
        }
        info!(file_id, "deleted stored file");
    }

    /// Owner side of REMOVED: drop the key and re-backup when the file
    /// fell below its replication degree.
    pub(crate) async fn apply_removed(self: &Arc<Self>, file_id: &str, key: ChordId) {
        let entry = {
            let db = self.db.lock().await;
            let filename = match data::get_sent_filename_by_id(&db, file_id) {
                Ok(Some(name)) => name,
                Ok(None) => {
                    debug!(file_id, "REMOVED for unknown file");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "state database failed during REMOVED");
                    return;
                }
            };
            if let Err(e) = data::remove_sent_key(&db, &filename, key) {
                warn!(error = %e, "failed to drop sent key");
                return;
            }
            data::get_sent_file(&db, &filename)
                .ok()
                .flatten()
                .map(|file| (filename, file))
        };
        let Some((filename, file)) = entry else {
            return;
        };
        info!(file_id, key, remaining = file.keys.len(), "copy lost");

        if file.being_deleted || file.keys.len() >= file.replication_degree as usize {
            return;
        }

        // below the replication degree: re-backup, avoiding current holders
        let mut exclude = HashSet::new();
        for held_key in &file.keys {
            let holder = self.chord.find_successor(*held_key).await;
            exclude.insert(holder.guid);
        }

        info!(filename = %filename, "replication degree lost, scheduling re-backup");
        let peer = self.clone();
        let degree = file.replication_degree;
        self.client_pool.spawn(async move {
            peer.run_backup(&filename, degree, &exclude).await;
        });
    }
}
