//! Chord overlay
//!
//! Ring membership and routing. The pure state lives in [`ring::RingState`];
//! this module owns it behind one lock and layers the remote operations on
//! top: recursive successor lookup, joining through a bootstrap peer, and
//! the periodic maintenance rounds in [`tasks`].

pub mod id;
pub mod ring;
mod tasks;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::network::transport::Dialer;
use crate::network::{MessageKind, SecureStream, TransportError};

use id::{finger_start, in_open, in_open_closed, ChordId, PeerRef, M};
use ring::RingState;

/// Read-only view of the ring state, for STATE/CHORD reporting and tests.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub local: PeerRef,
    pub predecessor: Option<PeerRef>,
    pub successor: PeerRef,
    pub successors: Vec<PeerRef>,
    /// `(interval start, entry)` per finger index.
    pub fingers: Vec<(ChordId, Option<PeerRef>)>,
}

impl RingSnapshot {
    /// The routing view as human-readable text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("GUID: {}\n", self.local.guid));
        out.push_str(&format!("Address: {}\n", self.local.addr));
        match self.predecessor {
            Some(p) => out.push_str(&format!("Predecessor: {}\n", p)),
            None => out.push_str("Predecessor: (none)\n"),
        }
        out.push_str(&format!(
            "Successors: {}\n",
            self.successors
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        out.push_str("Finger table:\n");
        for (i, (start, entry)) in self.fingers.iter().enumerate() {
            match entry {
                Some(f) => out.push_str(&format!("  [{}] start={} -> {}\n", i, start, f)),
                None => out.push_str(&format!("  [{}] start={} -> (unset)\n", i, start)),
            }
        }
        out
    }
}

/// The ring overlay service of one peer.
pub struct Chord {
    local: PeerRef,
    dialer: Dialer,
    lookup_timeout: Duration,
    state: RwLock<RingState>,
}

impl Chord {
    pub fn new(local: PeerRef, dialer: Dialer, lookup_timeout: Duration) -> Self {
        Self {
            local,
            dialer,
            lookup_timeout,
            state: RwLock::new(RingState::new(local)),
        }
    }

    pub fn local(&self) -> PeerRef {
        self.local
    }

    /// Whether any other ring member is known.
    pub async fn has_peers(&self) -> bool {
        self.state.read().await.has_peers()
    }

    pub async fn predecessor(&self) -> Option<PeerRef> {
        self.state.read().await.predecessor
    }

    pub async fn successors(&self) -> Vec<PeerRef> {
        self.state.read().await.successors()
    }

    pub async fn snapshot(&self) -> RingSnapshot {
        let ring = self.state.read().await;
        RingSnapshot {
            local: self.local,
            predecessor: ring.predecessor,
            successor: ring.successor(),
            successors: ring.successors(),
            fingers: (0..M)
                .map(|i| (finger_start(self.local.guid, i), ring.finger(i)))
                .collect(),
        }
    }

    /// Join the ring through `bootstrap`; joining through our own address
    /// starts a new ring.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<(), TransportError> {
        if bootstrap == self.local.addr {
            debug!("bootstrapping a new ring");
            return Ok(());
        }
        let boot = PeerRef::new(bootstrap);
        let successor = self.remote_find_successor(&boot, self.local.guid).await?;
        if successor.guid == self.local.guid {
            warn!(%successor, "bootstrap resolved our own guid, staying solitary");
            return Ok(());
        }
        self.state.write().await.set_successor(successor);
        debug!(%successor, "joined ring");
        Ok(())
    }

    /// Resolve the peer responsible for `k`.
    ///
    /// Purely local when the answer is this peer or its successor; otherwise
    /// forwards through the closest preceding finger, falling back finger by
    /// finger (flagging the failed ones stale) and finally to the successor.
    pub async fn find_successor(&self, k: ChordId) -> PeerRef {
        let (candidates, successor) = {
            let ring = self.state.read().await;
            if !ring.has_peers() || k == self.local.guid {
                return self.local;
            }
            if let Some(pred) = ring.predecessor {
                if in_open_closed(pred.guid, k, self.local.guid) {
                    return self.local;
                }
            }
            let successor = ring.successor();
            if in_open_closed(self.local.guid, k, successor.guid) {
                return successor;
            }
            (ring.closest_preceding(k), successor)
        };

        for candidate in candidates {
            if candidate.guid == self.local.guid || candidate.guid == successor.guid {
                continue;
            }
            match self.remote_find_successor(&candidate, k).await {
                Ok(answer) => return answer,
                Err(e) => {
                    debug!(finger = %candidate, error = %e, "finger failed, flagging stale");
                    self.state.write().await.clear_fingers_for(candidate.guid);
                }
            }
        }

        // no usable finger precedes k; let the successor resolve it
        match self.remote_find_successor(&successor, k).await {
            Ok(answer) => answer,
            Err(e) => {
                debug!(successor = %successor, error = %e, "successor lookup failed");
                successor
            }
        }
    }

    /// Ask `via` to resolve the successor of `k`.
    async fn remote_find_successor(
        &self,
        via: &PeerRef,
        k: ChordId,
    ) -> Result<PeerRef, TransportError> {
        let mut conn = self.dialer.dial(via.addr).await?;
        let outcome = self.lookup_on(&mut conn, k).await;
        conn.close().await;
        outcome
    }

    async fn lookup_on(
        &self,
        conn: &mut SecureStream<tokio::net::TcpStream>,
        k: ChordId,
    ) -> Result<PeerRef, TransportError> {
        conn.send(&self.dialer.message(MessageKind::Lookup { key: k }))
            .await?;
        let reply = conn.receive_blocking(self.lookup_timeout).await?;
        match reply.kind {
            MessageKind::Successor { peer } => Ok(peer),
            other => Err(TransportError::Protocol(format!(
                "expected successor reply, got {:?}",
                other
            ))),
        }
    }

    /// Handle an inbound NOTIFY: adopt `n` when it improves the predecessor.
    pub async fn notify_received(&self, n: PeerRef) {
        if n.guid == self.local.guid {
            return;
        }
        let mut ring = self.state.write().await;
        let adopt = match ring.predecessor {
            None => true,
            Some(pred) => in_open(pred.guid, n.guid, self.local.guid),
        };
        if adopt {
            debug!(predecessor = %n, "adopted predecessor");
            ring.predecessor = Some(n);
        }
    }

    /// One stabilization round.
    ///
    /// Solitary peers close the loop locally once a predecessor appears;
    /// otherwise this asks the successor for its predecessor and successor
    /// list, adopting a closer successor when one surfaced.
    pub(crate) async fn stabilize_once(&self) {
        let (successor, own_pred) = {
            let ring = self.state.read().await;
            (ring.successor(), ring.predecessor)
        };

        if successor.guid == self.local.guid {
            if let Some(p) = own_pred {
                if p.guid != self.local.guid {
                    self.state.write().await.set_successor(p);
                    debug!(successor = %p, "closed the ring through predecessor");
                }
            }
            return;
        }

        if let Err(e) = self.stabilize_with(successor).await {
            warn!(successor = %successor, error = %e, "successor failed, promoting next");
            let mut ring = self.state.write().await;
            ring.clear_fingers_for(successor.guid);
            ring.promote_successor();
        }
    }

    async fn stabilize_with(&self, successor: PeerRef) -> Result<(), TransportError> {
        let mut conn = self.dialer.dial(successor.addr).await?;
        let outcome = self.stabilize_round(&mut conn, successor).await;
        conn.close().await;
        outcome
    }

    async fn stabilize_round(
        &self,
        conn: &mut SecureStream<tokio::net::TcpStream>,
        successor: PeerRef,
    ) -> Result<(), TransportError> {
        conn.send(&self.dialer.message(MessageKind::GetPredecessor))
            .await?;
        let reply = conn.receive_blocking(self.lookup_timeout).await?;
        let between = match reply.kind {
            MessageKind::Predecessor { peer } => peer.filter(|p| {
                p.guid != self.local.guid && in_open(self.local.guid, p.guid, successor.guid)
            }),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected predecessor reply, got {:?}",
                    other
                )))
            }
        };

        if let Some(p) = between {
            // a closer successor surfaced; switch the round over to it
            self.state.write().await.set_successor(p);
            debug!(successor = %p, "adopted closer successor");
            match self.dialer.dial(p.addr).await {
                Ok(mut fresh) => {
                    let outcome = self.finish_round(&mut fresh).await;
                    fresh.close().await;
                    return outcome;
                }
                Err(e) => {
                    debug!(successor = %p, error = %e, "new successor unreachable");
                    let mut ring = self.state.write().await;
                    ring.promote_successor();
                    return Ok(());
                }
            }
        }

        self.finish_round(conn).await
    }

    /// Second half of a stabilize round: copy the successor list, notify.
    async fn finish_round(
        &self,
        conn: &mut SecureStream<tokio::net::TcpStream>,
    ) -> Result<(), TransportError> {
        conn.send(&self.dialer.message(MessageKind::GetSuccessors))
            .await?;
        let reply = conn.receive_blocking(self.lookup_timeout).await?;
        match reply.kind {
            MessageKind::Successors { peers } => {
                self.state.write().await.adopt_successor_list(peers);
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected successors reply, got {:?}",
                    other
                )))
            }
        }
        conn.send(&self.dialer.message(MessageKind::Notify)).await?;
        Ok(())
    }

    /// Refresh one finger per round, round-robin over the table.
    pub(crate) async fn fix_fingers_once(&self) {
        let (index, start) = {
            let mut ring = self.state.write().await;
            if !ring.has_peers() {
                return;
            }
            let index = ring.advance_finger_index();
            (index, finger_start(self.local.guid, index))
        };
        let entry = self.find_successor(start).await;
        self.state.write().await.set_finger(index, entry);
    }

    /// Probe the predecessor and forget it when unreachable.
    pub(crate) async fn check_predecessor_once(&self) {
        let Some(pred) = self.predecessor().await else {
            return;
        };
        if self.ping(&pred).await {
            return;
        }
        debug!(predecessor = %pred, "predecessor unreachable, clearing");
        let mut ring = self.state.write().await;
        if ring.predecessor.map(|p| p.guid) == Some(pred.guid) {
            ring.predecessor = None;
        }
    }

    async fn ping(&self, peer: &PeerRef) -> bool {
        let Ok(mut conn) = self.dialer.dial(peer.addr).await else {
            return false;
        };
        let alive = async {
            conn.send(&self.dialer.message(MessageKind::Ping)).await?;
            conn.receive_blocking(self.lookup_timeout).await
        }
        .await
        .map(|reply| matches!(reply.kind, MessageKind::Ack { .. }))
        .unwrap_or(false);
        conn.close().await;
        alive
    }
}
