//! Ring routing state
//!
//! Pure, lock-free bookkeeping for one peer's view of the ring: the finger
//! table, the predecessor, and a short successor list. All mutation goes
//! through the owning [`Chord`](super::Chord) service, which serializes
//! writers; this module holds no networking.

use super::id::{in_open, ChordId, PeerRef, M};

/// Entries kept in the successor list.
pub const SUCCESSOR_LIST_LEN: usize = 4;

/// One peer's routing view of the ring.
///
/// `fingers[i]` caches the successor of `guid + 2^i`; `fingers[0]` is the
/// canonical successor. A `None` entry is unset or was flagged stale after a
/// failed contact.
#[derive(Debug, Clone)]
pub struct RingState {
    local: PeerRef,
    /// Previous peer on the ring, once known.
    pub predecessor: Option<PeerRef>,
    fingers: [Option<PeerRef>; M as usize],
    successors: Vec<PeerRef>,
    next_finger: u32,
}

impl RingState {
    /// Fresh solitary state: own successor, no predecessor.
    pub fn new(local: PeerRef) -> Self {
        let mut fingers = [None; M as usize];
        fingers[0] = Some(local);
        Self {
            local,
            predecessor: None,
            fingers,
            successors: vec![local],
            next_finger: 0,
        }
    }

    /// Canonical successor; self while solitary.
    pub fn successor(&self) -> PeerRef {
        self.fingers[0].unwrap_or(self.local)
    }

    /// Whether any other peer is known. BACKUP requires this.
    pub fn has_peers(&self) -> bool {
        self.successor().guid != self.local.guid
    }

    /// Install a new canonical successor.
    pub fn set_successor(&mut self, peer: PeerRef) {
        self.fingers[0] = Some(peer);
        if self.successors.first() != Some(&peer) {
            self.successors.retain(|s| *s != peer);
            self.successors.insert(0, peer);
            self.successors.truncate(SUCCESSOR_LIST_LEN);
        }
    }

    /// Replace the successor list with `[successor] + tail`, truncated.
    pub fn adopt_successor_list(&mut self, tail: Vec<PeerRef>) {
        let head = self.successor();
        let mut list = vec![head];
        for s in tail {
            if s.guid != self.local.guid && !list.contains(&s) {
                list.push(s);
            }
        }
        list.truncate(SUCCESSOR_LIST_LEN);
        self.successors = list;
    }

    /// Ordered successor list snapshot.
    pub fn successors(&self) -> Vec<PeerRef> {
        self.successors.clone()
    }

    /// Drop the failed head of the successor list and promote the next live
    /// entry (self if the list runs dry).
    pub fn promote_successor(&mut self) -> PeerRef {
        if !self.successors.is_empty() {
            self.successors.remove(0);
        }
        let next = self.successors.first().copied().unwrap_or(self.local);
        self.fingers[0] = Some(next);
        next
    }

    pub fn finger(&self, i: u32) -> Option<PeerRef> {
        self.fingers[i as usize]
    }

    pub fn set_finger(&mut self, i: u32, peer: PeerRef) {
        if i == 0 {
            self.set_successor(peer);
        } else {
            self.fingers[i as usize] = Some(peer);
        }
    }

    /// Flag every finger pointing at `guid` as stale.
    pub fn clear_fingers_for(&mut self, guid: ChordId) {
        for i in 1..M as usize {
            if self.fingers[i].map(|f| f.guid) == Some(guid) {
                self.fingers[i] = None;
            }
        }
    }

    /// Round-robin finger index for `fix_fingers`; skips index 0, which is
    /// maintained by stabilization.
    pub fn advance_finger_index(&mut self) -> u32 {
        self.next_finger = self.next_finger % (M - 1) + 1;
        self.next_finger
    }

    /// Fingers whose guid lies in `(local, k)`, scanned high to low.
    ///
    /// Ordered candidates for routing: the first is the closest preceding
    /// node; the rest are fallbacks if it cannot be reached.
    pub fn closest_preceding(&self, k: ChordId) -> Vec<PeerRef> {
        let mut out = Vec::new();
        for i in (0..M as usize).rev() {
            if let Some(f) = self.fingers[i] {
                if in_open(self.local.guid, f.guid, k) && !out.contains(&f) {
                    out.push(f);
                }
            }
        }
        out
    }

}
