//! End-to-end ring scenarios over loopback TCP.
//!
//! Each test builds a small ring of real peers on ephemeral ports, waits for
//! stabilization, and drives the command façade, asserting on notifications
//! and on the peers' registries. Addresses are picked so the ring guids are
//! well spread and the backup initiator owns a small arc, keeping random
//! key draws overwhelmingly likely to resolve onto other peers.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use capstan_core::chord::id::guid_for_address;
use capstan_core::{Peer, PeerConfig, CHORD_MAX_PEERS, DEFAULT_CAPACITY};

const STABILIZE_TIMEOUT: Duration = Duration::from_secs(20);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(50);

fn ring_distance(a: u32, b: u32) -> u32 {
    let d = a.abs_diff(b);
    d.min(CHORD_MAX_PEERS - d)
}

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Pick `n` loopback addresses whose guids are pairwise at least 24 apart.
async fn spread_addrs(n: usize) -> Vec<SocketAddr> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut picked: Vec<SocketAddr> = Vec::new();
    while picked.len() < n {
        assert!(
            Instant::now() < deadline,
            "could not find {} spread addresses",
            n
        );
        let addr = free_addr().await;
        let guid = guid_for_address(&addr);
        if picked
            .iter()
            .all(|a| ring_distance(guid, guid_for_address(a)) >= 24)
        {
            picked.push(addr);
        }
    }
    picked
}

/// Index of the address owning the smallest arc: the best backup initiator,
/// since random keys rarely resolve onto it.
fn smallest_arc_index(addrs: &[SocketAddr]) -> usize {
    let guids: Vec<u32> = addrs.iter().map(guid_for_address).collect();
    let mut sorted = guids.clone();
    sorted.sort_unstable();
    let arc_of = |guid: u32| {
        let pos = sorted.iter().position(|g| *g == guid).unwrap();
        let pred = sorted[(pos + sorted.len() - 1) % sorted.len()];
        (guid + CHORD_MAX_PEERS - pred) % CHORD_MAX_PEERS
    };
    guids
        .iter()
        .enumerate()
        .min_by_key(|(_, g)| arc_of(**g))
        .map(|(index, _)| index)
        .unwrap()
}

async fn start_peer(
    root: &Path,
    addr: SocketAddr,
    bootstrap: Option<SocketAddr>,
    seed: u64,
    capacity: Option<u64>,
) -> Arc<Peer> {
    let mut config = PeerConfig::for_testing()
        .with_listen_addr(addr)
        .with_root(root.to_path_buf())
        .with_rng_seed(seed);
    if let Some(bootstrap) = bootstrap {
        config = config.with_bootstrap(bootstrap);
    }
    if let Some(capacity) = capacity {
        config = config.with_capacity(capacity);
    }
    Peer::start(config).await.expect("peer failed to start")
}

/// Start a ring: the first address bootstraps, the rest join through it.
async fn start_ring(root: &Path, addrs: &[SocketAddr]) -> Vec<Arc<Peer>> {
    let mut peers = Vec::with_capacity(addrs.len());
    peers.push(start_peer(root, addrs[0], None, 1, None).await);
    for (i, addr) in addrs.iter().enumerate().skip(1) {
        peers.push(start_peer(root, *addr, Some(addrs[0]), 1 + i as u64, None).await);
    }
    wait_for_stable_ring(&peers).await;
    peers
}

/// Wait until every peer agrees on ring order (successor and predecessor).
async fn wait_for_stable_ring(peers: &[Arc<Peer>]) {
    let mut guids: Vec<u32> = peers.iter().map(|p| p.reference().guid).collect();
    guids.sort_unstable();
    let expect = |guid: u32, offset: usize| {
        let pos = guids.iter().position(|g| *g == guid).unwrap();
        guids[(pos + offset) % guids.len()]
    };

    let deadline = Instant::now() + STABILIZE_TIMEOUT;
    loop {
        let mut stable = true;
        for peer in peers {
            let snapshot = peer.ring_snapshot().await;
            let guid = peer.reference().guid;
            let successor_ok = snapshot.successor.guid == expect(guid, 1);
            let predecessor_ok =
                snapshot.predecessor.map(|p| p.guid) == Some(expect(guid, guids.len() - 1));
            if !successor_ok || !predecessor_ok {
                stable = false;
                break;
            }
        }
        if stable {
            return;
        }
        assert!(Instant::now() < deadline, "ring did not stabilize");
        tokio::time::sleep(POLL).await;
    }
}

async fn next_notification(rx: &mut mpsc::Receiver<String>) -> String {
    tokio::time::timeout(NOTIFY_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification channel closed")
}

/// Peers other than `initiator` that store `file_id`.
async fn storers_of(peers: &[Arc<Peer>], initiator: usize, file_id: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, peer) in peers.iter().enumerate() {
        if i == initiator {
            continue;
        }
        let stored = peer.stored_files().await.unwrap();
        if stored.iter().any(|f| f.file_id == file_id) {
            out.push(i);
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_peer_ring_stabilizes() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(2).await;
    let peers = start_ring(root.path(), &addrs).await;

    let a = peers[0].ring_snapshot().await;
    let b = peers[1].ring_snapshot().await;
    assert_eq!(a.successor.guid, peers[1].reference().guid);
    assert_eq!(b.successor.guid, peers[0].reference().guid);
    assert_eq!(a.predecessor.map(|p| p.guid), Some(b.local.guid));
    assert_eq!(b.predecessor.map(|p| p.guid), Some(a.local.guid));

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_then_restore_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(3).await;
    let initiator = smallest_arc_index(&addrs);
    let peers = start_ring(root.path(), &addrs).await;
    let owner = &peers[initiator];
    let mut notifications = owner.notifications().await.unwrap();

    // the file to protect
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let file_path = root.path().join("f.txt");
    std::fs::write(&file_path, &payload).unwrap();
    let filename = file_path.to_string_lossy().to_string();

    owner.backup(filename.clone(), 2);
    let result = next_notification(&mut notifications).await;
    assert!(result.contains(&format!("Result for {} with replication degree 2", filename)));
    assert!(
        result.contains("Backup Successful on Peer"),
        "no successful target in: {}",
        result
    );

    // the sent entry tracks the keys of the landed copies
    let sent = owner.sent_files().await.unwrap();
    let (_, entry) = sent.iter().find(|(name, _)| *name == filename).unwrap();
    assert!(!entry.keys.is_empty());
    assert!(entry.keys.len() <= 2);

    // the copies are in other peers' registries
    let holding = storers_of(&peers, initiator, &entry.file_id).await;
    assert!(!holding.is_empty());

    // restore and compare bytes
    owner.restore(filename.clone());
    let result = next_notification(&mut notifications).await;
    assert!(
        result.contains("restored successfully"),
        "restore failed: {}",
        result
    );
    let restored = root
        .path()
        .join(owner.reference().guid.to_string())
        .join("restored_f.txt");
    assert_eq!(std::fs::read(&restored).unwrap(), payload);

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_clears_storers() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(3).await;
    let initiator = smallest_arc_index(&addrs);
    let peers = start_ring(root.path(), &addrs).await;
    let owner = &peers[initiator];
    let mut notifications = owner.notifications().await.unwrap();

    let file_path = root.path().join("doomed.bin");
    std::fs::write(&file_path, [9u8; 2048]).unwrap();
    let filename = file_path.to_string_lossy().to_string();

    owner.backup(filename.clone(), 2);
    let result = next_notification(&mut notifications).await;
    assert!(result.contains("Backup Successful on Peer"), "{}", result);
    let sent = owner.sent_files().await.unwrap();
    let file_id = sent
        .iter()
        .find(|(name, _)| *name == filename)
        .unwrap()
        .1
        .file_id
        .clone();

    owner.delete(filename.clone());
    let result = next_notification(&mut notifications).await;
    assert!(result.contains(&format!("DELETE for {}", filename)), "{}", result);

    // storers drop the file; the sent entry is purged after dispatch
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let nobody_stores = storers_of(&peers, initiator, &file_id).await.is_empty();
        let entry_gone = !owner
            .sent_files()
            .await
            .unwrap()
            .iter()
            .any(|(name, _)| *name == filename);
        if nobody_stores && entry_gone {
            break;
        }
        assert!(Instant::now() < deadline, "DELETE did not propagate");
        tokio::time::sleep(POLL).await;
    }

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reclaim_evicts_notifies_owner_and_triggers_rebackup() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(3).await;
    let initiator = smallest_arc_index(&addrs);
    let peers = start_ring(root.path(), &addrs).await;
    let owner = &peers[initiator];
    let mut notifications = owner.notifications().await.unwrap();

    let file_path = root.path().join("precious.bin");
    std::fs::write(&file_path, [3u8; 4096]).unwrap();
    let filename = file_path.to_string_lossy().to_string();

    owner.backup(filename.clone(), 1);
    let result = next_notification(&mut notifications).await;
    assert!(result.contains("Backup Successful on Peer"), "{}", result);

    let sent = owner.sent_files().await.unwrap();
    let file_id = sent
        .iter()
        .find(|(name, _)| *name == filename)
        .unwrap()
        .1
        .file_id
        .clone();
    let holding = storers_of(&peers, initiator, &file_id).await;
    assert_eq!(holding.len(), 1);
    let storer = &peers[holding[0]];
    let mut storer_notifications = storer.notifications().await.unwrap();

    storer.reclaim(0);
    let result = next_notification(&mut storer_notifications).await;
    assert!(result.contains("Reclaim successful"), "{}", result);

    // capacity is back at the default (the re-backup may already be
    // repopulating the storer, so occupation is not asserted here)
    let (capacity, _) = storer.storage_info().await.unwrap();
    assert_eq!(capacity, DEFAULT_CAPACITY);

    // REMOVED reached the owner, which re-backs the file up somewhere
    let result = next_notification(&mut notifications).await;
    assert!(
        result.contains(&format!("Result for {} with replication degree 1", filename)),
        "expected a re-backup result, got: {}",
        result
    );

    // the file is protected again
    let deadline = Instant::now() + Duration::from_secs(10);
    while storers_of(&peers, initiator, &file_id).await.is_empty() {
        assert!(Instant::now() < deadline, "re-backup never landed");
        tokio::time::sleep(POLL).await;
    }

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_storer_replies_no_space() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(2).await;
    let initiator = smallest_arc_index(&addrs);
    let other = 1 - initiator;

    // start the storer with a capacity far below the file size
    let capacity_for = |index: usize| (index == other).then_some(16);
    let peers = vec![
        start_peer(root.path(), addrs[0], None, 1, capacity_for(0)).await,
        start_peer(root.path(), addrs[1], Some(addrs[0]), 2, capacity_for(1)).await,
    ];
    wait_for_stable_ring(&peers).await;

    let owner = &peers[initiator];
    let mut notifications = owner.notifications().await.unwrap();

    let file_path = root.path().join("big.bin");
    std::fs::write(&file_path, [1u8; 4096]).unwrap();
    let filename = file_path.to_string_lossy().to_string();

    owner.backup(filename.clone(), 1);
    let result = next_notification(&mut notifications).await;
    assert!(
        result.contains("has no space"),
        "expected NOSPACE refusal, got: {}",
        result
    );

    // nothing was written or registered on the storer
    assert!(peers[other].stored_files().await.unwrap().is_empty());

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_backup_reports_have_file_and_keeps_key() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(2).await;
    let initiator = smallest_arc_index(&addrs);
    let peers = start_ring(root.path(), &addrs).await;
    let owner = &peers[initiator];
    let mut notifications = owner.notifications().await.unwrap();

    let file_path = root.path().join("twice.bin");
    std::fs::write(&file_path, [5u8; 512]).unwrap();
    let filename = file_path.to_string_lossy().to_string();

    owner.backup(filename.clone(), 1);
    let result = next_notification(&mut notifications).await;
    assert!(result.contains("Backup Successful on Peer"), "{}", result);

    owner.backup(filename.clone(), 1);
    let result = next_notification(&mut notifications).await;
    assert!(
        result.contains("already has the file"),
        "expected HAVEFILE, got: {}",
        result
    );

    // the initiator still recorded the key for the existing copy
    let sent = owner.sent_files().await.unwrap();
    let (_, entry) = sent.iter().find(|(name, _)| *name == filename).unwrap();
    assert!(!entry.keys.is_empty());

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversubscribed_replication_caps_at_ring_size() {
    let root = tempfile::tempdir().unwrap();
    let addrs = spread_addrs(3).await;
    let initiator = smallest_arc_index(&addrs);
    let peers = start_ring(root.path(), &addrs).await;
    let owner = &peers[initiator];
    let mut notifications = owner.notifications().await.unwrap();

    let file_path = root.path().join("wide.bin");
    std::fs::write(&file_path, [8u8; 256]).unwrap();
    let filename = file_path.to_string_lossy().to_string();

    // degree far beyond the two other peers in the ring
    owner.backup(filename.clone(), 10);
    let result = next_notification(&mut notifications).await;
    assert!(result.contains("Result for"), "{}", result);

    let outcome_lines = result
        .lines()
        .filter(|line| line.contains("Peer") && !line.contains("Result for"))
        .count();
    assert!(outcome_lines >= 1, "no per-target outcomes in: {}", result);
    assert!(
        outcome_lines <= 2,
        "more outcomes than distinct non-self peers in: {}",
        result
    );

    let sent = owner.sent_files().await.unwrap();
    let (_, entry) = sent.iter().find(|(name, _)| *name == filename).unwrap();
    assert!(entry.keys.len() <= 2);

    for peer in &peers {
        peer.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn solitary_peer_refuses_backup() {
    let root = tempfile::tempdir().unwrap();
    let addr = free_addr().await;
    let peer = start_peer(root.path(), addr, None, 1, None).await;
    let mut notifications = peer.notifications().await.unwrap();

    let file_path = root.path().join("alone.bin");
    std::fs::write(&file_path, [1u8; 64]).unwrap();

    peer.backup(file_path.to_string_lossy().to_string(), 1);
    let result = next_notification(&mut notifications).await;
    assert!(
        result.contains("has not joined a ring"),
        "expected a solitary refusal, got: {}",
        result
    );

    peer.stop().await;
}
