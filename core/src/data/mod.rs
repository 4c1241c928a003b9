//! Persistent peer state
//!
//! SQLite-backed registry of the two file maps plus storage accounting,
//! written through on every mutation. The database lives at
//! `<root>/<guid>/state` next to the stored blobs.
//!
//! # Tables
//!
//! - `sent_files`: files this peer owns and has backed up elsewhere
//! - `sent_file_keys`: routing keys under which copies of a sent file exist
//! - `stored_files`: files held on behalf of other peers
//! - `storage`: single-row capacity/occupation pair

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::UNIX_EPOCH;

use rusqlite::{params, Connection, OptionalExtension};

use crate::chord::id::{ChordId, PeerRef};

/// A file tracked by the peer, in either registry.
///
/// In the sent-files map `local_key` is unset and `keys` accumulates the
/// routing keys of live copies; in the stored-files map `local_key` is the
/// key this peer serves the file under and `keys` is unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFile {
    pub file_id: String,
    pub owner: PeerRef,
    pub size: u64,
    pub replication_degree: u32,
    pub keys: BTreeSet<ChordId>,
    pub local_key: Option<ChordId>,
    pub being_deleted: bool,
}

impl PeerFile {
    /// Entry for a file this peer is backing up onto others.
    pub fn sent(file_id: String, owner: PeerRef, size: u64, replication_degree: u32) -> Self {
        Self {
            file_id,
            owner,
            size,
            replication_degree,
            keys: BTreeSet::new(),
            local_key: None,
            being_deleted: false,
        }
    }

    /// Entry for a file stored here on behalf of `owner`.
    pub fn stored(
        file_id: String,
        owner: PeerRef,
        size: u64,
        replication_degree: u32,
        local_key: ChordId,
    ) -> Self {
        Self {
            file_id,
            owner,
            size,
            replication_degree,
            keys: BTreeSet::new(),
            local_key: Some(local_key),
            being_deleted: false,
        }
    }
}

/// Create the schema and seed the storage row on first run.
pub fn create_tables(conn: &Connection, default_capacity: u64) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sent_files (
            filename TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            owner_addr TEXT NOT NULL,
            owner_guid INTEGER NOT NULL,
            size INTEGER NOT NULL,
            replication_degree INTEGER NOT NULL,
            being_deleted INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS sent_file_keys (
            filename TEXT NOT NULL,
            key INTEGER NOT NULL,
            PRIMARY KEY (filename, key)
        );
        CREATE TABLE IF NOT EXISTS stored_files (
            file_id TEXT PRIMARY KEY,
            owner_addr TEXT NOT NULL,
            owner_guid INTEGER NOT NULL,
            size INTEGER NOT NULL,
            replication_degree INTEGER NOT NULL,
            local_key INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS storage (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            capacity INTEGER NOT NULL,
            occupation INTEGER NOT NULL
        );",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO storage (id, capacity, occupation) VALUES (1, ?1, 0)",
        params![default_capacity as i64],
    )?;
    Ok(())
}

fn parse_owner(row: &rusqlite::Row, addr_idx: usize, guid_idx: usize) -> rusqlite::Result<PeerRef> {
    let addr_text: String = row.get(addr_idx)?;
    let guid: u32 = row.get(guid_idx)?;
    let addr: SocketAddr = addr_text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            addr_idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;
    Ok(PeerRef::with_guid(addr, guid))
}

fn parse_sent_row(row: &rusqlite::Row) -> rusqlite::Result<(String, PeerFile)> {
    let filename: String = row.get(0)?;
    let size: i64 = row.get(4)?;
    let being_deleted: bool = row.get(6)?;
    Ok((
        filename,
        PeerFile {
            file_id: row.get(1)?,
            owner: parse_owner(row, 2, 3)?,
            size: size as u64,
            replication_degree: row.get(5)?,
            keys: BTreeSet::new(),
            local_key: None,
            being_deleted,
        },
    ))
}

fn parse_stored_row(row: &rusqlite::Row) -> rusqlite::Result<PeerFile> {
    let size: i64 = row.get(3)?;
    let local_key: i64 = row.get(5)?;
    Ok(PeerFile {
        file_id: row.get(0)?,
        owner: parse_owner(row, 1, 2)?,
        size: size as u64,
        replication_degree: row.get(4)?,
        keys: BTreeSet::new(),
        local_key: (local_key >= 0).then(|| local_key as ChordId),
        being_deleted: false,
    })
}

fn sent_keys(conn: &Connection, filename: &str) -> rusqlite::Result<BTreeSet<ChordId>> {
    let mut stmt =
        conn.prepare("SELECT key FROM sent_file_keys WHERE filename = ?1 ORDER BY key")?;
    let keys = stmt
        .query_map(params![filename], |row| row.get::<_, u32>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(keys)
}

/// Insert or replace a sent-files entry, keys included.
pub fn add_sent_file(conn: &Connection, filename: &str, file: &PeerFile) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sent_files
         (filename, file_id, owner_addr, owner_guid, size, replication_degree, being_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            filename,
            file.file_id,
            file.owner.addr.to_string(),
            file.owner.guid,
            file.size as i64,
            file.replication_degree,
            file.being_deleted,
        ],
    )?;
    conn.execute(
        "DELETE FROM sent_file_keys WHERE filename = ?1",
        params![filename],
    )?;
    for key in &file.keys {
        conn.execute(
            "INSERT OR IGNORE INTO sent_file_keys (filename, key) VALUES (?1, ?2)",
            params![filename, key],
        )?;
    }
    Ok(())
}

pub fn get_sent_file(conn: &Connection, filename: &str) -> rusqlite::Result<Option<PeerFile>> {
    let entry = conn
        .query_row(
            "SELECT filename, file_id, owner_addr, owner_guid, size, replication_degree,
                    being_deleted
             FROM sent_files WHERE filename = ?1",
            params![filename],
            parse_sent_row,
        )
        .optional()?;
    match entry {
        Some((name, mut file)) => {
            file.keys = sent_keys(conn, &name)?;
            Ok(Some(file))
        }
        None => Ok(None),
    }
}

/// Reverse lookup: which local filename was backed up as `file_id`.
pub fn get_sent_filename_by_id(
    conn: &Connection,
    file_id: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT filename FROM sent_files WHERE file_id = ?1",
        params![file_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn list_sent_files(conn: &Connection) -> rusqlite::Result<Vec<(String, PeerFile)>> {
    let mut stmt = conn.prepare(
        "SELECT filename, file_id, owner_addr, owner_guid, size, replication_degree,
                being_deleted
         FROM sent_files ORDER BY filename",
    )?;
    let rows = stmt
        .query_map(params![], parse_sent_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(rows.len());
    for (name, mut file) in rows {
        file.keys = sent_keys(conn, &name)?;
        out.push((name, file));
    }
    Ok(out)
}

pub fn add_sent_key(conn: &Connection, filename: &str, key: ChordId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sent_file_keys (filename, key) VALUES (?1, ?2)",
        params![filename, key],
    )?;
    Ok(())
}

pub fn remove_sent_key(conn: &Connection, filename: &str, key: ChordId) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM sent_file_keys WHERE filename = ?1 AND key = ?2",
        params![filename, key],
    )?;
    Ok(())
}

pub fn set_being_deleted(conn: &Connection, filename: &str, flag: bool) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sent_files SET being_deleted = ?2 WHERE filename = ?1",
        params![filename, flag],
    )?;
    Ok(())
}

pub fn remove_sent_file(conn: &Connection, filename: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM sent_file_keys WHERE filename = ?1",
        params![filename],
    )?;
    conn.execute("DELETE FROM sent_files WHERE filename = ?1", params![filename])?;
    Ok(())
}

/// Register an accepted file and grow the occupation by its size.
///
/// The occupation may transiently run ahead of the bytes on disk; the next
/// [`update_occupation`] reconciles against actual file sizes.
pub fn add_stored_file(conn: &Connection, file: &PeerFile) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO stored_files
         (file_id, owner_addr, owner_guid, size, replication_degree, local_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            file.file_id,
            file.owner.addr.to_string(),
            file.owner.guid,
            file.size as i64,
            file.replication_degree,
            file.local_key.map(|k| k as i64).unwrap_or(-1),
        ],
    )?;
    conn.execute(
        "UPDATE storage SET occupation = occupation + ?1 WHERE id = 1",
        params![file.size as i64],
    )?;
    Ok(())
}

pub fn get_stored_file(conn: &Connection, file_id: &str) -> rusqlite::Result<Option<PeerFile>> {
    conn.query_row(
        "SELECT file_id, owner_addr, owner_guid, size, replication_degree, local_key
         FROM stored_files WHERE file_id = ?1",
        params![file_id],
        parse_stored_row,
    )
    .optional()
}

pub fn has_stored_file(conn: &Connection, file_id: &str) -> rusqlite::Result<bool> {
    Ok(get_stored_file(conn, file_id)?.is_some())
}

pub fn list_stored_files(conn: &Connection) -> rusqlite::Result<Vec<PeerFile>> {
    let mut stmt = conn.prepare(
        "SELECT file_id, owner_addr, owner_guid, size, replication_degree, local_key
         FROM stored_files ORDER BY file_id",
    )?;
    let rows = stmt
        .query_map(params![], parse_stored_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn remove_stored_file(conn: &Connection, file_id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM stored_files WHERE file_id = ?1", params![file_id])?;
    Ok(())
}

pub fn capacity(conn: &Connection) -> rusqlite::Result<u64> {
    let cap: i64 = conn.query_row("SELECT capacity FROM storage WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(cap.max(0) as u64)
}

pub fn occupation(conn: &Connection) -> rusqlite::Result<u64> {
    let occ: i64 = conn.query_row("SELECT occupation FROM storage WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(occ.max(0) as u64)
}

pub fn set_capacity(conn: &Connection, bytes: u64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE storage SET capacity = ?1 WHERE id = 1",
        params![bytes as i64],
    )?;
    Ok(())
}

/// Whether `bytes` more would still fit: `occupation + bytes ≤ capacity`.
pub fn has_space(conn: &Connection, bytes: u64) -> rusqlite::Result<bool> {
    let cap = capacity(conn)?;
    let occ = occupation(conn)?;
    Ok(occ.saturating_add(bytes) <= cap)
}

/// Recompute the occupation from the on-disk sizes of stored blobs.
///
/// A blob missing from disk counts as zero bytes.
pub fn update_occupation(conn: &Connection, files_dir: &Path) -> rusqlite::Result<u64> {
    let mut stmt = conn.prepare("SELECT file_id FROM stored_files")?;
    let ids = stmt
        .query_map(params![], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let total: u64 = ids
        .iter()
        .filter_map(|id| std::fs::metadata(files_dir.join(id)).ok())
        .map(|meta| meta.len())
        .sum();
    conn.execute(
        "UPDATE storage SET occupation = ?1 WHERE id = 1",
        params![total as i64],
    )?;
    Ok(total)
}

/// Derive a file's identifier and size from its metadata.
///
/// Hashes name, length, timestamps, and the canonical path; distinct files
/// get distinct identifiers with overwhelming probability.
pub fn file_id_for_path(path: &Path) -> std::io::Result<(String, u64)> {
    let meta = std::fs::metadata(path)?;
    let canonical = std::fs::canonicalize(path)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let created = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(&meta.len().to_be_bytes());
    hasher.update(&modified.to_be_bytes());
    hasher.update(&created.to_be_bytes());
    Ok((hasher.finalize().to_hex().to_string(), meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn, 1000).unwrap();
        conn
    }

    fn owner() -> PeerRef {
        PeerRef::with_guid("127.0.0.1:7000".parse().unwrap(), 42)
    }

    #[test]
    fn test_storage_seeded_once() {
        let conn = db();
        assert_eq!(capacity(&conn).unwrap(), 1000);
        assert_eq!(occupation(&conn).unwrap(), 0);
        // re-running the schema does not reset the row
        set_capacity(&conn, 555).unwrap();
        create_tables(&conn, 1000).unwrap();
        assert_eq!(capacity(&conn).unwrap(), 555);
    }

    #[test]
    fn test_sent_file_round_trip_with_keys() {
        let conn = db();
        let mut file = PeerFile::sent("abc123".to_string(), owner(), 2048, 3);
        file.keys.insert(10);
        file.keys.insert(200);
        add_sent_file(&conn, "notes.txt", &file).unwrap();

        let got = get_sent_file(&conn, "notes.txt").unwrap().unwrap();
        assert_eq!(got, file);
        assert_eq!(
            get_sent_filename_by_id(&conn, "abc123").unwrap().as_deref(),
            Some("notes.txt")
        );
        assert!(get_sent_file(&conn, "other.txt").unwrap().is_none());
    }

    #[test]
    fn test_sent_key_mutation() {
        let conn = db();
        let file = PeerFile::sent("abc".to_string(), owner(), 10, 2);
        add_sent_file(&conn, "f", &file).unwrap();

        add_sent_key(&conn, "f", 7).unwrap();
        add_sent_key(&conn, "f", 9).unwrap();
        add_sent_key(&conn, "f", 7).unwrap(); // idempotent
        let got = get_sent_file(&conn, "f").unwrap().unwrap();
        assert_eq!(got.keys.iter().copied().collect::<Vec<_>>(), vec![7, 9]);

        remove_sent_key(&conn, "f", 7).unwrap();
        let got = get_sent_file(&conn, "f").unwrap().unwrap();
        assert_eq!(got.keys.iter().copied().collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn test_being_deleted_flag() {
        let conn = db();
        add_sent_file(&conn, "f", &PeerFile::sent("abc".into(), owner(), 10, 1)).unwrap();
        set_being_deleted(&conn, "f", true).unwrap();
        assert!(get_sent_file(&conn, "f").unwrap().unwrap().being_deleted);
    }

    #[test]
    fn test_remove_sent_file_drops_keys() {
        let conn = db();
        let mut file = PeerFile::sent("abc".into(), owner(), 10, 1);
        file.keys.insert(3);
        add_sent_file(&conn, "f", &file).unwrap();
        remove_sent_file(&conn, "f").unwrap();
        assert!(get_sent_file(&conn, "f").unwrap().is_none());
        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM sent_file_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_stored_file_unique_per_id_and_occupation_grows() {
        let conn = db();
        let file = PeerFile::stored("id1".into(), owner(), 300, 2, 17);
        add_stored_file(&conn, &file).unwrap();
        assert!(has_stored_file(&conn, "id1").unwrap());
        assert_eq!(occupation(&conn).unwrap(), 300);

        // same id replaces, does not duplicate
        add_stored_file(&conn, &file).unwrap();
        assert_eq!(list_stored_files(&conn).unwrap().len(), 1);

        let got = get_stored_file(&conn, "id1").unwrap().unwrap();
        assert_eq!(got.local_key, Some(17));
        assert_eq!(got.owner.guid, 42);
    }

    #[test]
    fn test_has_space_boundary() {
        let conn = db();
        assert!(has_space(&conn, 1000).unwrap());
        assert!(!has_space(&conn, 1001).unwrap());
        add_stored_file(&conn, &PeerFile::stored("id1".into(), owner(), 600, 1, 0)).unwrap();
        assert!(has_space(&conn, 400).unwrap());
        assert!(!has_space(&conn, 401).unwrap());
    }

    #[test]
    fn test_update_occupation_rescans_disk() {
        let conn = db();
        let dir = tempfile::tempdir().unwrap();

        let mut blob = std::fs::File::create(dir.path().join("id1")).unwrap();
        blob.write_all(&[0u8; 128]).unwrap();
        add_stored_file(&conn, &PeerFile::stored("id1".into(), owner(), 999, 1, 0)).unwrap();
        // entry with no blob on disk counts as zero
        add_stored_file(&conn, &PeerFile::stored("id2".into(), owner(), 999, 1, 1)).unwrap();

        let total = update_occupation(&conn, dir.path()).unwrap();
        assert_eq!(total, 128);
        assert_eq!(occupation(&conn).unwrap(), 128);

        remove_stored_file(&conn, "id1").unwrap();
        let total = update_occupation(&conn, dir.path()).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn test_file_id_stable_and_size_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, [7u8; 77]).unwrap();

        let (id_a, size) = file_id_for_path(&path).unwrap();
        let (id_b, _) = file_id_for_path(&path).unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(size, 77);
        assert_eq!(id_a.len(), 64);

        let other = dir.path().join("other.bin");
        std::fs::write(&other, [7u8; 78]).unwrap();
        let (id_c, _) = file_id_for_path(&other).unwrap();
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn test_file_id_missing_file_errors() {
        assert!(file_id_for_path(Path::new("/no/such/file")).is_err());
    }
}
