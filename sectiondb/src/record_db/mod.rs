use crate::error::{Result, SectionDbError};
use crate::record::{compute_etag, CompositeKey, Encoding, Item};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;

/// The record database: payloads, metadata, and the commit log used for
/// cross-process change notification.
pub struct RecordDb {
    conn: Connection,
}

impl RecordDb {
    /// Open or create the record database at the given path.
    /// File-backed databases use WAL so other connections can read while
    /// this one writes.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        let db = RecordDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Open an in-memory record database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = RecordDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                data BLOB NOT NULL,
                metadata BLOB,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                PRIMARY KEY (collection, key)
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);

            CREATE TABLE IF NOT EXISTS commits (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                committed_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS change_log (
                seq INTEGER NOT NULL,
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (seq, collection, key)
            );
            ",
        )?;
        Ok(())
    }

    // ── Records ──────────────────────────────────────────────────────

    /// Get a raw record by collection and key.
    pub fn get_record(&self, key: &CompositeKey) -> Result<Option<RawRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT collection, key, data, metadata, created_at, modified_at
                 FROM records WHERE collection = ?1 AND key = ?2",
                params![key.collection, key.key],
                raw_record_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Whether a record exists.
    pub fn record_exists(&self, key: &CompositeKey) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM records WHERE collection = ?1 AND key = ?2",
                params![key.collection, key.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// List all raw records in a collection, ordered by key.
    pub fn list_records(&self, collection: &str) -> Result<Vec<RawRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection, key, data, metadata, created_at, modified_at
             FROM records WHERE collection = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![collection], raw_record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// List the keys in a collection, ordered.
    pub fn list_keys(&self, collection: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM records WHERE collection = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![collection], |row| row.get(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Count the records in a collection.
    pub fn count_records(&self, collection: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Names of all collections holding at least one record.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT collection FROM records ORDER BY collection")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Insert or replace a record's payload and metadata. `created_at` survives updates.
    pub fn upsert_record(
        &self,
        key: &CompositeKey,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO records (collection, key, data, metadata, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(collection, key) DO UPDATE SET
                data = excluded.data,
                metadata = excluded.metadata,
                modified_at = excluded.modified_at",
            params![key.collection, key.key, data, metadata, now],
        )?;
        Ok(())
    }

    /// Replace only the metadata of an existing record. Returns false if the record is missing.
    pub fn set_metadata(&self, key: &CompositeKey, metadata: Option<&[u8]>) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE records SET metadata = ?3, modified_at = ?4 WHERE collection = ?1 AND key = ?2",
            params![key.collection, key.key, metadata, now],
        )?;
        Ok(changed > 0)
    }

    /// Delete a record. Returns false if it did not exist.
    pub fn delete_record(&self, key: &CompositeKey) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![key.collection, key.key],
        )?;
        Ok(changed > 0)
    }

    /// Delete all records in a collection, returning the keys that were removed.
    pub fn delete_collection_records(&self, collection: &str) -> Result<Vec<String>> {
        let keys = self.list_keys(collection)?;
        self.conn.execute(
            "DELETE FROM records WHERE collection = ?1",
            params![collection],
        )?;
        Ok(keys)
    }

    // ── Commit Log ───────────────────────────────────────────────────

    /// Record a commit and its changes. Returns the new commit sequence number.
    pub fn append_commit(&self, changes: &[(CompositeKey, ChangeKind)]) -> Result<u64> {
        self.conn
            .execute("INSERT INTO commits DEFAULT VALUES", [])?;
        let seq = self.conn.last_insert_rowid();

        let mut stmt = self.conn.prepare(
            "INSERT INTO change_log (seq, collection, key, kind) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (key, kind) in changes {
            stmt.execute(params![seq, key.collection, key.key, kind.as_str()])?;
        }
        Ok(seq as u64)
    }

    /// The most recent commit sequence number, or 0 for a fresh database.
    pub fn last_commit_seq(&self) -> Result<u64> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM commits", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0) as u64)
    }

    /// Commits newer than `after`, in commit order, with their logged changes.
    pub fn commits_since(&self, after: u64) -> Result<Vec<LoggedCommit>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq FROM commits WHERE seq > ?1 ORDER BY seq")?;
        let seqs = stmt.query_map(params![after as i64], |row| row.get::<_, i64>(0))?;

        let mut commits = Vec::new();
        for seq in seqs {
            commits.push(LoggedCommit {
                seq: seq? as u64,
                changes: Vec::new(),
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT seq, collection, key, kind FROM change_log WHERE seq > ?1 ORDER BY seq, collection, key",
        )?;
        let rows = stmt.query_map(params![after as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        for row in rows {
            let (seq, collection, key, kind) = row?;
            let kind = ChangeKind::parse(&kind).ok_or_else(|| {
                SectionDbError::Other(format!("Unknown change kind '{kind}' in commit {seq}"))
            })?;
            if let Some(commit) = commits.iter_mut().find(|c| c.seq == seq as u64) {
                commit.changes.push((CompositeKey::new(collection, key), kind));
            }
        }

        Ok(commits)
    }

    /// Drop commit log entries so that at most `keep` commits remain.
    pub fn prune_commits(&self, keep: u64) -> Result<()> {
        let last = self.last_commit_seq()?;
        if last <= keep {
            return Ok(());
        }
        let cutoff = (last - keep) as i64;
        self.conn
            .execute("DELETE FROM change_log WHERE seq <= ?1", params![cutoff])?;
        self.conn
            .execute("DELETE FROM commits WHERE seq <= ?1", params![cutoff])?;
        Ok(())
    }

    // ── Transaction Support ──────────────────────────────────────────

    /// Whether a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Begin a read transaction so several queries see one snapshot.
    pub fn begin_read_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN DEFERRED TRANSACTION")?;
        Ok(())
    }

    /// Begin a write transaction, taking the database write lock immediately.
    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        Ok(())
    }

    /// Commit the current transaction.
    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Rollback the current transaction.
    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

fn raw_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        collection: row.get(0)?,
        key: row.get(1)?,
        data: row.get(2)?,
        metadata: row.get(3)?,
        created_at: row.get(4)?,
        modified_at: row.get(5)?,
    })
}

/// A record row as stored: encoded bytes plus timestamps.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub collection: String,
    pub key: String,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub created_at: String,
    pub modified_at: String,
}

impl RawRecord {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(self.collection.clone(), self.key.clone())
    }

    /// Decode the stored bytes into a typed item.
    pub fn decode<T: DeserializeOwned>(&self, encoding: Encoding) -> Result<Item<T>> {
        let value: T = encoding.decode(&self.data)?;
        let metadata = match &self.metadata {
            Some(bytes) => Some(encoding.decode::<serde_json::Value>(bytes)?),
            None => None,
        };

        Ok(Item {
            key: self.composite_key(),
            value,
            metadata,
            etag: compute_etag(&self.data, self.metadata.as_deref()),
            created_at: parse_timestamp(&self.created_at)?,
            modified_at: parse_timestamp(&self.modified_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SectionDbError::Other(format!("Bad timestamp '{raw}': {e}")))
}

/// How a key changed in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Inserted => "inserted",
            ChangeKind::Updated => "updated",
            ChangeKind::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inserted" => Some(ChangeKind::Inserted),
            "updated" => Some(ChangeKind::Updated),
            "removed" => Some(ChangeKind::Removed),
            _ => None,
        }
    }
}

/// A commit read back from the log.
#[derive(Debug, Clone)]
pub struct LoggedCommit {
    pub seq: u64,
    pub changes: Vec<(CompositeKey, ChangeKind)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> CompositeKey {
        CompositeKey::new("cities", k)
    }

    #[test]
    fn test_upsert_and_get_record() {
        let db = RecordDb::open_in_memory().unwrap();
        db.upsert_record(&key("akron"), b"{\"name\":\"Akron\"}", None)
            .unwrap();

        let record = db.get_record(&key("akron")).unwrap().unwrap();
        assert_eq!(record.collection, "cities");
        assert_eq!(record.key, "akron");
        assert!(record.metadata.is_none());

        let item: Item<serde_json::Value> = record.decode(Encoding::Json).unwrap();
        assert_eq!(item.value["name"], "Akron");
        assert_eq!(item.created_at, item.modified_at);
    }

    #[test]
    fn test_upsert_keeps_created_at() {
        let db = RecordDb::open_in_memory().unwrap();
        db.upsert_record(&key("akron"), b"1", None).unwrap();
        let first = db.get_record(&key("akron")).unwrap().unwrap();

        db.upsert_record(&key("akron"), b"2", Some(b"true")).unwrap();
        let second = db.get_record(&key("akron")).unwrap().unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.data, b"2".to_vec());
        assert_eq!(second.metadata, Some(b"true".to_vec()));
    }

    #[test]
    fn test_list_and_count() {
        let db = RecordDb::open_in_memory().unwrap();
        db.upsert_record(&key("b"), b"1", None).unwrap();
        db.upsert_record(&key("a"), b"1", None).unwrap();
        db.upsert_record(&CompositeKey::new("states", "OH"), b"1", None)
            .unwrap();

        assert_eq!(db.list_keys("cities").unwrap(), vec!["a", "b"]);
        assert_eq!(db.count_records("cities").unwrap(), 2);
        assert_eq!(db.list_collections().unwrap(), vec!["cities", "states"]);
    }

    #[test]
    fn test_delete_record_reports_existence() {
        let db = RecordDb::open_in_memory().unwrap();
        db.upsert_record(&key("a"), b"1", None).unwrap();
        assert!(db.delete_record(&key("a")).unwrap());
        assert!(!db.delete_record(&key("a")).unwrap());
        assert!(!db.record_exists(&key("a")).unwrap());
    }

    #[test]
    fn test_set_metadata_requires_record() {
        let db = RecordDb::open_in_memory().unwrap();
        assert!(!db.set_metadata(&key("a"), Some(b"1")).unwrap());
        db.upsert_record(&key("a"), b"1", None).unwrap();
        assert!(db.set_metadata(&key("a"), Some(b"2")).unwrap());
    }

    #[test]
    fn test_commit_log_round_trip() {
        let db = RecordDb::open_in_memory().unwrap();
        assert_eq!(db.last_commit_seq().unwrap(), 0);

        let s1 = db
            .append_commit(&[(key("a"), ChangeKind::Inserted)])
            .unwrap();
        let s2 = db
            .append_commit(&[
                (key("a"), ChangeKind::Updated),
                (key("b"), ChangeKind::Removed),
            ])
            .unwrap();
        assert!(s2 > s1);

        let commits = db.commits_since(s1).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].seq, s2);
        assert_eq!(commits[0].changes.len(), 2);
        assert_eq!(commits[0].changes[1], (key("b"), ChangeKind::Removed));
    }

    #[test]
    fn test_empty_commit_is_logged() {
        let db = RecordDb::open_in_memory().unwrap();
        let seq = db.append_commit(&[]).unwrap();
        let commits = db.commits_since(0).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].seq, seq);
        assert!(commits[0].changes.is_empty());
    }

    #[test]
    fn test_prune_commits() {
        let db = RecordDb::open_in_memory().unwrap();
        for _ in 0..5 {
            db.append_commit(&[(key("a"), ChangeKind::Updated)]).unwrap();
        }
        db.prune_commits(2).unwrap();
        let commits = db.commits_since(0).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].seq, 4);
    }

    #[test]
    fn test_transaction_rollback() {
        let db = RecordDb::open_in_memory().unwrap();

        db.begin_transaction().unwrap();
        db.upsert_record(&key("a"), b"1", None).unwrap();
        db.rollback_transaction().unwrap();

        assert!(db.get_record(&key("a")).unwrap().is_none());
    }
}
