mod feed;
mod transaction;
mod writer;

pub use feed::{ChangeCallback, SubscriptionId};
pub use transaction::{ChangeSet, ReadTransaction, WriteTransaction};

use crate::config::StoreConfig;
use crate::context::ExecutionContext;
use crate::error::{Result, SectionDbError};
use crate::record::{CompositeKey, Encoding, Identifiable, Item, Persistable};
use crate::record_db::RecordDb;
use crate::watcher::DbWatcher;
use feed::ChangeFeed;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use writer::SerialWriter;

/// Handle to a record store.
///
/// Cloning is cheap; clones share one connection, one serial writer thread
/// and one change feed. Every committed write publishes exactly one
/// [`ChangeSet`] to the observers whose collections it touches, in commit
/// order. Write bodies must not call back into the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    shared: Arc<Shared>,
    writer: SerialWriter,
    watcher: Mutex<Option<DbWatcher>>,
    path: Option<PathBuf>,
}

/// State reachable from both the calling threads and the writer thread.
struct Shared {
    db: Mutex<RecordDb>,
    encoding: Encoding,
    retention: u64,
    /// Last commit published to observers.
    last_seq: AtomicU64,
    feed: ChangeFeed,
}

impl Store {
    /// Open or create a file-backed store with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = StoreConfig {
            database: path.as_ref().to_string_lossy().into_owned(),
            ..Default::default()
        };
        Self::with_config(&config)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_config(&StoreConfig::in_memory())
    }

    pub fn with_config(config: &StoreConfig) -> Result<Self> {
        if config.change_log_retention == 0 {
            return Err(SectionDbError::Config(
                "change_log_retention must be at least 1".to_string(),
            ));
        }

        let (db, path) = if config.is_in_memory() {
            (RecordDb::open_in_memory()?, None)
        } else {
            let path = PathBuf::from(&config.database);
            (RecordDb::open(&path)?, Some(path))
        };
        let last_seq = db.last_commit_seq()?;

        log::info!(
            "Opened store {} at commit {last_seq}",
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );

        let shared = Arc::new(Shared {
            db: Mutex::new(db),
            encoding: config.encoding,
            retention: config.change_log_retention,
            last_seq: AtomicU64::new(last_seq),
            feed: ChangeFeed::new(),
        });

        Ok(Store {
            inner: Arc::new(StoreInner {
                shared,
                writer: SerialWriter::spawn("sectiondb-writer")?,
                watcher: Mutex::new(None),
                path,
            }),
        })
    }

    /// Path of the database file, or `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.shared.encoding
    }

    /// The last commit this store has published.
    pub fn last_commit(&self) -> u64 {
        self.inner.shared.last_seq.load(Ordering::Acquire)
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Run `body` in a read transaction.
    pub fn read<R>(&self, body: impl FnOnce(&ReadTransaction<'_>) -> Result<R>) -> Result<R> {
        self.inner.shared.read(body)
    }

    /// Run `body` in a write transaction and block until it commits.
    ///
    /// If the body fails the transaction rolls back, nothing is published,
    /// and the error comes back wrapped in `StoreTransactionFailed`.
    pub fn write<R>(
        &self,
        body: impl FnOnce(&mut WriteTransaction<'_>) -> Result<R>,
    ) -> Result<R> {
        self.inner.shared.write(body)
    }

    /// Queue `body` on the serial writer thread and return immediately.
    ///
    /// After the transaction commits or rolls back, and after its change set
    /// has been published, `completion` is scheduled on `context` with the
    /// outcome.
    pub fn async_write<R, B, C>(&self, body: B, context: Arc<dyn ExecutionContext>, completion: C)
    where
        R: Send + 'static,
        B: FnOnce(&mut WriteTransaction<'_>) -> Result<R> + Send + 'static,
        C: FnOnce(Result<R>) + Send + 'static,
    {
        let shared = self.inner.shared.clone();
        let queued = self.inner.writer.submit(Box::new(move || {
            let result = shared.write(body);
            context.execute(Box::new(move || completion(result)));
        }));
        if !queued {
            log::error!("Serial writer is gone; async write dropped");
        }
    }

    // ── Convenience API ──────────────────────────────────────────────

    pub fn put<T: Persistable>(&self, value: &T) -> Result<()> {
        self.write(|txn| txn.put(value))
    }

    pub fn put_with_metadata<T: Persistable, M: Serialize>(
        &self,
        value: &T,
        metadata: &M,
    ) -> Result<()> {
        self.write(|txn| txn.put_with_metadata(value, metadata))
    }

    pub fn get<T: Persistable>(&self, key: &str) -> Result<Option<T>> {
        self.read(|txn| txn.get::<T>(key))
    }

    pub fn get_item<T: DeserializeOwned>(&self, key: &CompositeKey) -> Result<Option<Item<T>>> {
        self.read(|txn| txn.get_item(key))
    }

    pub fn get_all<T: Persistable>(&self) -> Result<Vec<T>> {
        self.read(|txn| txn.get_all::<T>())
    }

    /// Remove a typed record. Returns whether it existed.
    pub fn remove<T: Identifiable>(&self, key: &str) -> Result<bool> {
        self.write(|txn| txn.remove_by_key::<T>(key))
    }

    pub fn remove_key(&self, key: &CompositeKey) -> Result<bool> {
        self.write(|txn| txn.remove(key))
    }

    /// Remove every record in a collection in one transaction.
    pub fn remove_all(&self, collection: &str) -> Result<usize> {
        self.write(|txn| txn.remove_all(collection))
    }

    pub fn get_metadata(&self, key: &CompositeKey) -> Result<Option<serde_json::Value>> {
        self.read(|txn| txn.get_metadata(key))
    }

    /// Replace a record's metadata. Observers see the record as updated.
    pub fn set_metadata(&self, key: &CompositeKey, metadata: Option<&serde_json::Value>) -> Result<()> {
        self.write(|txn| txn.set_metadata(key, metadata))
    }

    pub fn keys(&self, collection: &str) -> Result<Vec<String>> {
        self.read(|txn| txn.keys(collection))
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.read(|txn| txn.count(collection))
    }

    pub fn collections(&self) -> Result<Vec<String>> {
        self.read(|txn| txn.collections())
    }

    // ── Observers ────────────────────────────────────────────────────

    /// Observe every committed change set.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        self.inner.shared.feed.subscribe(None, Arc::new(callback))
    }

    /// Observe change sets that touch at least one of `collections`.
    pub fn subscribe_collections<I, S, F>(&self, collections: I, callback: F) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        let filter: BTreeSet<String> = collections.into_iter().map(Into::into).collect();
        self.inner.shared.feed.subscribe(Some(filter), Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.shared.feed.unsubscribe(id)
    }

    // ── External Changes ─────────────────────────────────────────────

    /// Start watching the database file for commits made by other connections.
    /// Call [`Store::process_watcher_events`] to publish what they changed.
    pub fn watch(&self) -> Result<()> {
        let path = self.inner.path.as_ref().ok_or_else(|| {
            SectionDbError::Config("An in-memory store cannot be watched".to_string())
        })?;
        let mut watcher = self.inner.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(DbWatcher::start(path)?);
            log::info!("Watching {} for external commits", path.display());
        }
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watcher.lock().is_some()
    }

    /// Drain pending watcher events and publish any external commits.
    /// Returns the number of change sets published.
    pub fn process_watcher_events(&self) -> Result<usize> {
        let events = match self.inner.watcher.lock().as_ref() {
            Some(watcher) => watcher.drain(),
            None => 0,
        };
        if events == 0 {
            return Ok(0);
        }
        log::debug!("Processing {events} database watcher event(s)");
        self.sync_external()
    }

    /// Publish commits made by other connections since the last one seen.
    /// Returns the number of change sets published.
    pub fn sync_external(&self) -> Result<usize> {
        let shared = &self.inner.shared;
        let published = {
            let db = shared.db.lock();
            let external = shared.collect_external(&db)?;
            shared.publish_external(external)
        };
        shared.feed.drain();
        Ok(published)
    }

    // ── Status ───────────────────────────────────────────────────────

    /// Get status information: record counts per collection and commit position.
    pub fn status(&self) -> Result<serde_json::Value> {
        let mut collections = serde_json::Map::new();
        self.read(|txn| {
            for name in txn.collections()? {
                let count = txn.count(&name)?;
                collections.insert(name, serde_json::json!({ "count": count }));
            }
            Ok(())
        })?;

        Ok(serde_json::json!({
            "database": self
                .inner
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            "encoding": self.encoding(),
            "last_commit": self.last_commit(),
            "observers": self.inner.shared.feed.observer_count(),
            "watching": self.is_watching(),
            "collections": collections,
        }))
    }
}

impl Shared {
    fn read<R>(&self, body: impl FnOnce(&ReadTransaction<'_>) -> Result<R>) -> Result<R> {
        let db = self.db.lock();
        db.begin_read_transaction()?;
        let result = body(&ReadTransaction::new(&db, self.encoding));
        if let Err(e) = db.commit_transaction() {
            log::warn!("Failed to end read transaction: {e}");
        }
        result
    }

    fn write<R>(&self, body: impl FnOnce(&mut WriteTransaction<'_>) -> Result<R>) -> Result<R> {
        let result = {
            let db = self.db.lock();
            if db.in_transaction() {
                log::warn!("Rolling back a transaction left open by an earlier failure");
                db.rollback_transaction()
                    .map_err(|e| SectionDbError::StoreTransactionFailed(Box::new(e)))?;
            }
            db.begin_transaction()
                .map_err(|e| SectionDbError::StoreTransactionFailed(Box::new(e)))?;

            match self.commit_locked(&db, body) {
                Ok(value) => Ok(value),
                Err(e) => {
                    if let Err(rollback) = db.rollback_transaction() {
                        log::error!("Rollback failed: {rollback}");
                    }
                    log::warn!("Write transaction rolled back: {e}");
                    Err(SectionDbError::StoreTransactionFailed(Box::new(e)))
                }
            }
        };
        self.feed.drain();
        result
    }

    /// Run the body and commit. Called with the database lock held and a
    /// write transaction open, so change sets are queued in commit order.
    fn commit_locked<R>(
        &self,
        db: &RecordDb,
        body: impl FnOnce(&mut WriteTransaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let external = self.collect_external(db)?;

        let mut txn = WriteTransaction::new(db, self.encoding);
        let value = body(&mut txn)?;
        let changes = txn.into_changes();

        let seq = if changes.is_empty() {
            None
        } else {
            Some(db.append_commit(&changes)?)
        };
        db.commit_transaction()?;

        self.publish_external(external);
        if let Some(seq) = seq {
            log::debug!("Committed {seq} with {} change(s)", changes.len());
            self.last_seq.store(seq, Ordering::Release);
            if let Err(e) = db.prune_commits(self.retention) {
                log::warn!("Failed to prune change log: {e}");
            }
            self.feed.enqueue(ChangeSet::from_changes(seq, &changes));
        }
        Ok(value)
    }

    /// Change sets for commits other connections made since the last one
    /// published. The published position moves only in `publish_external`.
    fn collect_external(&self, db: &RecordDb) -> Result<Vec<ChangeSet>> {
        let last = self.last_seq.load(Ordering::Acquire);
        let commits = db.commits_since(last)?;
        let mut sets = Vec::with_capacity(commits.len() + 1);

        if let Some(first) = commits.first() {
            if first.seq > last + 1 {
                log::warn!(
                    "Change log pruned past commit {last}; observers must resync"
                );
                sets.push(ChangeSet {
                    commit: first.seq - 1,
                    external: true,
                    resync: true,
                    ..Default::default()
                });
            }
        }

        for commit in &commits {
            let mut set = ChangeSet::from_changes(commit.seq, &commit.changes);
            set.external = true;
            sets.push(set);
        }
        if !commits.is_empty() {
            log::debug!("Picked up {} external commit(s)", commits.len());
        }
        Ok(sets)
    }

    /// Queue external change sets and advance the published position past
    /// them. Must be called with the database lock held.
    fn publish_external(&self, sets: Vec<ChangeSet>) -> usize {
        let count = sets.len();
        for set in sets {
            self.last_seq.fetch_max(set.commit, Ordering::AcqRel);
            self.feed.enqueue(set);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::QueueContext;
    use serde::Deserialize;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct City {
        name: String,
        state: String,
        population: u64,
    }

    impl Identifiable for City {
        const COLLECTION: &'static str = "cities";

        fn key(&self) -> String {
            self.name.clone()
        }
    }

    fn city(name: &str, state: &str, population: u64) -> City {
        City {
            name: name.into(),
            state: state.into(),
            population,
        }
    }

    fn record_changes(store: &Store) -> Arc<Mutex<Vec<ChangeSet>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store.subscribe(move |c| s.lock().push(c.clone()));
        seen
    }

    #[test]
    fn test_put_and_get() {
        let store = Store::open_in_memory().unwrap();
        store.put(&city("Akron", "OH", 190_000)).unwrap();

        let got: City = store.get("Akron").unwrap().unwrap();
        assert_eq!(got.population, 190_000);
        assert_eq!(store.count("cities").unwrap(), 1);
        assert_eq!(store.keys("cities").unwrap(), vec!["Akron"]);
        assert_eq!(store.collections().unwrap(), vec!["cities"]);
        assert!(store.get::<City>("Toledo").unwrap().is_none());
    }

    #[test]
    fn test_write_publishes_one_change_set() {
        let store = Store::open_in_memory().unwrap();
        let seen = record_changes(&store);

        store
            .write(|txn| {
                txn.put(&city("Akron", "OH", 1))?;
                txn.put(&city("Dayton", "OH", 1))?;
                Ok(())
            })
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].inserted.len(), 2);
        assert!(!seen[0].external);
    }

    #[test]
    fn test_rollback_publishes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let seen = record_changes(&store);

        let result: Result<()> = store.write(|txn| {
            txn.put(&city("Akron", "OH", 1))?;
            Err(SectionDbError::Other("boom".into()))
        });

        match result {
            Err(SectionDbError::StoreTransactionFailed(inner)) => {
                assert!(matches!(*inner, SectionDbError::Other(_)));
            }
            other => panic!("expected StoreTransactionFailed, got {other:?}"),
        }
        assert!(seen.lock().is_empty());
        assert_eq!(store.count("cities").unwrap(), 0);
        assert_eq!(store.last_commit(), 0);
    }

    #[test]
    fn test_change_sets_arrive_in_commit_order() {
        let store = Store::open_in_memory().unwrap();
        let seen = record_changes(&store);

        store.put(&city("Akron", "OH", 1)).unwrap();
        store.put(&city("Akron", "OH", 2)).unwrap();
        store.remove::<City>("Akron").unwrap();

        let seen = seen.lock();
        let commits: Vec<u64> = seen.iter().map(|c| c.commit).collect();
        assert_eq!(commits, vec![1, 2, 3]);
        assert_eq!(seen[0].inserted.len(), 1);
        assert_eq!(seen[1].updated.len(), 1);
        assert_eq!(seen[2].removed.len(), 1);
    }

    #[test]
    fn test_collection_filter() {
        let store = Store::open_in_memory().unwrap();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        store.subscribe_collections(["states"], move |_| *s.lock() += 1);

        store.put(&city("Akron", "OH", 1)).unwrap();
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn test_write_from_observer_is_published_after_current() {
        let store = Store::open_in_memory().unwrap();
        let seen = record_changes(&store);

        let inner = store.clone();
        store.subscribe(move |c| {
            if c.commit == 1 {
                inner.put(&city("Dayton", "OH", 1)).unwrap();
            }
        });

        store.put(&city("Akron", "OH", 1)).unwrap();

        let commits: Vec<u64> = seen.lock().iter().map(|c| c.commit).collect();
        assert_eq!(commits, vec![1, 2]);
    }

    #[test]
    fn test_metadata_update_counts_as_update() {
        let store = Store::open_in_memory().unwrap();
        store.put(&city("Akron", "OH", 1)).unwrap();
        let seen = record_changes(&store);

        let key = City::composite_key_for("Akron");
        store
            .set_metadata(&key, Some(&serde_json::json!({ "favorite": true })))
            .unwrap();

        assert_eq!(
            store.get_metadata(&key).unwrap(),
            Some(serde_json::json!({ "favorite": true }))
        );
        assert!(seen.lock()[0].updated.contains(&key));

        // A plain put replaces the metadata with none.
        store.put(&city("Akron", "OH", 2)).unwrap();
        assert_eq!(store.get_metadata(&key).unwrap(), None);
    }

    #[test]
    fn test_remove_all() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|txn| {
                txn.put(&city("Akron", "OH", 1))?;
                txn.put(&city("Dayton", "OH", 1))?;
                Ok(())
            })
            .unwrap();
        let seen = record_changes(&store);

        assert_eq!(store.remove_all("cities").unwrap(), 2);
        assert_eq!(store.count("cities").unwrap(), 0);
        assert_eq!(seen.lock()[0].removed.len(), 2);
    }

    #[test]
    fn test_empty_write_publishes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let seen = record_changes(&store);
        let removed = store.remove::<City>("Nowhere").unwrap();
        assert!(!removed);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_async_write_completion_runs_on_context() {
        let store = Store::open_in_memory().unwrap();
        let queue = QueueContext::new();
        let outcome = Arc::new(Mutex::new(None));

        let o = outcome.clone();
        store.async_write(
            |txn| {
                txn.put(&city("Akron", "OH", 1))?;
                Ok(7)
            },
            queue.clone(),
            move |result| *o.lock() = Some(result.map_err(|e| e.to_string())),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.pending() == 0 {
            assert!(Instant::now() < deadline, "completion never scheduled");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Committed before the completion was scheduled, but the completion
        // itself waits for the context.
        assert!(outcome.lock().is_none());
        assert_eq!(store.count("cities").unwrap(), 1);

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*outcome.lock(), Some(Ok(7)));
    }

    #[test]
    fn test_async_write_failure_reaches_completion() {
        let store = Store::open_in_memory().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        store.async_write(
            |_txn| -> Result<()> { Err(SectionDbError::Other("nope".into())) },
            Arc::new(crate::context::Immediate),
            move |result| tx.send(result.is_err()).unwrap(),
        );

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_panicking_observer_does_not_stop_later_commits() {
        let store = Store::open_in_memory().unwrap();
        store.subscribe(|c| {
            if c.commit == 1 {
                panic!("observer failure");
            }
        });
        let seen = record_changes(&store);

        let (tx, rx) = std::sync::mpsc::channel();
        store.async_write(
            |txn| txn.put(&city("Akron", "OH", 1)),
            Arc::new(crate::context::Immediate),
            move |result| tx.send(result.is_ok()).unwrap(),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        store.put(&city("Dayton", "OH", 2)).unwrap();
        store.put(&city("Toledo", "OH", 3)).unwrap();

        let commits: Vec<u64> = seen.lock().iter().map(|c| c.commit).collect();
        assert_eq!(commits, vec![1, 2, 3]);
    }

    #[test]
    fn test_write_after_panicked_body_rolls_back_leftover_transaction() {
        let store = Store::open_in_memory().unwrap();
        let seen = record_changes(&store);

        store.async_write(
            |txn: &mut WriteTransaction<'_>| -> Result<()> {
                txn.put(&city("Akron", "OH", 1))?;
                panic!("body failure");
            },
            Arc::new(crate::context::Immediate),
            |_| {},
        );

        let (tx, rx) = std::sync::mpsc::channel();
        store.async_write(
            |txn| txn.put(&city("Dayton", "OH", 2)),
            Arc::new(crate::context::Immediate),
            move |result| tx.send(result.map_err(|e| e.to_string())).unwrap(),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));

        store.put(&city("Toledo", "OH", 3)).unwrap();
        assert_eq!(store.keys("cities").unwrap(), vec!["Dayton", "Toledo"]);
        assert!(store.get::<City>("Akron").unwrap().is_none());
        let commits: Vec<u64> = seen.lock().iter().map(|c| c.commit).collect();
        assert_eq!(commits, vec![1, 2]);
    }

    #[test]
    fn test_external_commits_are_published() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cities.sqlite");
        let local = Store::open(&path).unwrap();
        let remote = Store::open(&path).unwrap();
        let seen = record_changes(&local);

        remote.put(&city("Akron", "OH", 1)).unwrap();
        remote.put(&city("Dayton", "OH", 1)).unwrap();

        assert_eq!(local.sync_external().unwrap(), 2);
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert!(seen.iter().all(|c| c.external));
            assert!(seen[0].inserted.contains(&City::composite_key_for("Akron")));
            assert!(seen[1].inserted.contains(&City::composite_key_for("Dayton")));
        }
        assert_eq!(local.sync_external().unwrap(), 0);
    }

    #[test]
    fn test_local_write_publishes_unseen_external_commits_first() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cities.sqlite");
        let local = Store::open(&path).unwrap();
        let remote = Store::open(&path).unwrap();
        let seen = record_changes(&local);

        remote.put(&city("Akron", "OH", 1)).unwrap();
        local.put(&city("Dayton", "OH", 1)).unwrap();

        let seen = seen.lock();
        let commits: Vec<(u64, bool)> = seen.iter().map(|c| (c.commit, c.external)).collect();
        assert_eq!(commits, vec![(1, true), (2, false)]);
    }

    #[test]
    fn test_failed_write_keeps_external_commits_pending() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cities.sqlite");
        let local = Store::open(&path).unwrap();
        let remote = Store::open(&path).unwrap();
        let seen = record_changes(&local);

        remote.put(&city("Akron", "OH", 1)).unwrap();
        let failed: Result<()> = local.write(|_| Err(SectionDbError::Other("boom".into())));
        assert!(failed.is_err());
        assert!(seen.lock().is_empty());

        assert_eq!(local.sync_external().unwrap(), 1);
        assert_eq!(seen.lock()[0].commit, 1);
    }

    #[test]
    fn test_pruned_change_log_requests_resync() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cities.sqlite");
        let local = Store::open(&path).unwrap();
        let remote = Store::with_config(&StoreConfig {
            database: path.to_string_lossy().into_owned(),
            change_log_retention: 1,
            ..Default::default()
        })
        .unwrap();
        let seen = record_changes(&local);

        for population in 0..3 {
            remote.put(&city("Akron", "OH", population)).unwrap();
        }
        local.sync_external().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].resync);
        assert!(seen[0].touches("anything"));
        assert_eq!(seen[1].commit, 3);
    }

    #[test]
    fn test_in_memory_store_cannot_be_watched() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.watch(), Err(SectionDbError::Config(_))));
        assert_eq!(store.process_watcher_events().unwrap(), 0);
    }

    #[test]
    fn test_status() {
        let store = Store::open_in_memory().unwrap();
        store.put(&city("Akron", "OH", 1)).unwrap();
        let status = store.status().unwrap();
        assert_eq!(status["collections"]["cities"]["count"], 1);
        assert_eq!(status["last_commit"], 1);
        assert_eq!(status["encoding"], "json");
    }
}
