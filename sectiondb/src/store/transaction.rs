use crate::error::{Result, SectionDbError};
use crate::record::{CompositeKey, Encoding, Identifiable, Item, Persistable};
use crate::record_db::{ChangeKind, RawRecord, RecordDb};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// The keys a committed transaction inserted, updated, and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Commit sequence number. Strictly increasing in publish order.
    pub commit: u64,
    pub inserted: BTreeSet<CompositeKey>,
    pub updated: BTreeSet<CompositeKey>,
    pub removed: BTreeSet<CompositeKey>,
    /// Committed by another connection and picked up from the change log.
    pub external: bool,
    /// The change log was pruned past commits this store never saw;
    /// observers must re-read everything.
    pub resync: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty() && !self.resync
    }

    /// Every key this change set mentions, in key order.
    pub fn touched_keys(&self) -> impl Iterator<Item = &CompositeKey> {
        let mut all: Vec<&CompositeKey> = self
            .inserted
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
            .collect();
        all.sort();
        all.into_iter()
    }

    pub fn touches(&self, collection: &str) -> bool {
        self.resync || self.touched_keys().any(|k| k.collection == collection)
    }

    pub fn kind_of(&self, key: &CompositeKey) -> Option<ChangeKind> {
        if self.inserted.contains(key) {
            Some(ChangeKind::Inserted)
        } else if self.updated.contains(key) {
            Some(ChangeKind::Updated)
        } else if self.removed.contains(key) {
            Some(ChangeKind::Removed)
        } else {
            None
        }
    }

    pub(crate) fn from_changes(commit: u64, changes: &[(CompositeKey, ChangeKind)]) -> Self {
        let mut set = ChangeSet {
            commit,
            ..Default::default()
        };
        for (key, kind) in changes {
            let bucket = match kind {
                ChangeKind::Inserted => &mut set.inserted,
                ChangeKind::Updated => &mut set.updated,
                ChangeKind::Removed => &mut set.removed,
            };
            bucket.insert(key.clone());
        }
        set
    }
}

/// Read access to the store inside a transaction.
pub struct ReadTransaction<'a> {
    db: &'a RecordDb,
    encoding: Encoding,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(db: &'a RecordDb, encoding: Encoding) -> Self {
        ReadTransaction { db, encoding }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Read a typed record by key.
    pub fn get<T: Persistable>(&self, key: &str) -> Result<Option<T>> {
        Ok(self
            .get_item::<T>(&T::composite_key_for(key))?
            .map(|item| item.value))
    }

    /// Read a record with its metadata and etag.
    pub fn get_item<T: DeserializeOwned>(&self, key: &CompositeKey) -> Result<Option<Item<T>>> {
        match self.db.get_record(key)? {
            Some(raw) => Ok(Some(raw.decode(self.encoding)?)),
            None => Ok(None),
        }
    }

    /// Read every record of a type.
    pub fn get_all<T: Persistable>(&self) -> Result<Vec<T>> {
        Ok(self
            .items::<T>(T::COLLECTION)?
            .into_iter()
            .map(|item| item.value)
            .collect())
    }

    /// Decode every record in a collection. Fails on the first undecodable record.
    pub fn items<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<Item<T>>> {
        self.db
            .list_records(collection)?
            .iter()
            .map(|raw| raw.decode(self.encoding))
            .collect()
    }

    /// Undecoded records in a collection, ordered by key.
    pub fn raw_records(&self, collection: &str) -> Result<Vec<RawRecord>> {
        self.db.list_records(collection)
    }

    pub fn raw_record(&self, key: &CompositeKey) -> Result<Option<RawRecord>> {
        self.db.get_record(key)
    }

    pub fn get_metadata(&self, key: &CompositeKey) -> Result<Option<serde_json::Value>> {
        match self.db.get_record(key)? {
            Some(RawRecord {
                metadata: Some(bytes),
                ..
            }) => Ok(Some(self.encoding.decode(&bytes)?)),
            _ => Ok(None),
        }
    }

    pub fn contains(&self, key: &CompositeKey) -> Result<bool> {
        self.db.record_exists(key)
    }

    pub fn keys(&self, collection: &str) -> Result<Vec<String>> {
        self.db.list_keys(collection)
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.db.count_records(collection)
    }

    pub fn collections(&self) -> Result<Vec<String>> {
        self.db.list_collections()
    }
}

/// Per-key bookkeeping so a transaction reports its net effect.
#[derive(Debug, Clone, Copy)]
struct Touch {
    existed_before: bool,
    exists_now: bool,
}

/// Write access inside an all-or-nothing transaction.
pub struct WriteTransaction<'a> {
    db: &'a RecordDb,
    encoding: Encoding,
    touched: BTreeMap<CompositeKey, Touch>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(db: &'a RecordDb, encoding: Encoding) -> Self {
        WriteTransaction {
            db,
            encoding,
            touched: BTreeMap::new(),
        }
    }

    /// Reads see this transaction's own uncommitted writes.
    pub fn reader(&self) -> ReadTransaction<'_> {
        ReadTransaction::new(self.db, self.encoding)
    }

    /// Write a typed record without metadata.
    pub fn put<T: Persistable>(&mut self, value: &T) -> Result<()> {
        self.put_value(&value.composite_key(), value, None)
    }

    /// Write a typed record and its metadata.
    pub fn put_with_metadata<T: Persistable, M: Serialize>(
        &mut self,
        value: &T,
        metadata: &M,
    ) -> Result<()> {
        let metadata = serde_json::to_value(metadata)?;
        self.put_value(&value.composite_key(), value, Some(&metadata))
    }

    /// Write any serializable value at a key. Replaces payload and metadata.
    pub fn put_value<V: Serialize + ?Sized>(
        &mut self,
        key: &CompositeKey,
        value: &V,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let data = self.encoding.encode(value)?;
        let metadata = match metadata {
            Some(m) => Some(self.encoding.encode(m)?),
            None => None,
        };
        self.touch(key)?;
        self.db.upsert_record(key, &data, metadata.as_deref())?;
        self.mark(key, true);
        Ok(())
    }

    /// Replace the metadata of an existing record.
    pub fn set_metadata(
        &mut self,
        key: &CompositeKey,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let bytes = match metadata {
            Some(m) => Some(self.encoding.encode(m)?),
            None => None,
        };
        self.touch(key)?;
        if !self.db.set_metadata(key, bytes.as_deref())? {
            return Err(SectionDbError::NotFound {
                collection: key.collection.clone(),
                key: key.key.clone(),
            });
        }
        Ok(())
    }

    /// Remove a record. Returns whether it existed.
    pub fn remove(&mut self, key: &CompositeKey) -> Result<bool> {
        self.touch(key)?;
        let existed = self.db.delete_record(key)?;
        self.mark(key, false);
        Ok(existed)
    }

    /// Remove a typed record by key.
    pub fn remove_by_key<T: Identifiable>(&mut self, key: &str) -> Result<bool> {
        self.remove(&T::composite_key_for(key))
    }

    /// Remove every record in a collection. Returns how many were removed.
    pub fn remove_all(&mut self, collection: &str) -> Result<usize> {
        for key in self.db.list_keys(collection)? {
            self.touch(&CompositeKey::new(collection, key))?;
        }
        let removed = self.db.delete_collection_records(collection)?;
        for key in &removed {
            self.mark(&CompositeKey::new(collection, key.clone()), false);
        }
        Ok(removed.len())
    }

    fn touch(&mut self, key: &CompositeKey) -> Result<()> {
        if !self.touched.contains_key(key) {
            let existed = self.db.record_exists(key)?;
            self.touched.insert(
                key.clone(),
                Touch {
                    existed_before: existed,
                    exists_now: existed,
                },
            );
        }
        Ok(())
    }

    fn mark(&mut self, key: &CompositeKey, exists: bool) {
        if let Some(touch) = self.touched.get_mut(key) {
            touch.exists_now = exists;
        }
    }

    /// The net effect of this transaction, one entry per touched key.
    pub(crate) fn into_changes(self) -> Vec<(CompositeKey, ChangeKind)> {
        self.touched
            .into_iter()
            .filter_map(|(key, touch)| {
                match (touch.existed_before, touch.exists_now) {
                    (false, true) => Some((key, ChangeKind::Inserted)),
                    (true, true) => Some((key, ChangeKind::Updated)),
                    (true, false) => Some((key, ChangeKind::Removed)),
                    (false, false) => None,
                }
            })
            .collect()
    }
}
