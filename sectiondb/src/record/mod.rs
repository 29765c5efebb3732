// Records - addressing, encoding, and the decoded item handed to projections

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a record: a key within a named collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub collection: String,
    pub key: String,
}

impl CompositeKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        CompositeKey {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// A value that knows which collection it lives in and what its key is.
pub trait Identifiable {
    const COLLECTION: &'static str;

    fn key(&self) -> String;

    fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(Self::COLLECTION, self.key())
    }

    /// Address of a record of this type with the given key.
    fn composite_key_for(key: &str) -> CompositeKey {
        CompositeKey::new(Self::COLLECTION, key)
    }
}

/// Anything that can be identified and round-tripped through an [`Encoding`].
pub trait Persistable: Identifiable + Serialize + DeserializeOwned {}

impl<T> Persistable for T where T: Identifiable + Serialize + DeserializeOwned {}

/// A decoded record as seen by views and list bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item<T> {
    pub key: CompositeKey,
    pub value: T,
    pub metadata: Option<serde_json::Value>,
    /// Hash of the stored payload and metadata bytes. Changes iff the bytes change.
    pub etag: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Byte encoding used for record payloads and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    Yaml,
}

impl Encoding {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(match self {
            Encoding::Json => serde_json::to_vec(value)?,
            Encoding::Yaml => serde_yaml::to_string(value)?.into_bytes(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            Encoding::Json => serde_json::from_slice(bytes)?,
            Encoding::Yaml => serde_yaml::from_slice(bytes)?,
        })
    }
}

/// Strategies for generating keys for records without a natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Ulid,
    Uuid,
    Nanoid,
}

impl KeyStrategy {
    pub fn generate(&self) -> String {
        match self {
            KeyStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            KeyStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            KeyStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

impl std::str::FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ulid" => Ok(KeyStrategy::Ulid),
            "uuid" => Ok(KeyStrategy::Uuid),
            "nanoid" => Ok(KeyStrategy::Nanoid),
            other => Err(format!("Unknown key strategy '{other}'")),
        }
    }
}

/// Compute the etag of a stored record from its payload and metadata bytes.
pub fn compute_etag(data: &[u8], metadata: Option<&[u8]>) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    metadata.hash(&mut hasher);
    hasher.finish()
}

/// Look up a dotted field path (`address.city`) in a JSON value.
pub fn field<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}
