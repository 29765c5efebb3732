use crate::projection::RecomputePolicy;
use crate::record::Encoding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level store configuration parsed from a YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite database file, or `:memory:`
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub encoding: Encoding,
    /// How many commits the change log keeps for other connections to catch up on
    #[serde(default = "default_retention")]
    pub change_log_retention: u64,
    #[serde(default)]
    pub search: SearchDefaults,
    #[serde(default)]
    pub views: BTreeMap<String, ViewConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database: default_database(),
            encoding: Encoding::default(),
            change_log_retention: default_retention(),
            search: SearchDefaults::default(),
            views: BTreeMap::new(),
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        StoreConfig {
            database: ":memory:".to_string(),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database == ":memory:"
    }
}

fn default_database() -> String {
    "sectiondb.sqlite".to_string()
}

fn default_retention() -> u64 {
    1000
}

/// Search settings applied when a view does not override them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchDefaults {
    #[serde(default = "default_min_term_length")]
    pub min_term_length: usize,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        SearchDefaults {
            min_term_length: default_min_term_length(),
            case_sensitive: false,
        }
    }
}

fn default_min_term_length() -> usize {
    1
}

/// A declarative view over one or more collections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    #[serde(default)]
    pub title: Option<String>,
    pub collections: Vec<String>,
    /// Dotted field path whose value names the section. Without it every
    /// item lands in a section named after its collection.
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub filter: Vec<FilterRule>,
    #[serde(default)]
    pub search: Option<SearchConfig>,
    #[serde(default)]
    pub reversed_groups: Vec<String>,
    #[serde(default)]
    pub group_order: GroupOrder,
    #[serde(default)]
    pub header: Option<HeaderConfig>,
    #[serde(default)]
    pub recompute: RecomputePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Keep items whose field equals a value and/or lies within bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterRule {
    pub field: String,
    #[serde(default)]
    pub equals: Option<serde_json::Value>,
    #[serde(default)]
    pub min: Option<serde_json::Value>,
    #[serde(default)]
    pub max: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchConfig {
    pub field: String,
    #[serde(default)]
    pub min_term_length: Option<usize>,
    #[serde(default)]
    pub case_sensitive: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupOrder {
    #[default]
    Ascending,
    Descending,
}

/// Section titles looked up from a record keyed by the group label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderConfig {
    pub collection: String,
    pub field: String,
}
