use crate::record::{CompositeKey, Item};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Position of a row in a sectioned list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexPath {
    pub section: usize,
    pub row: usize,
}

impl IndexPath {
    pub fn new(section: usize, row: usize) -> Self {
        IndexPath { section, row }
    }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.section, self.row)
    }
}

/// One section of a snapshot: a group label and its ordered rows.
#[derive(Debug)]
pub struct Section<T> {
    pub group: String,
    pub items: Vec<Arc<Item<T>>>,
}

impl<T> Clone for Section<T> {
    fn clone(&self) -> Self {
        Section {
            group: self.group.clone(),
            items: self.items.clone(),
        }
    }
}

impl<T> Section<T> {
    pub fn new(group: impl Into<String>, items: Vec<Arc<Item<T>>>) -> Self {
        Section {
            group: group.into(),
            items,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &CompositeKey> {
        self.items.iter().map(|item| &item.key)
    }
}

/// An immutable, ordered list of non-empty sections.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub sections: Vec<Section<T>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Snapshot {
            sections: self.sections.clone(),
        }
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Snapshot {
            sections: Vec::new(),
        }
    }
}

impl<T> Snapshot<T> {
    pub fn new(sections: Vec<Section<T>>) -> Self {
        Snapshot { sections }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn row_count(&self, section: usize) -> usize {
        self.sections.get(section).map_or(0, |s| s.items.len())
    }

    /// Total number of rows across all sections.
    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn item(&self, path: IndexPath) -> Option<&Arc<Item<T>>> {
        self.sections.get(path.section)?.items.get(path.row)
    }

    pub fn section_index(&self, group: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.group == group)
    }

    pub fn index_path_of(&self, key: &CompositeKey) -> Option<IndexPath> {
        self.sections.iter().enumerate().find_map(|(section, s)| {
            s.items
                .iter()
                .position(|item| &item.key == key)
                .map(|row| IndexPath { section, row })
        })
    }

    /// Group labels with their row keys and etags, in display order.
    pub fn layout(&self) -> Vec<(String, Vec<(CompositeKey, u64)>)> {
        self.sections
            .iter()
            .map(|s| {
                (
                    s.group.clone(),
                    s.items.iter().map(|i| (i.key.clone(), i.etag)).collect(),
                )
            })
            .collect()
    }

    /// Same sections, rows and record versions as `other`.
    pub fn same_layout(&self, other: &Snapshot<T>) -> bool {
        self.sections.len() == other.sections.len()
            && self.sections.iter().zip(&other.sections).all(|(a, b)| {
                a.group == b.group
                    && a.items.len() == b.items.len()
                    && a.items
                        .iter()
                        .zip(&b.items)
                        .all(|(x, y)| x.key == y.key && x.etag == y.etag)
            })
    }
}
