// Projection pipeline - group, sort, filter and search records into a sectioned snapshot

pub mod declarative;
pub mod pipeline;
pub mod search;
pub mod snapshot;

pub use declarative::{compile_view, CompiledView};
pub use pipeline::{project, project_full, project_incremental, ProjectionOutcome};
pub use search::{Search, SearchIndex, SearchListenerId, SearchOptions};
pub use snapshot::{IndexPath, Section, Snapshot};

use crate::record::Item;
use crate::store::ReadTransaction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Assigns an item to a section. `None` leaves the item out of the view.
pub type GroupFn<T> = Arc<dyn Fn(&Item<T>) -> Option<String> + Send + Sync>;

/// Orders two items of the same section.
pub type SortFn<T> = Arc<dyn Fn(&str, &Item<T>, &Item<T>) -> Ordering + Send + Sync>;

/// Keeps an item in its section when it returns `true`.
pub type FilterFn<T> = Arc<dyn Fn(&str, &Item<T>) -> bool + Send + Sync>;

/// Orders section labels.
pub type GroupOrderFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Looks up the header title of a section.
pub type HeaderFn = Arc<dyn Fn(&ReadTransaction<'_>, &str) -> Option<String> + Send + Sync>;

/// How a view reacts to a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputePolicy {
    /// Re-evaluate every record of the view's collections.
    #[default]
    Full,
    /// Re-derive membership only for the keys in the change set.
    Incremental,
    /// Incremental, then cross-checked against a full evaluation.
    Verified,
}

/// A named view over one or more collections.
///
/// Every stage is optional. Without a grouping each item lands in the section
/// named after its collection; without a sorting rows are ordered by key.
/// Keys always break ties, so the row order is total.
pub struct ViewDefinition<T> {
    name: String,
    collections: Vec<String>,
    grouping: Option<GroupFn<T>>,
    sorting: Option<SortFn<T>>,
    filtering: Option<FilterFn<T>>,
    search: Option<SearchIndex<T>>,
    group_order: Option<GroupOrderFn>,
    reversed_groups: BTreeSet<String>,
    header: Option<HeaderFn>,
    policy: RecomputePolicy,
}

impl<T> Clone for ViewDefinition<T> {
    fn clone(&self) -> Self {
        ViewDefinition {
            name: self.name.clone(),
            collections: self.collections.clone(),
            grouping: self.grouping.clone(),
            sorting: self.sorting.clone(),
            filtering: self.filtering.clone(),
            search: self.search.clone(),
            group_order: self.group_order.clone(),
            reversed_groups: self.reversed_groups.clone(),
            header: self.header.clone(),
            policy: self.policy,
        }
    }
}

impl<T> ViewDefinition<T> {
    pub fn new<I, S>(name: impl Into<String>, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ViewDefinition {
            name: name.into(),
            collections: collections.into_iter().map(Into::into).collect(),
            grouping: None,
            sorting: None,
            filtering: None,
            search: None,
            group_order: None,
            reversed_groups: BTreeSet::new(),
            header: None,
            policy: RecomputePolicy::default(),
        }
    }

    pub fn with_grouping<F>(mut self, grouping: F) -> Self
    where
        F: Fn(&Item<T>) -> Option<String> + Send + Sync + 'static,
    {
        self.grouping = Some(Arc::new(grouping));
        self
    }

    /// The comparator must be a consistent total order within a section.
    pub fn with_sorting<F>(mut self, sorting: F) -> Self
    where
        F: Fn(&str, &Item<T>, &Item<T>) -> Ordering + Send + Sync + 'static,
    {
        self.sorting = Some(Arc::new(sorting));
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &Item<T>) -> bool + Send + Sync + 'static,
    {
        self.filtering = Some(Arc::new(filter));
        self
    }

    pub fn with_search(mut self, search: SearchIndex<T>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_group_order<F>(mut self, order: F) -> Self
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        self.group_order = Some(Arc::new(order));
        self
    }

    /// Show the rows of `group` in reverse order.
    pub fn with_reversed_group(mut self, group: impl Into<String>) -> Self {
        self.reversed_groups.insert(group.into());
        self
    }

    pub fn with_header<F>(mut self, header: F) -> Self
    where
        F: Fn(&ReadTransaction<'_>, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.header = Some(Arc::new(header));
        self
    }

    pub fn with_policy(mut self, policy: RecomputePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn policy(&self) -> RecomputePolicy {
        self.policy
    }

    pub fn search(&self) -> Option<&SearchIndex<T>> {
        self.search.as_ref()
    }

    pub fn is_reversed(&self, group: &str) -> bool {
        self.reversed_groups.contains(group)
    }

    pub fn reads(&self, collection: &str) -> bool {
        self.collections.iter().any(|c| c == collection)
    }

    /// Title for the section with this label, if a header provider is set.
    pub fn header_title(&self, txn: &ReadTransaction<'_>, group: &str) -> Option<String> {
        self.header.as_ref().and_then(|header| header(txn, group))
    }

    /// Group, filter and search one item. `term` is the normalized search
    /// term; `None` with a search stage present means nothing matches.
    pub(crate) fn classify(&self, item: &Item<T>, term: Option<&str>) -> Option<String> {
        let group = match &self.grouping {
            Some(grouping) => grouping(item)?,
            None => item.key.collection.clone(),
        };
        if let Some(filter) = &self.filtering {
            if !filter(&group, item) {
                return None;
            }
        }
        if let Some(search) = &self.search {
            if !search.matches(term?, item) {
                return None;
            }
        }
        Some(group)
    }

    /// Row order within `group`, including the key tie-break and reversal.
    pub(crate) fn compare(&self, group: &str, a: &Item<T>, b: &Item<T>) -> Ordering {
        let ordering = match &self.sorting {
            Some(sorting) => sorting(group, a, b),
            None => Ordering::Equal,
        }
        .then_with(|| a.key.cmp(&b.key));
        if self.is_reversed(group) {
            ordering.reverse()
        } else {
            ordering
        }
    }

    pub(crate) fn compare_groups(&self, a: &str, b: &str) -> Ordering {
        match &self.group_order {
            Some(order) => order(a, b).then_with(|| a.cmp(b)),
            None => a.cmp(b),
        }
    }
}
