use super::snapshot::{Section, Snapshot};
use super::{RecomputePolicy, ViewDefinition};
use crate::error::{Result, SectionDbError};
use crate::record::{CompositeKey, Item};
use crate::store::{ChangeSet, ReadTransaction};
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// A new snapshot, plus the inconsistency that forced a full evaluation if
/// the incremental path could not be trusted.
pub struct ProjectionOutcome<T> {
    pub snapshot: Snapshot<T>,
    pub recovered: Option<SectionDbError>,
}

/// Evaluate `view` after `changes`, following the view's recompute policy.
///
/// Without a previous snapshot or change set, or when the change set asks
/// for a resync, this is a full evaluation.
pub fn project<T: DeserializeOwned>(
    view: &ViewDefinition<T>,
    txn: &ReadTransaction<'_>,
    previous: Option<&Snapshot<T>>,
    changes: Option<&ChangeSet>,
) -> Result<ProjectionOutcome<T>> {
    let full_only = || -> Result<ProjectionOutcome<T>> {
        Ok(ProjectionOutcome {
            snapshot: project_full(view, txn)?,
            recovered: None,
        })
    };
    let (previous, changes) = match (previous, changes) {
        (Some(p), Some(c)) if !c.resync => (p, c),
        _ => return full_only(),
    };

    match view.policy() {
        RecomputePolicy::Full => full_only(),
        RecomputePolicy::Incremental => match project_incremental(view, txn, previous, changes) {
            Ok(snapshot) => Ok(ProjectionOutcome {
                snapshot,
                recovered: None,
            }),
            Err(e @ SectionDbError::ProjectionInconsistent { .. }) => {
                log::warn!("{e}; falling back to full evaluation");
                Ok(ProjectionOutcome {
                    snapshot: project_full(view, txn)?,
                    recovered: Some(e),
                })
            }
            Err(e) => Err(e),
        },
        RecomputePolicy::Verified => {
            let incremental = project_incremental(view, txn, previous, changes);
            let full = project_full(view, txn)?;
            let recovered = match incremental {
                Ok(snapshot) if snapshot.same_layout(&full) => None,
                Ok(_) => Some(SectionDbError::ProjectionInconsistent {
                    view: view.name().to_string(),
                    reason: format!(
                        "incremental result for commit {} diverged from full evaluation",
                        changes.commit
                    ),
                }),
                Err(e @ SectionDbError::ProjectionInconsistent { .. }) => Some(e),
                Err(e) => return Err(e),
            };
            if let Some(e) = &recovered {
                log::warn!("{e}; using full evaluation");
            }
            Ok(ProjectionOutcome {
                snapshot: full,
                recovered,
            })
        }
    }
}

/// Evaluate every record of the view's collections.
pub fn project_full<T: DeserializeOwned>(
    view: &ViewDefinition<T>,
    txn: &ReadTransaction<'_>,
) -> Result<Snapshot<T>> {
    let term = view.search().and_then(|s| s.normalized_term());
    let mut groups: BTreeMap<String, Vec<Arc<Item<T>>>> = BTreeMap::new();

    for collection in view.collections() {
        for raw in txn.raw_records(collection)? {
            let item: Item<T> = match raw.decode(txn.encoding()) {
                Ok(item) => item,
                Err(e) => {
                    log::warn!(
                        "View '{}' skipping undecodable record {}: {e}",
                        view.name(),
                        raw.composite_key()
                    );
                    continue;
                }
            };
            if let Some(group) = view.classify(&item, term.as_deref()) {
                groups.entry(group).or_default().push(Arc::new(item));
            }
        }
    }

    let mut sections: Vec<Section<T>> = groups
        .into_iter()
        .map(|(group, mut items)| {
            items.sort_by(|a, b| view.compare(&group, a, b));
            Section::new(group, items)
        })
        .collect();
    sections.sort_by(|a, b| view.compare_groups(&a.group, &b.group));

    log::debug!(
        "View '{}' evaluated: {} section(s), {} row(s)",
        view.name(),
        sections.len(),
        sections.iter().map(|s| s.items.len()).sum::<usize>()
    );
    Ok(Snapshot::new(sections))
}

/// Re-derive membership only for the keys in `changes`, starting from `previous`.
///
/// Each re-admitted item is placed by binary search with the view's
/// comparator. If the comparator disagrees with itself around the insertion
/// point the result cannot be trusted and `ProjectionInconsistent` is returned.
pub fn project_incremental<T: DeserializeOwned>(
    view: &ViewDefinition<T>,
    txn: &ReadTransaction<'_>,
    previous: &Snapshot<T>,
    changes: &ChangeSet,
) -> Result<Snapshot<T>> {
    let touched: HashSet<&CompositeKey> = changes
        .touched_keys()
        .filter(|k| view.reads(&k.collection))
        .collect();

    let mut groups: BTreeMap<String, Vec<Arc<Item<T>>>> = previous
        .sections
        .iter()
        .map(|s| {
            let kept = s
                .items
                .iter()
                .filter(|item| !touched.contains(&item.key))
                .cloned()
                .collect();
            (s.group.clone(), kept)
        })
        .collect();

    let term = view.search().and_then(|s| s.normalized_term());
    for key in changes
        .inserted
        .iter()
        .chain(changes.updated.iter())
        .filter(|k| touched.contains(k))
    {
        let Some(raw) = txn.raw_record(key)? else {
            continue;
        };
        let item: Item<T> = match raw.decode(txn.encoding()) {
            Ok(item) => item,
            Err(e) => {
                log::warn!("View '{}' skipping undecodable record {key}: {e}", view.name());
                continue;
            }
        };
        let Some(group) = view.classify(&item, term.as_deref()) else {
            continue;
        };

        let rows = groups.entry(group.clone()).or_default();
        let at = rows.partition_point(|existing| view.compare(&group, existing, &item) == Ordering::Less);
        check_neighbors(view, &group, rows, at, &item)?;
        rows.insert(at, Arc::new(item));
    }

    let mut sections: Vec<Section<T>> = groups
        .into_iter()
        .filter(|(_, items)| !items.is_empty())
        .map(|(group, items)| Section::new(group, items))
        .collect();
    sections.sort_by(|a, b| view.compare_groups(&a.group, &b.group));
    Ok(Snapshot::new(sections))
}

fn check_neighbors<T>(
    view: &ViewDefinition<T>,
    group: &str,
    rows: &[Arc<Item<T>>],
    at: usize,
    item: &Item<T>,
) -> Result<()> {
    let inconsistent = |other: &Item<T>| SectionDbError::ProjectionInconsistent {
        view: view.name().to_string(),
        reason: format!(
            "sorting of '{}' and '{}' in section '{group}' is not a consistent order",
            item.key, other.key
        ),
    };

    if at > 0 {
        let before = &rows[at - 1];
        if view.compare(group, before, item) != Ordering::Less
            || view.compare(group, item, before) != Ordering::Greater
        {
            return Err(inconsistent(before));
        }
    }
    if let Some(after) = rows.get(at) {
        if view.compare(group, item, after) != Ordering::Less
            || view.compare(group, after, item) != Ordering::Greater
        {
            return Err(inconsistent(after));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{Search, SearchIndex};
    use crate::record::Identifiable;
    use crate::store::Store;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct City {
        name: String,
        state: String,
        population: u64,
        capital: bool,
    }

    impl Identifiable for City {
        const COLLECTION: &'static str = "cities";

        fn key(&self) -> String {
            self.name.clone()
        }
    }

    fn city(name: &str, state: &str, population: u64, capital: bool) -> City {
        City {
            name: name.into(),
            state: state.into(),
            population,
            capital,
        }
    }

    /// Capitals first, then by population descending, then by name.
    fn cities_view() -> ViewDefinition<City> {
        ViewDefinition::new("cities", ["cities"])
            .with_grouping(|item: &Item<City>| Some(item.value.state.clone()))
            .with_sorting(|_, a: &Item<City>, b: &Item<City>| {
                b.value
                    .capital
                    .cmp(&a.value.capital)
                    .then(b.value.population.cmp(&a.value.population))
                    .then(a.value.name.cmp(&b.value.name))
            })
    }

    fn seed(store: &Store) {
        store
            .write(|txn| {
                txn.put(&city("Columbus", "OH", 905_000, true))?;
                txn.put(&city("Cleveland", "OH", 372_000, false))?;
                txn.put(&city("Austin", "TX", 961_000, true))?;
                txn.put(&city("Houston", "TX", 2_300_000, false))?;
                Ok(())
            })
            .unwrap();
    }

    fn names(snapshot: &Snapshot<City>) -> Vec<(String, Vec<String>)> {
        snapshot
            .sections
            .iter()
            .map(|s| {
                (
                    s.group.clone(),
                    s.items.iter().map(|i| i.value.name.clone()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_group_sort_and_section_order() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let snapshot = store.read(|txn| project_full(&cities_view(), txn)).unwrap();
        assert_eq!(
            names(&snapshot),
            vec![
                ("OH".to_string(), vec!["Columbus".to_string(), "Cleveland".to_string()]),
                ("TX".to_string(), vec!["Austin".to_string(), "Houston".to_string()]),
            ]
        );
    }

    #[test]
    fn test_filter_reversal_and_group_order() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let view = cities_view()
            .with_filter(|_, item: &Item<City>| item.value.population > 500_000)
            .with_reversed_group("TX")
            .with_group_order(|a, b| b.cmp(a));
        let snapshot = store.read(|txn| project_full(&view, txn)).unwrap();
        assert_eq!(
            names(&snapshot),
            vec![
                ("TX".to_string(), vec!["Houston".to_string(), "Austin".to_string()]),
                ("OH".to_string(), vec!["Columbus".to_string()]),
            ]
        );
    }

    #[test]
    fn test_search_stage() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|txn| {
                txn.put(&city("Springfield", "IL", 114_000, true))?;
                txn.put(&city("Spring Valley", "NY", 33_000, false))?;
                txn.put(&city("Offspring", "OH", 1, false))?;
                Ok(())
            })
            .unwrap();

        let search = Search::new();
        let view = cities_view().with_search(SearchIndex::new(search.clone(), |item: &Item<City>| {
            Some(item.value.name.clone())
        }));

        let empty = store.read(|txn| project_full(&view, txn)).unwrap();
        assert!(empty.is_empty());

        search.set_term("Spring");
        let found = store.read(|txn| project_full(&view, txn)).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.section_index("OH").is_none());
    }

    #[test]
    fn test_undecodable_records_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store
            .write(|txn| {
                txn.put_value(
                    &CompositeKey::new("cities", "Broken"),
                    &serde_json::json!({ "name": 3 }),
                    None,
                )
            })
            .unwrap();

        let snapshot = store.read(|txn| project_full(&cities_view(), txn)).unwrap();
        assert_eq!(snapshot.len(), 4);
    }

    #[test]
    fn test_incremental_matches_full() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let view = cities_view().with_policy(RecomputePolicy::Incremental);
        let before = store.read(|txn| project_full(&view, txn)).unwrap();

        let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let c = changes.clone();
        store.subscribe(move |set| c.lock().push(set.clone()));

        store
            .write(|txn| {
                txn.put(&city("Cincinnati", "OH", 309_000, false))?;
                txn.put(&city("Houston", "OH", 2_300_000, false))?;
                txn.remove(&City::composite_key_for("Austin"))?;
                Ok(())
            })
            .unwrap();

        let set = changes.lock()[0].clone();
        let outcome = store
            .read(|txn| project(&view, txn, Some(&before), Some(&set)))
            .unwrap();
        let full = store.read(|txn| project_full(&view, txn)).unwrap();

        assert!(outcome.recovered.is_none());
        assert_eq!(names(&outcome.snapshot), names(&full));
        assert!(outcome.snapshot.same_layout(&full));
        assert_eq!(
            names(&full),
            vec![(
                "OH".to_string(),
                vec![
                    "Columbus".to_string(),
                    "Houston".to_string(),
                    "Cleveland".to_string(),
                    "Cincinnati".to_string()
                ]
            )]
        );
    }

    #[test]
    fn test_inconsistent_sorting_falls_back_to_full() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        // Claims every pair is "less", so no order is consistent.
        let flip = Arc::new(AtomicBool::new(false));
        let f = flip.clone();
        let view = ViewDefinition::<City>::new("broken", ["cities"])
            .with_grouping(|item: &Item<City>| Some(item.value.state.clone()))
            .with_sorting(move |_, _, _| {
                if f.load(AtomicOrdering::SeqCst) {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .with_policy(RecomputePolicy::Incremental);

        let before = store.read(|txn| project_full(&view, txn)).unwrap();
        flip.store(true, AtomicOrdering::SeqCst);

        let mut set = ChangeSet {
            commit: 2,
            ..Default::default()
        };
        store.put(&city("Dayton", "OH", 137_000, false)).unwrap();
        set.inserted.insert(City::composite_key_for("Dayton"));

        let outcome = store
            .read(|txn| project(&view, txn, Some(&before), Some(&set)))
            .unwrap();
        assert!(matches!(
            outcome.recovered,
            Some(SectionDbError::ProjectionInconsistent { .. })
        ));
        assert_eq!(outcome.snapshot.len(), 5);
    }

    #[test]
    fn test_verified_policy_agrees_when_consistent() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let view = cities_view().with_policy(RecomputePolicy::Verified);
        let before = store.read(|txn| project_full(&view, txn)).unwrap();

        store.put(&city("Cleveland", "OH", 1_000_000, false)).unwrap();
        let mut set = ChangeSet {
            commit: 2,
            ..Default::default()
        };
        set.updated.insert(City::composite_key_for("Cleveland"));

        let outcome = store
            .read(|txn| project(&view, txn, Some(&before), Some(&set)))
            .unwrap();
        assert!(outcome.recovered.is_none());
        assert_eq!(
            names(&outcome.snapshot)[0].1,
            vec!["Columbus".to_string(), "Cleveland".to_string()]
        );
    }

    #[test]
    fn test_repeated_evaluation_is_deterministic() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let view = cities_view();
        let a = store.read(|txn| project_full(&view, txn)).unwrap();
        let b = store.read(|txn| project_full(&view, txn)).unwrap();
        assert!(a.same_layout(&b));
    }
}
