// Diff engine - section and row operations that turn one snapshot into another

use crate::error::{Result, SectionDbError};
use crate::projection::{IndexPath, Section, Snapshot};
use crate::record::{CompositeKey, Item};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    DeleteSection { section: usize, group: String },
    InsertSection { section: usize, group: String },
    DeleteRow { at: IndexPath, key: CompositeKey },
    InsertRow { at: IndexPath, key: CompositeKey },
    MoveRow { from: IndexPath, to: IndexPath, key: CompositeKey },
    ReloadRow { from: IndexPath, to: IndexPath, key: CompositeKey },
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOp::DeleteSection { section, group } => write!(f, "delete section {section} ({group})"),
            PatchOp::InsertSection { section, group } => write!(f, "insert section {section} ({group})"),
            PatchOp::DeleteRow { at, key } => write!(f, "delete row {at} {key}"),
            PatchOp::InsertRow { at, key } => write!(f, "insert row {at} {key}"),
            PatchOp::MoveRow { from, to, key } => write!(f, "move row {from} -> {to} {key}"),
            PatchOp::ReloadRow { from, to, key } => write!(f, "reload row {from} -> {to} {key}"),
        }
    }
}

/// An ordered list of operations: deletes in descending index order, then
/// inserts and moves in ascending destination order, then reloads.
///
/// Sections correspond by group label, rows by composite key. Indices in
/// deletes and move sources refer to the old snapshot; inserts, move
/// destinations and section inserts refer to the new one. Reloads carry both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOp> {
        self.ops.iter()
    }

    /// Apply this patch to `old` the way a list control would, taking
    /// inserted and moved rows from `new`.
    ///
    /// Fails with `PatchRejected` if an index or key does not line up.
    pub fn apply_to<T>(&self, old: &Snapshot<T>, new: &Snapshot<T>) -> Result<Snapshot<T>> {
        let mut sections: Vec<Section<T>> = old.sections.clone();

        // Rows out, deepest first so earlier indices stay valid.
        let mut outgoing: Vec<(IndexPath, &CompositeKey)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                PatchOp::DeleteRow { at, key } => Some((*at, key)),
                PatchOp::MoveRow { from, key, .. } => Some((*from, key)),
                _ => None,
            })
            .collect();
        outgoing.sort_by(|a, b| b.0.cmp(&a.0));
        for (path, key) in outgoing {
            let section = sections
                .get_mut(path.section)
                .ok_or_else(|| rejected(format!("no section {} to remove {key} from", path.section)))?;
            match section.items.get(path.row) {
                Some(item) if &item.key == key => {
                    section.items.remove(path.row);
                }
                _ => return Err(rejected(format!("{key} is not at {path}"))),
            }
        }

        let mut deleted: Vec<(usize, &str)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                PatchOp::DeleteSection { section, group } => Some((*section, group.as_str())),
                _ => None,
            })
            .collect();
        deleted.sort_by(|a, b| b.0.cmp(&a.0));
        for (index, group) in deleted {
            match sections.get(index) {
                Some(section) if section.group == group => {
                    sections.remove(index);
                }
                _ => return Err(rejected(format!("section '{group}' is not at {index}"))),
            }
        }

        let mut inserted: Vec<(usize, &str)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                PatchOp::InsertSection { section, group } => Some((*section, group.as_str())),
                _ => None,
            })
            .collect();
        inserted.sort_by_key(|(index, _)| *index);
        for (index, group) in inserted {
            let source = match new.sections.get(index) {
                Some(section) if section.group == group => section.clone(),
                _ => return Err(rejected(format!("new snapshot has no section '{group}' at {index}"))),
            };
            if index > sections.len() {
                return Err(rejected(format!("cannot insert section at {index}")));
            }
            sections.insert(index, source);
        }

        let mut incoming: Vec<(IndexPath, &CompositeKey)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                PatchOp::InsertRow { at, key } => Some((*at, key)),
                PatchOp::MoveRow { to, key, .. } => Some((*to, key)),
                _ => None,
            })
            .collect();
        incoming.sort_by_key(|(path, _)| *path);
        for (path, key) in incoming {
            let item = item_in(new, path, key)?;
            let section = sections
                .get_mut(path.section)
                .ok_or_else(|| rejected(format!("no section {} to insert {key} into", path.section)))?;
            if path.row > section.items.len() {
                return Err(rejected(format!("cannot insert {key} at {path}")));
            }
            section.items.insert(path.row, item);
        }

        for op in &self.ops {
            if let PatchOp::ReloadRow { to, key, .. } = op {
                let item = item_in(new, *to, key)?;
                match sections
                    .get_mut(to.section)
                    .and_then(|s| s.items.get_mut(to.row))
                {
                    Some(slot) if &slot.key == key => *slot = item,
                    _ => return Err(rejected(format!("{key} is not at {to} to reload"))),
                }
            }
        }

        Ok(Snapshot::new(sections))
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

fn rejected(reason: String) -> SectionDbError {
    SectionDbError::PatchRejected { reason }
}

fn item_in<T>(snapshot: &Snapshot<T>, path: IndexPath, key: &CompositeKey) -> Result<Arc<Item<T>>> {
    match snapshot.item(path) {
        Some(item) if &item.key == key => Ok(item.clone()),
        _ => Err(rejected(format!("new snapshot has no {key} at {path}"))),
    }
}

// ── Computation ──────────────────────────────────────────────────────

/// Compute the patch that turns `old` into `new`.
///
/// If either snapshot lists a key twice, or a group label twice, the
/// sections involved are replaced wholesale rather than diffed row by row.
pub fn compute_patch<T>(old: &Snapshot<T>, new: &Snapshot<T>) -> Patch {
    let ambiguous = ambiguous_groups(old, new);
    if !ambiguous.is_empty() {
        log::warn!(
            "Ambiguous snapshot layout; replacing section(s) {:?} wholesale",
            ambiguous
        );
    }

    // Sections
    let new_section_of: HashMap<&str, usize> = new
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| !ambiguous.contains(s.group.as_str()))
        .map(|(i, s)| (s.group.as_str(), i))
        .collect();
    let matched: Vec<(usize, usize)> = old
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| !ambiguous.contains(s.group.as_str()))
        .filter_map(|(i, s)| new_section_of.get(s.group.as_str()).map(|&j| (i, j)))
        .collect();
    let kept: Vec<(usize, usize)> = longest_increasing_run(&matched.iter().map(|&(_, j)| j).collect::<Vec<_>>())
        .into_iter()
        .map(|at| matched[at])
        .collect();

    let mut kept_new_of_old: HashMap<usize, usize> = HashMap::new();
    let mut kept_new: HashSet<usize> = HashSet::new();
    for &(i, j) in &kept {
        kept_new_of_old.insert(i, j);
        kept_new.insert(j);
    }

    let mut ops = Vec::new();
    let mut row_deletes = Vec::new();
    let mut section_deletes = Vec::new();
    let mut section_inserts = Vec::new();
    let mut arrivals = Vec::new();
    let mut reloads = Vec::new();

    for (i, section) in old.sections.iter().enumerate() {
        if !kept_new_of_old.contains_key(&i) {
            section_deletes.push(PatchOp::DeleteSection {
                section: i,
                group: section.group.clone(),
            });
        }
    }
    for (j, section) in new.sections.iter().enumerate() {
        if !kept_new.contains(&j) {
            section_inserts.push(PatchOp::InsertSection {
                section: j,
                group: section.group.clone(),
            });
        }
    }

    // Rows, within surviving sections only
    let old_rows = positions(old, kept_new_of_old.keys().copied());
    let new_rows = positions(new, kept_new.iter().copied());

    for &(i, j) in &kept {
        let mut same_section: Vec<(IndexPath, IndexPath, &Arc<Item<T>>)> = Vec::new();
        for (row, item) in old.sections[i].items.iter().enumerate() {
            let from = IndexPath::new(i, row);
            match new_rows.get(&item.key) {
                None => row_deletes.push(PatchOp::DeleteRow {
                    at: from,
                    key: item.key.clone(),
                }),
                Some(&to) if to.section != j => arrivals.push(PatchOp::MoveRow {
                    from,
                    to,
                    key: item.key.clone(),
                }),
                Some(&to) => same_section.push((from, to, item)),
            }
        }

        let stays: HashSet<usize> =
            longest_increasing_run(&same_section.iter().map(|(_, to, _)| to.row).collect::<Vec<_>>())
                .into_iter()
                .collect();
        for (at, (from, to, item)) in same_section.into_iter().enumerate() {
            if stays.contains(&at) {
                if let Some(current) = new.item(to) {
                    if current.etag != item.etag {
                        reloads.push(PatchOp::ReloadRow {
                            from,
                            to,
                            key: item.key.clone(),
                        });
                    }
                }
            } else {
                arrivals.push(PatchOp::MoveRow {
                    from,
                    to,
                    key: item.key.clone(),
                });
            }
        }

        for (row, item) in new.sections[j].items.iter().enumerate() {
            if !old_rows.contains_key(&item.key) {
                arrivals.push(PatchOp::InsertRow {
                    at: IndexPath::new(j, row),
                    key: item.key.clone(),
                });
            }
        }
    }

    row_deletes.sort_by(|a, b| source_path(b).cmp(&source_path(a)));
    section_deletes.reverse();
    arrivals.sort_by_key(destination_path);
    reloads.sort_by_key(destination_path);

    ops.extend(row_deletes);
    ops.extend(section_deletes);
    ops.extend(section_inserts);
    ops.extend(arrivals);
    ops.extend(reloads);
    Patch { ops }
}

fn source_path(op: &PatchOp) -> IndexPath {
    match op {
        PatchOp::DeleteRow { at, .. } => *at,
        PatchOp::MoveRow { from, .. } | PatchOp::ReloadRow { from, .. } => *from,
        PatchOp::InsertRow { at, .. } => *at,
        PatchOp::DeleteSection { section, .. } | PatchOp::InsertSection { section, .. } => {
            IndexPath::new(*section, 0)
        }
    }
}

fn destination_path(op: &PatchOp) -> IndexPath {
    match op {
        PatchOp::InsertRow { at, .. } | PatchOp::DeleteRow { at, .. } => *at,
        PatchOp::MoveRow { to, .. } | PatchOp::ReloadRow { to, .. } => *to,
        PatchOp::DeleteSection { section, .. } | PatchOp::InsertSection { section, .. } => {
            IndexPath::new(*section, 0)
        }
    }
}

/// Positions of every row in the given sections.
fn positions<T>(
    snapshot: &Snapshot<T>,
    sections: impl Iterator<Item = usize>,
) -> HashMap<CompositeKey, IndexPath> {
    let mut map = HashMap::new();
    for section in sections {
        for (row, item) in snapshot.sections[section].items.iter().enumerate() {
            map.insert(item.key.clone(), IndexPath::new(section, row));
        }
    }
    map
}

/// Labels of sections that cannot be diffed row by row: sections whose
/// label repeats, and sections holding a key that appears more than once in
/// the same snapshot.
fn ambiguous_groups<'a, T>(old: &'a Snapshot<T>, new: &'a Snapshot<T>) -> BTreeSet<&'a str> {
    let mut groups = BTreeSet::new();
    for snapshot in [old, new] {
        let mut labels: HashSet<&str> = HashSet::new();
        let mut seen: HashMap<&CompositeKey, &str> = HashMap::new();
        for section in &snapshot.sections {
            if !labels.insert(section.group.as_str()) {
                groups.insert(section.group.as_str());
            }
            for key in section.keys() {
                if let Some(first) = seen.insert(key, section.group.as_str()) {
                    groups.insert(first);
                    groups.insert(section.group.as_str());
                }
            }
        }
    }
    groups
}

/// Indices (into `values`) of one longest strictly increasing subsequence.
fn longest_increasing_run(values: &[usize]) -> Vec<usize> {
    // tails[k] = index of the smallest tail of an increasing run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut parent: Vec<Option<usize>> = vec![None; values.len()];

    for (i, &value) in values.iter().enumerate() {
        let len = tails.partition_point(|&t| values[t] < value);
        parent[i] = if len > 0 { Some(tails[len - 1]) } else { None };
        if len == tails.len() {
            tails.push(i);
        } else {
            tails[len] = i;
        }
    }

    let mut run = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        run.push(i);
        cursor = parent[i];
    }
    run.reverse();
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn item(key: &str, etag: u64) -> Arc<Item<()>> {
        let now = Utc::now();
        Arc::new(Item {
            key: CompositeKey::new("cities", key),
            value: (),
            metadata: None,
            etag,
            created_at: now,
            modified_at: now,
        })
    }

    fn snap(sections: &[(&str, &[(&str, u64)])]) -> Snapshot<()> {
        Snapshot::new(
            sections
                .iter()
                .map(|(group, rows)| {
                    Section::new(*group, rows.iter().map(|(k, e)| item(k, *e)).collect())
                })
                .collect(),
        )
    }

    fn key(k: &str) -> CompositeKey {
        CompositeKey::new("cities", k)
    }

    fn assert_round_trip(old: &Snapshot<()>, new: &Snapshot<()>) -> Patch {
        let patch = compute_patch(old, new);
        let applied = patch.apply_to(old, new).unwrap();
        assert!(
            applied.same_layout(new),
            "patch {patch:?} produced {:?}, expected {:?}",
            applied.layout(),
            new.layout()
        );
        patch
    }

    #[test]
    fn test_identical_snapshots_give_empty_patch() {
        let a = snap(&[("OH", &[("Columbus", 1), ("Cleveland", 1)]), ("TX", &[("Austin", 1)])]);
        assert!(compute_patch(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_cities_insert_at_end_of_section() {
        let old = snap(&[("OH", &[("Columbus", 1), ("Cleveland", 1)])]);
        let new = snap(&[("OH", &[("Columbus", 1), ("Cleveland", 1), ("Cincinnati", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![PatchOp::InsertRow {
                at: IndexPath::new(0, 2),
                key: key("Cincinnati")
            }]
        );
    }

    #[test]
    fn test_section_emptying_deletes_section_only() {
        let old = snap(&[("OH", &[("Akron", 1), ("Dayton", 1)]), ("TX", &[("Austin", 1)])]);
        let new = snap(&[("TX", &[("Austin", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![PatchOp::DeleteSection {
                section: 0,
                group: "OH".into()
            }]
        );
    }

    #[test]
    fn test_new_section_is_inserted_whole() {
        let old = snap(&[("TX", &[("Austin", 1)])]);
        let new = snap(&[("OH", &[("Akron", 1), ("Dayton", 1)]), ("TX", &[("Austin", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![PatchOp::InsertSection {
                section: 0,
                group: "OH".into()
            }]
        );
    }

    #[test]
    fn test_reordered_row_moves() {
        let old = snap(&[("OH", &[("a", 1), ("b", 1), ("c", 1)])]);
        let new = snap(&[("OH", &[("c", 1), ("a", 1), ("b", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![PatchOp::MoveRow {
                from: IndexPath::new(0, 2),
                to: IndexPath::new(0, 0),
                key: key("c")
            }]
        );
    }

    #[test]
    fn test_changed_etag_in_place_reloads() {
        let old = snap(&[("OH", &[("a", 1), ("b", 1)])]);
        let new = snap(&[("OH", &[("a", 2), ("b", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![PatchOp::ReloadRow {
                from: IndexPath::new(0, 0),
                to: IndexPath::new(0, 0),
                key: key("a")
            }]
        );
    }

    #[test]
    fn test_row_moves_between_surviving_sections() {
        let old = snap(&[("OH", &[("a", 1), ("b", 1)]), ("TX", &[("c", 1)])]);
        let new = snap(&[("OH", &[("a", 1)]), ("TX", &[("b", 2), ("c", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![PatchOp::MoveRow {
                from: IndexPath::new(0, 1),
                to: IndexPath::new(1, 0),
                key: key("b")
            }]
        );
    }

    #[test]
    fn test_rows_crossing_new_or_deleted_sections() {
        // "b" leaves a deleted section for a surviving one: insert.
        // "c" leaves a surviving section for a new one: delete.
        let old = snap(&[("OH", &[("a", 1), ("c", 1)]), ("TX", &[("b", 1)])]);
        let new = snap(&[("NY", &[("c", 1)]), ("OH", &[("a", 1), ("b", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![
                PatchOp::DeleteRow {
                    at: IndexPath::new(0, 1),
                    key: key("c")
                },
                PatchOp::DeleteSection {
                    section: 1,
                    group: "TX".into()
                },
                PatchOp::InsertSection {
                    section: 0,
                    group: "NY".into()
                },
                PatchOp::InsertRow {
                    at: IndexPath::new(1, 1),
                    key: key("b")
                },
            ]
        );
    }

    #[test]
    fn test_deletes_are_descending() {
        let old = snap(&[("OH", &[("a", 1), ("b", 1), ("c", 1), ("d", 1)])]);
        let new = snap(&[("OH", &[("b", 1)])]);
        let patch = assert_round_trip(&old, &new);
        let rows: Vec<usize> = patch
            .iter()
            .map(|op| match op {
                PatchOp::DeleteRow { at, .. } => at.row,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(rows, vec![3, 2, 0]);
    }

    #[test]
    fn test_duplicate_key_replaces_sections() {
        let old = snap(&[("OH", &[("a", 1), ("a", 1)]), ("TX", &[("c", 1)])]);
        let new = snap(&[("OH", &[("a", 1)]), ("TX", &[("c", 1)])]);
        let patch = assert_round_trip(&old, &new);
        assert_eq!(
            patch.ops,
            vec![
                PatchOp::DeleteSection {
                    section: 0,
                    group: "OH".into()
                },
                PatchOp::InsertSection {
                    section: 0,
                    group: "OH".into()
                },
            ]
        );
    }

    #[test]
    fn test_reordered_sections_are_replaced() {
        let old = snap(&[("A", &[("a", 1)]), ("B", &[("b", 1)])]);
        let new = snap(&[("B", &[("b", 1)]), ("A", &[("a", 1)])]);
        assert_round_trip(&old, &new);
    }

    #[test]
    fn test_apply_rejects_stale_patch() {
        let old = snap(&[("OH", &[("a", 1)])]);
        let new = snap(&[("OH", &[("a", 1), ("b", 1)])]);
        let patch = compute_patch(&old, &new);
        let elsewhere = snap(&[("TX", &[("z", 1)])]);
        assert!(matches!(
            patch.apply_to(&elsewhere, &new),
            Err(SectionDbError::PatchRejected { .. })
        ));

        let bogus = Patch {
            ops: vec![PatchOp::DeleteRow {
                at: IndexPath::new(0, 5),
                key: key("a"),
            }],
        };
        assert!(bogus.apply_to(&old, &new).is_err());
    }

    #[test]
    fn test_longest_increasing_run() {
        assert_eq!(longest_increasing_run(&[]), Vec::<usize>::new());
        assert_eq!(longest_increasing_run(&[0, 1, 2]), vec![0, 1, 2]);
        assert_eq!(longest_increasing_run(&[2, 0, 1]), vec![1, 2]);
        assert_eq!(longest_increasing_run(&[3, 1, 2, 0, 4]).len(), 3);
    }

    /// A store state: key -> (group, rank, etag). Rows sort by rank then key.
    fn build(state: &BTreeMap<u8, (u8, u8, u64)>) -> Snapshot<()> {
        let mut groups: BTreeMap<String, Vec<(u8, String, u64)>> = BTreeMap::new();
        for (k, (group, rank, etag)) in state {
            groups
                .entry(format!("g{group}"))
                .or_default()
                .push((*rank, format!("k{k:03}"), *etag));
        }
        Snapshot::new(
            groups
                .into_iter()
                .map(|(group, mut rows)| {
                    rows.sort();
                    Section::new(group, rows.iter().map(|(_, k, e)| item(k, *e)).collect())
                })
                .collect(),
        )
    }

    fn state_strategy() -> impl Strategy<Value = BTreeMap<u8, (u8, u8, u64)>> {
        prop::collection::btree_map(0u8..40, (0u8..5, 0u8..10, 0u64..3), 0..30)
    }

    proptest! {
        #[test]
        fn prop_patch_applied_to_old_yields_new(old in state_strategy(), new in state_strategy()) {
            let old = build(&old);
            let new = build(&new);
            let patch = compute_patch(&old, &new);
            let applied = patch.apply_to(&old, &new).unwrap();
            prop_assert!(applied.same_layout(&new));
        }

        #[test]
        fn prop_diff_of_identical_snapshots_is_empty(state in state_strategy()) {
            let a = build(&state);
            prop_assert!(compute_patch(&a, &a.clone()).is_empty());
        }
    }
}
