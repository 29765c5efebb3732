// Declarative views - compile a YAML ViewConfig into a ViewDefinition over JSON values

use super::search::{Search, SearchIndex, SearchOptions};
use super::ViewDefinition;
use crate::config::{FilterRule, GroupOrder, SearchDefaults, SortKey, ViewConfig};
use crate::record::{field, CompositeKey, Item};
use serde_json::Value;
use std::cmp::Ordering;

/// A view compiled from configuration.
pub struct CompiledView {
    pub title: String,
    pub view: ViewDefinition<Value>,
    /// The search handle, if the view has a search stage.
    pub search: Option<Search>,
}

/// Build a view from its configuration.
pub fn compile_view(name: &str, config: &ViewConfig, defaults: &SearchDefaults) -> CompiledView {
    let mut view = ViewDefinition::new(name, config.collections.iter().cloned())
        .with_policy(config.recompute);

    if let Some(path) = config.group_by.clone() {
        view = view.with_grouping(move |item: &Item<Value>| {
            field(&item.value, &path).map(group_label)
        });
    }

    if !config.sort.is_empty() {
        let keys = config.sort.clone();
        view = view.with_sorting(move |_, a: &Item<Value>, b: &Item<Value>| {
            compare_by_keys(&keys, &a.value, &b.value)
        });
    }

    if !config.filter.is_empty() {
        let rules = config.filter.clone();
        view = view.with_filter(move |_, item: &Item<Value>| {
            rules.iter().all(|rule| passes(rule, &item.value))
        });
    }

    if config.group_order == GroupOrder::Descending {
        view = view.with_group_order(|a, b| b.cmp(a));
    }

    for group in &config.reversed_groups {
        view = view.with_reversed_group(group.clone());
    }

    if let Some(header) = config.header.clone() {
        view = view.with_header(move |txn, group| {
            let key = CompositeKey::new(header.collection.clone(), group);
            match txn.get_item::<Value>(&key) {
                Ok(Some(item)) => field(&item.value, &header.field).map(group_label),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Header lookup for {key} failed: {e}");
                    None
                }
            }
        });
    }

    let mut search = None;
    if let Some(search_config) = &config.search {
        let handle = Search::new();
        let path = search_config.field.clone();
        let options = SearchOptions {
            min_term_length: search_config
                .min_term_length
                .unwrap_or(defaults.min_term_length),
            case_sensitive: search_config
                .case_sensitive
                .unwrap_or(defaults.case_sensitive),
        };
        view = view.with_search(
            SearchIndex::new(handle.clone(), move |item: &Item<Value>| {
                field(&item.value, &path).map(group_label)
            })
            .with_options(options),
        );
        search = Some(handle);
    }

    CompiledView {
        title: config.title.clone().unwrap_or_else(|| name.to_string()),
        view,
        search,
    }
}

/// Text form of a JSON value used for section labels and search text.
fn group_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare_by_keys(keys: &[SortKey], a: &Value, b: &Value) -> Ordering {
    for key in keys {
        let ordering = compare_values(field(a, &key.field), field(b, &key.field));
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Total order over optional JSON values: missing and null first, then
/// booleans, numbers, strings, and finally arrays and objects by their text.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x @ Value::Array(_)), Some(y @ Value::Array(_)))
        | (Some(x @ Value::Object(_)), Some(y @ Value::Object(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn passes(rule: &FilterRule, value: &Value) -> bool {
    let actual = field(value, &rule.field);
    if let Some(expected) = &rule.equals {
        if actual != Some(expected) {
            return false;
        }
    }
    if let Some(min) = &rule.min {
        if actual.is_none() || compare_values(actual, Some(min)) == Ordering::Less {
            return false;
        }
    }
    if let Some(max) = &rule.max {
        if actual.is_none() || compare_values(actual, Some(max)) == Ordering::Greater {
            return false;
        }
    }
    true
}
