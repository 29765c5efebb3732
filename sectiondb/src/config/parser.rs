use super::types::StoreConfig;
use crate::error::{Result, SectionDbError};
use std::path::Path;

/// Parse a store configuration file
pub fn parse_config(path: &Path) -> Result<StoreConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a store configuration YAML string
pub fn parse_config_str(content: &str) -> Result<StoreConfig> {
    let config: StoreConfig = serde_yaml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &StoreConfig) -> Result<()> {
    if config.change_log_retention == 0 {
        return Err(SectionDbError::Config(
            "change_log_retention must be at least 1".to_string(),
        ));
    }
    for (name, view) in &config.views {
        if view.collections.is_empty() {
            return Err(SectionDbError::Config(format!(
                "View '{name}' must read at least one collection"
            )));
        }
        for rule in &view.filter {
            if rule.equals.is_none() && rule.min.is_none() && rule.max.is_none() {
                return Err(SectionDbError::Config(format!(
                    "Filter on '{}' in view '{name}' needs equals, min or max",
                    rule.field
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupOrder;
    use crate::projection::RecomputePolicy;
    use crate::record::Encoding;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
database: cities.sqlite
encoding: yaml
change_log_retention: 50
search:
  min_term_length: 2
views:
  cities_by_state:
    title: Cities
    collections: [cities]
    group_by: state
    sort:
      - { field: capital, descending: true }
      - { field: population, descending: true }
      - { field: name }
    filter:
      - { field: population, min: 50000 }
    search: { field: name }
    reversed_groups: [TX]
    group_order: descending
    header: { collection: states, field: name }
    recompute: verified
"#;
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.database, "cities.sqlite");
        assert_eq!(config.encoding, Encoding::Yaml);
        assert_eq!(config.change_log_retention, 50);
        assert_eq!(config.search.min_term_length, 2);

        let view = &config.views["cities_by_state"];
        assert_eq!(view.group_by.as_deref(), Some("state"));
        assert_eq!(view.sort.len(), 3);
        assert!(view.sort[0].descending);
        assert!(!view.sort[2].descending);
        assert_eq!(view.filter[0].min, Some(serde_json::json!(50000)));
        assert_eq!(view.search.as_ref().unwrap().field, "name");
        assert_eq!(view.reversed_groups, vec!["TX"]);
        assert_eq!(view.group_order, GroupOrder::Descending);
        assert_eq!(view.header.as_ref().unwrap().collection, "states");
        assert_eq!(view.recompute, RecomputePolicy::Verified);
    }

    #[test]
    fn test_defaults() {
        let config = parse_config_str("views: {}").unwrap();
        assert_eq!(config.encoding, Encoding::Json);
        assert_eq!(config.change_log_retention, 1000);
        assert_eq!(config.search.min_term_length, 1);
        assert!(!config.search.case_sensitive);
        assert!(!config.is_in_memory());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let err = parse_config_str("change_log_retention: 0").unwrap_err();
        assert!(matches!(err, SectionDbError::Config(_)));
    }

    #[test]
    fn test_view_without_collections_rejected() {
        let yaml = "views:\n  empty:\n    collections: []\n";
        assert!(parse_config_str(yaml).is_err());
    }

    #[test]
    fn test_filter_without_condition_rejected() {
        let yaml = "views:\n  v:\n    collections: [a]\n    filter:\n      - { field: x }\n";
        assert!(parse_config_str(yaml).is_err());
    }
}
