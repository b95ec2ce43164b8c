//! Metadata predicates.
//!
//! A [`MetadataFilter`] is a `(key, operator, value)` triple. Processors use
//! it to describe the set of objects a credential may see; downstream query
//! engines receive it as a pre-filter. [`MetadataFilters`] combines several
//! with `AND`/`OR`, which is how callers wrap the per-processor list returned
//! by [`ProcessorMixer::get_filters`](crate::mixer::ProcessorMixer::get_filters).

use serde::{Deserialize, Serialize};

use crate::models::{Metadata, MetadataValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FilterOperator {
    /// Equal to the single filter value.
    Eq,
    /// Not equal to the single filter value.
    Ne,
    /// Member of the filter value set. An empty set matches nothing.
    In,
    /// The metadata list contains the filter value, or the metadata text
    /// contains it as a substring.
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub key: String,
    pub operator: FilterOperator,
    pub value: Vec<MetadataValue>,
}

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            operator: FilterOperator::Eq,
            value: vec![value.into()],
        }
    }

    pub fn ne(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            operator: FilterOperator::Ne,
            value: vec![value.into()],
        }
    }

    pub fn is_in(key: impl Into<String>, values: Vec<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            operator: FilterOperator::In,
            value: values,
        }
    }

    pub fn contains(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            operator: FilterOperator::Contains,
            value: vec![value.into()],
        }
    }

    /// Test a single document's metadata. A missing key never matches.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.get(&self.key) else {
            return false;
        };

        match self.operator {
            FilterOperator::Eq => self.value.first().is_some_and(|v| same_value(actual, v)),
            FilterOperator::Ne => self.value.first().is_some_and(|v| !same_value(actual, v)),
            FilterOperator::In => self.value.iter().any(|v| same_value(actual, v)),
            FilterOperator::Contains => self.value.first().is_some_and(|needle| match actual {
                MetadataValue::Text(text) => needle
                    .as_text()
                    .is_some_and(|n| text.contains(n)),
                MetadataValue::List(items) | MetadataValue::Tuple(items) => needle
                    .as_text()
                    .is_some_and(|n| items.iter().any(|item| item == n)),
            }),
        }
    }
}

/// Tuples and lists compare by their parts.
fn same_value(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a, b) {
        (MetadataValue::Text(x), MetadataValue::Text(y)) => x == y,
        (MetadataValue::Text(_), _) | (_, MetadataValue::Text(_)) => false,
        _ => a.parts() == b.parts(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    And,
    Or,
}

/// A boolean combination of filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilters {
    pub filters: Vec<MetadataFilter>,
    pub condition: FilterCondition,
}

impl MetadataFilters {
    /// OR-combine per-source filters. An empty list matches nothing.
    pub fn any(filters: Vec<MetadataFilter>) -> Self {
        Self {
            filters,
            condition: FilterCondition::Or,
        }
    }

    pub fn all(filters: Vec<MetadataFilter>) -> Self {
        Self {
            filters,
            condition: FilterCondition::And,
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self.condition {
            FilterCondition::Or => self.filters.iter().any(|f| f.matches(metadata)),
            FilterCondition::And => {
                !self.filters.is_empty() && self.filters.iter().all(|f| f.matches(metadata))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::keys;

    fn md(pairs: &[(&str, MetadataValue)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_in_empty_set_matches_nothing() {
        let filter = MetadataFilter::is_in(keys::SLACK_CHANNEL_ID, vec![]);
        let meta = md(&[(keys::SLACK_CHANNEL_ID, "C1".into())]);
        assert!(!filter.matches(&meta));
    }

    #[test]
    fn test_in_matches_member() {
        let filter = MetadataFilter::is_in(keys::SLACK_CHANNEL_ID, vec!["C1".into(), "C2".into()]);
        assert!(filter.matches(&md(&[(keys::SLACK_CHANNEL_ID, "C2".into())])));
        assert!(!filter.matches(&md(&[(keys::SLACK_CHANNEL_ID, "C3".into())])));
    }

    #[test]
    fn test_missing_key_never_matches() {
        let filter = MetadataFilter::ne(keys::JIRA_ISSUE_ID, "10");
        assert!(!filter.matches(&Metadata::new()));
    }

    #[test]
    fn test_tuple_matches_list_after_round_trip() {
        let filter = MetadataFilter::is_in(
            keys::GITHUB_REPOSITORY_OWNER_AND_NAME,
            vec![MetadataValue::tuple(["octo", "docs"])],
        );
        let stored = md(&[(
            keys::GITHUB_REPOSITORY_OWNER_AND_NAME,
            MetadataValue::List(vec!["octo".into(), "docs".into()]),
        )]);
        assert!(filter.matches(&stored));
    }

    #[test]
    fn test_contains_list_and_text() {
        let owners = md(&[(
            keys::GDRIVE_OWNERS,
            MetadataValue::List(vec!["alice@example.com".into()]),
        )]);
        assert!(MetadataFilter::contains(keys::GDRIVE_OWNERS, "alice@example.com").matches(&owners));

        let path = md(&[(keys::FILE_PATH, "/docs/runbook.md".into())]);
        assert!(MetadataFilter::contains(keys::FILE_PATH, "runbook").matches(&path));
    }

    #[test]
    fn test_or_of_nothing_is_deny() {
        let meta = md(&[(keys::DATA_SOURCE, "slack".into())]);
        assert!(!MetadataFilters::any(vec![]).matches(&meta));
        assert!(!MetadataFilters::all(vec![]).matches(&meta));
    }

    #[test]
    fn test_or_combines_sources() {
        let filters = MetadataFilters::any(vec![
            MetadataFilter::is_in(keys::SLACK_CHANNEL_ID, vec!["C1".into()]),
            MetadataFilter::is_in(keys::CONFLUENCE_PAGE_ID, vec!["42".into()]),
        ]);
        assert!(filters.matches(&md(&[(keys::CONFLUENCE_PAGE_ID, "42".into())])));
        assert!(!filters.matches(&md(&[(keys::CONFLUENCE_PAGE_ID, "43".into())])));
    }

    #[test]
    fn test_filter_serializes_for_downstream_engines() {
        let filter = MetadataFilter::is_in(keys::JIRA_ISSUE_ID, vec!["1".into()]);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["operator"], "in");
        assert_eq!(json["value"][0], "1");
    }
}
