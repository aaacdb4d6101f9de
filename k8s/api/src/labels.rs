use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use thiserror::Error;

#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of objects by their labels. The results of `match_labels` and
/// `match_expressions` are ANDed.
///
/// A default (empty) selector matches everything; the distinction between "no
/// selector" and "empty selector" is carried by the `Option` wrapping the
/// selector wherever it appears.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

/// A selector that cannot be evaluated against any label set.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidSelector {
    #[error("operator {operator:?} on key {key:?} requires a non-empty values list")]
    MissingValues { key: String, operator: Operator },

    #[error("operator {operator:?} on key {key:?} must not carry values")]
    UnexpectedValues { key: String, operator: Operator },
}

// === Selector ===

impl Selector {
    #[cfg(test)]
    fn new(labels: Map, exprs: Expressions) -> Self {
        Self {
            match_labels: Some(labels),
            match_expressions: Some(exprs),
        }
    }

    fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    /// Indicates whether this selector matches all objects.
    pub fn selects_all(&self) -> bool {
        match (self.match_labels.as_ref(), self.match_expressions.as_ref()) {
            (None, None) => true,
            (Some(l), None) => l.is_empty(),
            (None, Some(e)) => e.is_empty(),
            (Some(l), Some(e)) => l.is_empty() && e.is_empty(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }

    /// Checks that every expression carries a value list consistent with its
    /// operator, the way the API server compiles selectors.
    pub fn validate(&self) -> Result<(), InvalidSelector> {
        for expr in self.match_expressions.iter().flatten() {
            expr.validate()?;
        }
        Ok(())
    }

    pub fn labels(&self) -> Option<&Map> {
        self.match_labels.as_ref()
    }

    pub fn expressions(&self) -> Option<&Expressions> {
        self.match_expressions.as_ref()
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(key: String, operator: Operator, values: Option<BTreeSet<String>>) -> Self {
        Self {
            key,
            operator,
            values,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn values(&self) -> Option<&BTreeSet<String>> {
        self.values.as_ref()
    }

    fn matches(&self, labels: &Map) -> bool {
        match (self.operator, &self.key, self.values.as_ref()) {
            (Operator::In, key, Some(values)) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            (Operator::NotIn, key, Some(values)) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            (Operator::Exists, key, None) => labels.contains_key(key),
            (Operator::DoesNotExist, key, None) => !labels.contains_key(key),
            (operator, key, values) => {
                tracing::warn!(?operator, %key, ?values, "illegal match expression");
                false
            }
        }
    }

    fn validate(&self) -> Result<(), InvalidSelector> {
        match self.operator {
            Operator::In | Operator::NotIn => {
                if self.values.as_ref().map_or(true, |vs| vs.is_empty()) {
                    return Err(InvalidSelector::MissingValues {
                        key: self.key.clone(),
                        operator: self.operator,
                    });
                }
            }
            Operator::Exists | Operator::DoesNotExist => {
                if self.values.as_ref().is_some_and(|vs| !vs.is_empty()) {
                    return Err(InvalidSelector::UnexpectedValues {
                        key: self.key.clone(),
                        operator: self.operator,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "foo".into(),
                    operator: Operator::In,
                    values: Some(Some("bar".to_string()).into_iter().collect()),
                })),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "In expression match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "foo".into(),
                    operator: Operator::NotIn,
                    values: Some(Some("quux".to_string()).into_iter().collect()),
                })),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "NotIn expression match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "foo".into(),
                    operator: Operator::NotIn,
                    values: Some(Some("bar".to_string()).into_iter().collect()),
                })),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                false,
                "NotIn expression non-match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "foo".into(),
                    operator: Operator::Exists,
                    values: None,
                })),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "Exists expression match",
            ),
            (
                Selector::new(
                    Map::from([("foo".to_string(), "bar".to_string())]),
                    vec![Expression {
                        key: "bah".into(),
                        operator: Operator::In,
                        values: Some(Some("bar".to_string()).into_iter().collect()),
                    }],
                ),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                false,
                "matches labels but not expressions",
            ),
            (
                Selector::new(
                    Map::from([("foo".to_string(), "bar".to_string())]),
                    vec![Expression {
                        key: "bah".into(),
                        operator: Operator::In,
                        values: Some(Some("bar".to_string()).into_iter().collect()),
                    }],
                ),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "bar")]),
                true,
                "matches both labels and expressions",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn empty_selector_selects_all() {
        assert!(Selector::default().selects_all());
        assert!(Selector::default().matches(&Labels::from_iter(Some(("any", "labels")))));
    }

    #[test]
    fn validate_rejects_in_without_values() {
        let selector = Selector::from_iter(Some(Expression {
            key: "foo".into(),
            operator: Operator::In,
            values: None,
        }));
        assert_eq!(
            selector.validate(),
            Err(InvalidSelector::MissingValues {
                key: "foo".into(),
                operator: Operator::In,
            }),
        );
    }

    #[test]
    fn validate_rejects_exists_with_values() {
        let selector = Selector::from_iter(Some(Expression {
            key: "foo".into(),
            operator: Operator::Exists,
            values: Some(Some("bar".to_string()).into_iter().collect()),
        }));
        assert_eq!(
            selector.validate(),
            Err(InvalidSelector::UnexpectedValues {
                key: "foo".into(),
                operator: Operator::Exists,
            }),
        );
    }

    #[test]
    fn validate_accepts_well_formed() {
        let selector = Selector::new(
            Map::from([("app".to_string(), "web".to_string())]),
            vec![Expression {
                key: "tier".into(),
                operator: Operator::NotIn,
                values: Some(Some("canary".to_string()).into_iter().collect()),
            }],
        );
        assert_eq!(selector.validate(), Ok(()));
    }
}
