//! Stateless query evaluation.
//!
//! A [`Query`] is filters, an optional sort, and an optional limit, evaluated
//! over a point-in-time snapshot of stored documents. Bodies are parsed as
//! JSON objects; documents that do not parse are skipped, and filter values
//! that cannot be compared against a field simply never match. Evaluation
//! never mutates anything.

use crate::types::Document;
use serde_json::Value;
use std::cmp::Ordering;

/// Filter comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    /// Exact JSON value equality.
    Eq,
    /// Greater than: numeric when both sides are numbers, lexicographic when
    /// both are strings.
    Gt,
    /// Less than, same comparison rules as `Gt`.
    Lt,
    /// Substring on strings, membership on arrays.
    Contains,
}

/// One field predicate. All filters in a query are ANDed.
#[derive(Clone, Debug)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// A structured query: filters, optional sort, optional limit.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub filters: Vec<QueryFilter>,
    pub sort_by: Option<String>,
    pub sort_ascending: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self {
            sort_ascending: true,
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(QueryFilter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort_by = Some(field.into());
        self.sort_ascending = ascending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Evaluate a query over a snapshot, returning matching document bodies.
///
/// Tombstoned and unparseable documents are skipped. When sorting, documents
/// missing the sort field (or with an incomparable value) order after those
/// that have it, regardless of direction.
pub fn evaluate(query: &Query, snapshot: &[Document]) -> Vec<Vec<u8>> {
    let mut matched: Vec<(Value, &Document)> = snapshot
        .iter()
        .filter(|doc| doc.is_visible())
        .filter_map(|doc| {
            let parsed: Value = serde_json::from_slice(&doc.body).ok()?;
            parsed.is_object().then_some((parsed, doc))
        })
        .filter(|(parsed, _)| query.filters.iter().all(|f| matches_filter(parsed, f)))
        .collect();

    if let Some(sort_field) = &query.sort_by {
        matched.sort_by(|(a, _), (b, _)| {
            let ordering = match (a.get(sort_field), b.get(sort_field)) {
                (Some(a), Some(b)) => {
                    let cmp = compare_values(a, b).unwrap_or(Ordering::Equal);
                    if query.sort_ascending {
                        cmp
                    } else {
                        cmp.reverse()
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            ordering
        });
    }

    if let Some(limit) = query.limit {
        matched.truncate(limit);
    }

    matched.into_iter().map(|(_, doc)| doc.body.clone()).collect()
}

fn matches_filter(parsed: &Value, filter: &QueryFilter) -> bool {
    let Some(field_value) = parsed.get(&filter.field) else {
        return false;
    };

    match filter.op {
        FilterOp::Eq => field_value == &filter.value,
        FilterOp::Gt => {
            compare_values(field_value, &filter.value) == Some(Ordering::Greater)
        }
        FilterOp::Lt => compare_values(field_value, &filter.value) == Some(Ordering::Less),
        FilterOp::Contains => contains(field_value, &filter.value),
    }
}

/// Compare two JSON values when a meaningful order exists.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| item == needle),
        _ => false,
    }
}
