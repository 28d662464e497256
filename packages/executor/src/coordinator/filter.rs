//! Row filters in the coordinator's query syntax.
//!
//! The coordinator speaks a PostgREST-style filter grammar
//! (`?field=eq.value`, `?field=in.(a,b)`, `?field=is.null`). Filters are
//! also evaluated locally by the in-memory coordinator used in tests, so
//! both representations live here.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `field = value`
    Eq(&'static str, String),
    /// `field IN (values...)`
    In(&'static str, Vec<String>),
    /// `field IS NULL`
    IsNull(&'static str),
}

impl Filter {
    pub fn eq(field: &'static str, value: impl ToString) -> Self {
        Filter::Eq(field, value.to_string())
    }

    pub fn any<T: ToString>(field: &'static str, values: impl IntoIterator<Item = T>) -> Self {
        Filter::In(field, values.into_iter().map(|v| v.to_string()).collect())
    }

    pub fn is_null(field: &'static str) -> Self {
        Filter::IsNull(field)
    }

    /// Render as a query-string pair.
    pub fn to_query_pair(&self) -> (String, String) {
        match self {
            Filter::Eq(field, value) => ((*field).to_string(), format!("eq.{value}")),
            Filter::In(field, values) => {
                ((*field).to_string(), format!("in.({})", values.join(",")))
            }
            Filter::IsNull(field) => ((*field).to_string(), "is.null".to_string()),
        }
    }

    /// Evaluate against a JSON row (used by the in-memory coordinator).
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => field_as_string(row, field).as_deref() == Some(value),
            Filter::In(field, values) => match field_as_string(row, field) {
                Some(v) => values.iter().any(|candidate| candidate == &v),
                None => false,
            },
            Filter::IsNull(field) => field_as_string(row, field).is_none(),
        }
    }
}

/// Stringify a row field the way the query grammar compares it.
/// Missing fields and JSON nulls are both "null" for filtering purposes.
fn field_as_string(row: &Value, field: &str) -> Option<String> {
    match row.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_pairs() {
        assert_eq!(
            Filter::eq("status", "pending").to_query_pair(),
            ("status".to_string(), "eq.pending".to_string())
        );
        assert_eq!(
            Filter::any("status", ["pending", "running"]).to_query_pair(),
            ("status".to_string(), "in.(pending,running)".to_string())
        );
        assert_eq!(
            Filter::is_null("resolved_at").to_query_pair(),
            ("resolved_at".to_string(), "is.null".to_string())
        );
    }

    #[test]
    fn test_matches_eq_across_types() {
        let row = json!({"status": "pending", "attempts": 3, "enabled": true});
        assert!(Filter::eq("status", "pending").matches(&row));
        assert!(Filter::eq("attempts", 3).matches(&row));
        assert!(Filter::eq("enabled", true).matches(&row));
        assert!(!Filter::eq("status", "running").matches(&row));
    }

    #[test]
    fn test_matches_in() {
        let row = json!({"status": "running"});
        assert!(Filter::any("status", ["pending", "running"]).matches(&row));
        assert!(!Filter::any("status", ["pending"]).matches(&row));
    }

    #[test]
    fn test_matches_is_null_for_missing_and_null() {
        assert!(Filter::is_null("resolved_at").matches(&json!({})));
        assert!(Filter::is_null("resolved_at").matches(&json!({"resolved_at": null})));
        assert!(!Filter::is_null("resolved_at").matches(&json!({"resolved_at": "2024-01-01"})));
    }
}
