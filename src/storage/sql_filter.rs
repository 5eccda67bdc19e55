//! Filter → SQL translation.
//!
//! Translates a [`Filter`] into a parameterized WHERE clause over the
//! `events` table (aliased `e`). Tag constraints become `EXISTS` subqueries
//! against `event_tags`.
//!
//! # SQL Generated
//!
//! ```sql
//! e.id IN (?, ?)                                         -- ids
//! e.pubkey IN (?)                                        -- authors
//! e.kind IN (?, ?)                                       -- kinds
//! e.created_at >= ? AND e.created_at <= ?                -- since / until
//! EXISTS (SELECT 1 FROM event_tags t
//!         WHERE t.event_id = e.id AND t.name = ? AND t.value IN (?))  -- #e, #p, ...
//! ```

use crate::filter::Filter;

/// SQL query result with parameterized placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    /// The WHERE clause (without "WHERE" keyword)
    pub clause: String,
    /// The parameter values in order
    pub params: Vec<SqlParam>,
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

/// Translate one filter. An unconstrained filter yields `1=1`.
#[must_use]
pub fn translate(filter: &Filter) -> SqlQuery {
    let mut parts = Vec::new();
    let mut params = Vec::new();

    if !filter.ids.is_empty() {
        parts.push(format!("e.id IN ({})", placeholders(filter.ids.len())));
        params.extend(filter.ids.iter().map(|id| SqlParam::Text(id.to_hex())));
    }
    if !filter.authors.is_empty() {
        parts.push(format!("e.pubkey IN ({})", placeholders(filter.authors.len())));
        params.extend(filter.authors.iter().cloned().map(SqlParam::Text));
    }
    if !filter.kinds.is_empty() {
        parts.push(format!("e.kind IN ({})", placeholders(filter.kinds.len())));
        params.extend(filter.kinds.iter().map(|k| SqlParam::Int(i64::from(*k))));
    }
    if let Some(since) = filter.since {
        parts.push("e.created_at >= ?".to_string());
        params.push(SqlParam::Int(since));
    }
    if let Some(until) = filter.until {
        parts.push("e.created_at <= ?".to_string());
        params.push(SqlParam::Int(until));
    }
    for (name, values) in filter.tag_constraints() {
        if values.is_empty() {
            continue;
        }
        parts.push(format!(
            "EXISTS (SELECT 1 FROM event_tags t WHERE t.event_id = e.id AND t.name = ? AND t.value IN ({}))",
            placeholders(values.len())
        ));
        params.push(SqlParam::Text(name.to_string()));
        params.extend(values.iter().cloned().map(SqlParam::Text));
    }

    let clause = if parts.is_empty() {
        "1=1".to_string()
    } else {
        parts.join(" AND ")
    };
    SqlQuery { clause, params }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;

    #[test]
    fn test_empty_filter_matches_everything() {
        let q = translate(&Filter::all());
        assert_eq!(q.clause, "1=1");
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_time_window() {
        let q = translate(&Filter::all().since(10).until(20));
        assert_eq!(q.clause, "e.created_at >= ? AND e.created_at <= ?");
        assert_eq!(q.params, vec![SqlParam::Int(10), SqlParam::Int(20)]);
    }

    #[test]
    fn test_ids_are_hex_params() {
        let id = EventId::from_bytes([0xab; 32]);
        let q = translate(&Filter::ids([id]));
        assert_eq!(q.clause, "e.id IN (?)");
        assert_eq!(q.params, vec![SqlParam::Text("ab".repeat(32))]);
    }

    #[test]
    fn test_authors_and_kinds() {
        let q = translate(&Filter::all().authors(["a".into(), "b".into()]).kinds([1, 7]));
        assert_eq!(q.clause, "e.pubkey IN (?, ?) AND e.kind IN (?, ?)");
        assert_eq!(q.params.len(), 4);
    }

    #[test]
    fn test_tag_constraint_uses_exists() {
        let q = translate(&Filter::all().tag('e', ["x".into(), "y".into()]));
        assert!(q.clause.starts_with("EXISTS (SELECT 1 FROM event_tags t"));
        assert!(q.clause.ends_with("t.value IN (?, ?))"));
        assert_eq!(
            q.params,
            vec![
                SqlParam::Text("e".into()),
                SqlParam::Text("x".into()),
                SqlParam::Text("y".into()),
            ]
        );
    }

    #[test]
    fn test_empty_tag_values_do_not_constrain() {
        let q = translate(&Filter::all().tag('p', Vec::<String>::new()));
        assert_eq!(q.clause, "1=1");
    }
}
