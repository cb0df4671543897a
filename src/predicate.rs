//! Filter and query predicates.
//!
//! Endpoints carry a filter list applied to inbound message bodies, and
//! map operations carry endpoint/component queries evaluated against
//! remote manifests. Both use the same small predicate language: a JSON
//! array of `field op literal` strings, e.g. `["value > 10"]` or
//! `["ep_name = 'ep_sink'"]`. An empty or one-character query string
//! normalises to the match-all empty list.

use serde_json::Value;

use crate::error::{Error, Result};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Literal a field is compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

/// A single `field op literal` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: Op,
    pub literal: Literal,
    source: String,
}

impl Predicate {
    /// Parses an expression such as `value > 10` or `ep_name = 'ep_sink'`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when no operator is present or
    /// either side is empty.
    pub fn parse(expr: &str) -> Result<Self> {
        // Two-character operators first so `<=` is not read as `<`.
        const OPS: [(&str, Op); 6] = [
            ("<=", Op::Le),
            (">=", Op::Ge),
            ("!=", Op::Ne),
            ("=", Op::Eq),
            ("<", Op::Lt),
            (">", Op::Gt),
        ];
        for (token, op) in OPS {
            if let Some(pos) = expr.find(token) {
                let field = expr[..pos].trim();
                let raw = expr[pos + token.len()..].trim();
                if field.is_empty() || raw.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "predicate '{expr}' is missing a field or literal"
                    )));
                }
                return Ok(Self {
                    field: field.to_string(),
                    op,
                    literal: parse_literal(raw),
                    source: expr.to_string(),
                });
            }
        }
        Err(Error::InvalidArgument(format!(
            "predicate '{expr}' has no comparison operator"
        )))
    }

    /// Evaluates the predicate against a JSON object. Missing fields and
    /// type mismatches fail the match.
    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        let Some(field) = body.get(&self.field) else {
            return false;
        };
        match &self.literal {
            Literal::Number(rhs) => field
                .as_f64()
                .is_some_and(|lhs| compare(self.op, lhs.partial_cmp(rhs))),
            Literal::Text(rhs) => field
                .as_str()
                .is_some_and(|lhs| compare(self.op, lhs.partial_cmp(rhs.as_str()))),
        }
    }

    /// The expression this predicate was parsed from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn compare(op: Op, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        Op::Eq => ordering == Equal,
        Op::Ne => ordering != Equal,
        Op::Lt => ordering == Less,
        Op::Le => ordering != Greater,
        Op::Gt => ordering == Greater,
        Op::Ge => ordering != Less,
    }
}

fn parse_literal(raw: &str) -> Literal {
    let quoted = (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2);
    if quoted {
        return Literal::Text(raw[1..raw.len() - 1].to_string());
    }
    raw.parse::<f64>()
        .map_or_else(|_| Literal::Text(raw.to_string()), Literal::Number)
}

/// Parses a query: a JSON array of predicate strings. Empty or
/// one-character queries mean "match all".
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] when the text is neither empty nor
/// a JSON array of parseable predicate strings.
pub fn parse_query(query: &str) -> Result<Vec<Predicate>> {
    let trimmed = query.trim();
    if trimmed.len() <= 1 || trimmed == "[]" {
        return Ok(Vec::new());
    }
    let items: Vec<String> = serde_json::from_str(trimmed)
        .map_err(|e| Error::InvalidArgument(format!("query is not a JSON string array: {e}")))?;
    items.iter().map(|expr| Predicate::parse(expr)).collect()
}

/// True when every predicate matches (the empty list matches anything).
#[must_use]
pub fn matches_all(predicates: &[Predicate], body: &Value) -> bool {
    predicates.iter().all(|p| p.matches(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison() {
        let p = Predicate::parse("value > 10").unwrap();
        assert!(!p.matches(&json!({"value": 1})));
        assert!(p.matches(&json!({"value": 15})));
        assert!(p.matches(&json!({"value": 100})));
        assert!(!p.matches(&json!({"value": 10})));
    }

    #[test]
    fn string_equality_with_quotes() {
        let p = Predicate::parse("ep_name = 'ep_sink'").unwrap();
        assert!(p.matches(&json!({"ep_name": "ep_sink"})));
        assert!(!p.matches(&json!({"ep_name": "ep_source"})));
    }

    #[test]
    fn missing_field_fails_the_match() {
        let p = Predicate::parse("value > 0").unwrap();
        assert!(!p.matches(&json!({"other": 3})));
        assert!(!p.matches(&json!(null)));
    }

    #[test]
    fn type_mismatch_fails_the_match() {
        let p = Predicate::parse("value > 0").unwrap();
        assert!(!p.matches(&json!({"value": "three"})));
    }

    #[test]
    fn two_character_operators() {
        assert!(Predicate::parse("v <= 3").unwrap().matches(&json!({"v": 3})));
        assert!(Predicate::parse("v >= 3").unwrap().matches(&json!({"v": 3})));
        assert!(Predicate::parse("v != 3").unwrap().matches(&json!({"v": 4})));
    }

    #[test]
    fn empty_queries_normalise_to_match_all() {
        assert!(parse_query("").unwrap().is_empty());
        assert!(parse_query(" ").unwrap().is_empty());
        assert!(parse_query("x").unwrap().is_empty());
        assert!(parse_query("[]").unwrap().is_empty());
    }

    #[test]
    fn query_arrays_parse_each_predicate() {
        let preds = parse_query(r#"["value > 10", "date = 'today'"]"#).unwrap();
        assert_eq!(preds.len(), 2);
        assert!(matches_all(&preds, &json!({"value": 11, "date": "today"})));
        assert!(!matches_all(&preds, &json!({"value": 11, "date": "now"})));
    }

    #[test]
    fn malformed_queries_are_rejected() {
        assert!(parse_query("[1, 2]").is_err());
        assert!(parse_query(r#"["no operator here"]"#).is_err());
    }

    #[test]
    fn empty_list_matches_anything() {
        assert!(matches_all(&[], &json!({"anything": true})));
    }
}
