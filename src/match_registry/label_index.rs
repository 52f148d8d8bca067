//! Match label index (§4.F) — a small in-memory document store queryable
//! by exact field equality (including into arrays) and numeric range/boost
//! expressions, keyed by `"<match_id>.<node>"`.
//!
//! A hand-rolled query-string parser rather than `pest`/`sqlparser`: the
//! grammar this index needs (`+label.skill:>=50`, `label.baz:4^10`) is far
//! smaller than either crate is built for, and the teacher's own `query`
//! module (`rust-core/src/query/lql.rs`) is itself a thin, partially-
//! implemented MVP rather than a reason to reach for the heavier parser
//! stack.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// One indexed match: its searchable label plus the identity fields a
/// query result needs to hand back to the registry.
#[derive(Debug, Clone)]
pub struct LabelDocument {
    pub match_id: Uuid,
    pub node: String,
    pub label_string: String,
    pub label: serde_json::Map<String, Value>,
    pub authoritative: bool,
    pub tick_rate: u8,
    pub handler_name: String,
}

impl LabelDocument {
    pub fn key(&self) -> String {
        format!("{}.{}", self.match_id, self.node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone)]
enum QueryValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone)]
struct Clause {
    required: bool,
    field: String,
    op: Comparator,
    value: QueryValue,
    boost: f64,
}

/// A parsed query. `MatchAll`/`MatchQuery`/`DocId` are the distilled spec's
/// simple query kinds; `QueryString` is the boosted-expression form.
#[derive(Debug, Clone)]
pub enum LabelQuery {
    MatchAll,
    MatchQuery { field: String, text: String },
    QueryString(Vec<ClauseSpec>),
    DocId(String),
}

/// Public clause shape returned by [`parse_query_string`], consumed only by
/// [`LabelQuery::QueryString`] — kept separate from the internal [`Clause`]
/// so parsing can be unit-tested without exposing `Comparator`/`QueryValue`.
#[derive(Debug, Clone)]
pub struct ClauseSpec(Clause);

/// Parse a boosted query-string expression into clauses. Grammar per
/// clause: `[+]field:(op)value[^boost]`, where `field` is a dotted JSON
/// path (`label.skill`), `op` is one of `>= > <= < != =` (defaulting to
/// `=` when omitted), and `boost` defaults to `1.0`.
pub fn parse_query_string(expr: &str) -> Result<Vec<ClauseSpec>> {
    let mut clauses = Vec::new();
    for token in expr.split_whitespace() {
        clauses.push(ClauseSpec(parse_clause(token)?));
    }
    Ok(clauses)
}

fn parse_clause(token: &str) -> Result<Clause> {
    let (required, rest) = match token.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let (field, rhs) = rest
        .split_once(':')
        .ok_or_else(|| CoreError::Invalid(format!("malformed query clause: {token}")))?;
    if field.is_empty() {
        return Err(CoreError::Invalid(format!("malformed query clause: {token}")));
    }

    let (value_part, boost) = match rhs.rsplit_once('^') {
        Some((value_part, boost_str)) if boost_str.parse::<f64>().is_ok() => {
            (value_part, boost_str.parse::<f64>().unwrap())
        }
        _ => (rhs, 1.0),
    };

    let (op, value_str) = if let Some(v) = value_part.strip_prefix(">=") {
        (Comparator::Ge, v)
    } else if let Some(v) = value_part.strip_prefix("<=") {
        (Comparator::Le, v)
    } else if let Some(v) = value_part.strip_prefix("!=") {
        (Comparator::Ne, v)
    } else if let Some(v) = value_part.strip_prefix('>') {
        (Comparator::Gt, v)
    } else if let Some(v) = value_part.strip_prefix('<') {
        (Comparator::Lt, v)
    } else if let Some(v) = value_part.strip_prefix('=') {
        (Comparator::Eq, v)
    } else {
        (Comparator::Eq, value_part)
    };

    if value_str.is_empty() {
        return Err(CoreError::Invalid(format!("malformed query clause: {token}")));
    }

    let value = match value_str.parse::<f64>() {
        Ok(n) => QueryValue::Number(n),
        Err(_) => QueryValue::Text(value_str.to_string()),
    };

    Ok(Clause {
        required,
        field: field.to_string(),
        op,
        value,
        boost,
    })
}

fn field_value<'a>(label: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let stripped = path.strip_prefix("label.").unwrap_or(path);
    let mut segments = stripped.split('.');
    let mut current = label.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_matches(value: &Value, op: Comparator, want: &QueryValue) -> bool {
    if let Value::Array(items) = value {
        return items.iter().any(|item| value_matches(item, op, want));
    }
    match want {
        QueryValue::Number(want_n) => {
            let Some(got) = value.as_f64() else { return false };
            match op {
                Comparator::Eq => (got - want_n).abs() < f64::EPSILON,
                Comparator::Ne => (got - want_n).abs() >= f64::EPSILON,
                Comparator::Gt => got > *want_n,
                Comparator::Ge => got >= *want_n,
                Comparator::Lt => got < *want_n,
                Comparator::Le => got <= *want_n,
            }
        }
        QueryValue::Text(want_s) => {
            let got = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match op {
                Comparator::Eq => &got == want_s,
                Comparator::Ne => &got != want_s,
                _ => false,
            }
        }
    }
}

fn clause_matches(doc: &LabelDocument, clause: &Clause) -> bool {
    match field_value(&doc.label, &clause.field) {
        Some(v) => value_matches(v, clause.op, &clause.value),
        None => false,
    }
}

/// Score a document against a set of clauses. Required (`+`) clauses gate
/// inclusion (all must match); when no clause is required, inclusion needs
/// at least one optional clause to match, Elasticsearch-`should`-style.
/// Score is the sum of the boosts of every clause that matched.
fn score(doc: &LabelDocument, clauses: &[ClauseSpec]) -> Option<f64> {
    let required: Vec<&Clause> = clauses.iter().map(|c| &c.0).filter(|c| c.required).collect();
    if required.iter().any(|c| !clause_matches(doc, c)) {
        return None;
    }
    let mut total = 0.0;
    let mut any_optional_matched = false;
    for ClauseSpec(clause) in clauses {
        if clause_matches(doc, clause) {
            total += clause.boost;
            if !clause.required {
                any_optional_matched = true;
            }
        }
    }
    if required.is_empty() && !any_optional_matched {
        return None;
    }
    Some(total)
}

#[derive(Default)]
pub struct LabelIndex {
    docs: RwLock<HashMap<String, LabelDocument>>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, doc: LabelDocument) {
        self.docs.write().insert(doc.key(), doc);
    }

    pub fn remove(&self, match_id: Uuid, node: &str) {
        self.docs.write().remove(&format!("{match_id}.{node}"));
    }

    /// §4.F `UpdateMatchLabel`'s atomic apply step, invoked by the
    /// batcher task on the whole pending set at once.
    pub fn process_label_updates(&self, batch: Vec<LabelDocument>) {
        let mut docs = self.docs.write();
        for doc in batch {
            docs.insert(doc.key(), doc);
        }
    }

    pub fn get(&self, match_id: Uuid, node: &str) -> Option<LabelDocument> {
        self.docs.read().get(&format!("{match_id}.{node}")).cloned()
    }

    /// Run a query over every indexed document, returning matches sorted
    /// by descending score (ties broken by insertion order, i.e. stable).
    pub fn query(&self, query: &LabelQuery) -> Vec<LabelDocument> {
        let docs = self.docs.read();
        let mut results: Vec<(f64, LabelDocument)> = match query {
            LabelQuery::MatchAll => docs.values().cloned().map(|d| (1.0, d)).collect(),
            LabelQuery::DocId(key) => docs.get(key).cloned().into_iter().map(|d| (1.0, d)).collect(),
            LabelQuery::MatchQuery { field, text } => docs
                .values()
                .filter(|d| {
                    field_value(&d.label, field)
                        .map(|v| value_matches(v, Comparator::Eq, &QueryValue::Text(text.clone())))
                        .unwrap_or(false)
                })
                .cloned()
                .map(|d| (1.0, d))
                .collect(),
            LabelQuery::QueryString(clauses) => docs
                .values()
                .filter_map(|d| score(d, clauses).map(|s| (s, d.clone())))
                .collect(),
        };
        results.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        results.into_iter().map(|(_, d)| d).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(match_id: Uuid, label: serde_json::Value) -> LabelDocument {
        LabelDocument {
            match_id,
            node: "node1".to_string(),
            label_string: label.to_string(),
            label: label.as_object().cloned().unwrap_or_default(),
            authoritative: true,
            tick_rate: 10,
            handler_name: "lobby".to_string(),
        }
    }

    #[test]
    fn match_all_returns_every_document() {
        let index = LabelIndex::new();
        index.upsert(doc(Uuid::new_v4(), json!({"mode": "ffa"})));
        index.upsert(doc(Uuid::new_v4(), json!({"mode": "duel"})));
        assert_eq!(index.query(&LabelQuery::MatchAll).len(), 2);
    }

    #[test]
    fn array_field_matches_any_element() {
        let index = LabelIndex::new();
        let id = Uuid::new_v4();
        index.upsert(doc(id, json!({"regions": ["eu", "na"]})));
        let clauses = parse_query_string("+label.regions:na").unwrap();
        let results = index.query(&LabelQuery::QueryString(clauses));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].match_id, id);
    }

    #[test]
    fn boosted_range_expression_orders_by_score() {
        let index = LabelIndex::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        index.upsert(doc(low, json!({"skill": 40, "baz": 1})));
        index.upsert(doc(high, json!({"skill": 80, "baz": 4})));
        let clauses = parse_query_string("+label.skill:>=50 label.baz:4^10").unwrap();
        let results = index.query(&LabelQuery::QueryString(clauses));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].match_id, high);
    }

    #[test]
    fn required_clause_excludes_non_matching_documents() {
        let index = LabelIndex::new();
        index.upsert(doc(Uuid::new_v4(), json!({"skill": 10})));
        let clauses = parse_query_string("+label.skill:>=50").unwrap();
        assert!(index.query(&LabelQuery::QueryString(clauses)).is_empty());
    }

    #[test]
    fn malformed_clause_is_rejected() {
        assert!(parse_query_string("not-a-clause").is_err());
    }
}
