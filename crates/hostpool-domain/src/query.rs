use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Comparison operators permitted in query leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "$eq")]
    Eq,
    #[serde(rename = "$in")]
    In,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$lte")]
    Lte,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$gte")]
    Gte,
}

impl Op {
    /// Parse the request-side suffix spelling (`cpu-arch:eq`, `lifespan:gte`).
    pub fn from_suffix(s: &str) -> Option<Op> {
        match s.trim_start_matches('$') {
            "eq" => Some(Op::Eq),
            "in" => Some(Op::In),
            "lt" => Some(Op::Lt),
            "lte" => Some(Op::Lte),
            "gt" => Some(Op::Gt),
            "gte" => Some(Op::Gte),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::In => "in",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::Gt => "gt",
            Op::Gte => "gte",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.suffix())
    }
}

/// One query leaf: either a bare value or a set of operator comparisons.
///
/// Untagged: an object whose keys are `$`-operators parses as `Ops`,
/// anything else falls through to `Value` (including nested plain maps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Term {
    Ops(BTreeMap<Op, Value>),
    Value(Value),
}

impl Term {
    pub fn eq(value: impl Into<Value>) -> Term {
        let mut ops = BTreeMap::new();
        ops.insert(Op::Eq, value.into());
        Term::Ops(ops)
    }

    pub fn op(op: Op, value: impl Into<Value>) -> Term {
        let mut ops = BTreeMap::new();
        ops.insert(op, value.into());
        Term::Ops(ops)
    }

    /// The bare value, flattening a lone `$eq`.
    pub fn as_plain(&self) -> Option<&Value> {
        match self {
            Term::Value(v) => Some(v),
            Term::Ops(ops) if ops.len() == 1 => ops.get(&Op::Eq),
            _ => None,
        }
    }
}

impl From<Value> for Term {
    fn from(v: Value) -> Self {
        Term::Value(v)
    }
}

/// A sanitised (or still raw) machine query: field path → comparison term.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query(pub BTreeMap<String, Term>);

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    pub fn get(&self, field: &str) -> Option<&Term> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, term: impl Into<Term>) {
        self.0.insert(field.into(), term.into());
    }

    /// Insert only when the field is absent, mirroring request defaults.
    pub fn insert_default(&mut self, field: &str, term: impl Into<Term>) {
        self.0.entry(field.to_string()).or_insert_with(|| term.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Term> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Term)> {
        self.0.iter()
    }

    /// The plain value of a field, flattening a lone `$eq`.
    pub fn plain(&self, field: &str) -> Option<&Value> {
        self.get(field).and_then(Term::as_plain)
    }

    pub fn plain_str(&self, field: &str) -> Option<&str> {
        self.plain(field).and_then(Value::as_str)
    }

    pub fn plain_i64(&self, field: &str) -> Option<i64> {
        self.plain(field).and_then(Value::as_i64)
    }

    /// Field-wise merge; terms from `other` win on collision.
    pub fn merge(&mut self, other: Query) {
        for (field, term) in other.0 {
            self.0.insert(field, term);
        }
    }
}

impl FromIterator<(String, Term)> for Query {
    fn from_iter<T: IntoIterator<Item = (String, Term)>>(iter: T) -> Self {
        Query(iter.into_iter().collect())
    }
}
