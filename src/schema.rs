//! Column type inference.
//!
//! Every observed value gets an atomic type, and a column's type is the join of all of them in
//! the lattice
//!
//! ```text
//!               STRING
//!              /      \
//!          FLOAT    TIMESTAMP
//!            |          |
//!         INTEGER       |
//!            |          |
//!         BOOLEAN       |
//!              \      /
//!                NULL
//! ```
//!
//! The join is a least upper bound, so it is commutative, associative and idempotent with NULL
//! as identity: the final type does not depend on record arrival order.

use ahash::AHashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferredType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Timestamp,
}

impl InferredType {
    /// Height on the numeric chain; TIMESTAMP sits beside it.
    fn rank(self) -> u8 {
        match self {
            InferredType::Null => 0,
            InferredType::Boolean => 1,
            InferredType::Integer => 2,
            InferredType::Float => 3,
            InferredType::Timestamp => 3,
            InferredType::String => 4,
        }
    }

    /// Least upper bound of `self` and `other`.
    pub fn join(self, other: InferredType) -> InferredType {
        use InferredType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, x) | (x, Null) => x,
            (Timestamp, _) | (_, Timestamp) => String,
            (a, b) => if a.rank() >= b.rank() { a } else { b },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InferredType::Null => "NULL",
            InferredType::Boolean => "BOOLEAN",
            InferredType::Integer => "INTEGER",
            InferredType::Float => "FLOAT",
            InferredType::String => "STRING",
            InferredType::Timestamp => "TIMESTAMP",
        }
    }
}

impl std::fmt::Display for InferredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // no leading zeros: "007" is an identifier, not a number
    RE.get_or_init(|| Regex::new(r"^-?(0|[1-9][0-9]*)$").expect("static regex"))
}

fn float_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+([eE][-+]?[0-9]+)?|[eE][-+]?[0-9]+)$").expect("static regex")
    })
}

/// Recognized date/time literals: RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.f]`.
pub fn is_timestamp_literal(s: &str) -> bool {
    let s = s.trim();
    if s.len() < 10 || !s.as_bytes()[0].is_ascii_digit() {
        return false;
    }
    OffsetDateTime::parse(s, &Rfc3339).is_ok()
        || Date::parse(s, format_description!("[year]-[month]-[day]")).is_ok()
        || PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]")).is_ok()
        || PrimitiveDateTime::parse(
            s,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        )
        .is_ok()
}

/// Atomic type of a string by its literal form.
pub fn literal_type(s: &str) -> InferredType {
    let t = s.trim();
    if t.is_empty() {
        InferredType::Null
    } else if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false") {
        InferredType::Boolean
    } else if integer_re().is_match(t) {
        if t.parse::<i64>().is_ok() { InferredType::Integer } else { InferredType::String }
    } else if float_re().is_match(t) {
        // out-of-range exponents parse to infinity, which JSON cannot carry
        if t.parse::<f64>().is_ok_and(f64::is_finite) { InferredType::Float } else { InferredType::String }
    } else if is_timestamp_literal(t) {
        InferredType::Timestamp
    } else {
        InferredType::String
    }
}

/// Atomic type of one observed value. Objects and arrays are opaque.
pub fn infer_value_type(v: &Value) -> InferredType {
    match v {
        Value::Null => InferredType::Null,
        Value::Bool(_) => InferredType::Boolean,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() { InferredType::Integer } else { InferredType::Float }
        }
        Value::String(s) => literal_type(s),
        Value::Array(_) | Value::Object(_) => InferredType::String,
    }
}

/// Insertion-ordered column → type mapping for one table. Columns are never removed.
#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    columns: Vec<(String, InferredType)>,
    index: AHashMap<String, usize>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column index, creating the column (typed NULL) if it is new.
    pub fn ensure_column(&mut self, column: &str) -> usize {
        if let Some(&i) = self.index.get(column) {
            return i;
        }
        let i = self.columns.len();
        self.columns.push((column.to_string(), InferredType::Null));
        self.index.insert(column.to_string(), i);
        i
    }

    /// Widen `column` by `value`; returns the column's type afterwards.
    pub fn observe(&mut self, column: &str, value: &Value) -> InferredType {
        let i = self.ensure_column(column);
        let slot = &mut self.columns[i].1;
        *slot = slot.join(infer_value_type(value));
        *slot
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn type_of(&self, column: &str) -> Option<InferredType> {
        self.index_of(column).map(|i| self.columns[i].1)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[(String, InferredType)] {
        &self.columns
    }
}

/// Convert a raw cell to the representation of its column's final type.
pub fn coerce(value: &Value, ty: InferredType) -> Value {
    if is_null_like(value) {
        return Value::Null;
    }
    match ty {
        InferredType::Null => Value::Null,
        InferredType::String | InferredType::Timestamp => match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        InferredType::Boolean => match value {
            Value::String(s) => Value::Bool(s.trim().eq_ignore_ascii_case("true")),
            other => other.clone(),
        },
        InferredType::Integer => match value {
            Value::Bool(b) => Value::from(i64::from(*b)),
            Value::String(s) => {
                let t = s.trim();
                if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false") {
                    Value::from(i64::from(t.eq_ignore_ascii_case("true")))
                } else {
                    t.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(s.clone()))
                }
            }
            other => other.clone(),
        },
        InferredType::Float => {
            let f = match value {
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Number(n) => n.as_f64(),
                Value::String(s) => {
                    let t = s.trim();
                    if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false") {
                        Some(if t.eq_ignore_ascii_case("true") { 1.0 } else { 0.0 })
                    } else {
                        t.parse::<f64>().ok()
                    }
                }
                _ => None,
            };
            match f.and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => value.clone(),
            }
        }
    }
}

fn is_null_like(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
