//! Query predicates understood by config backends.
//!
//! A predicate addresses documents by dotted field paths. Metadata fields
//! (`tenantId`, `context`, `configVersion`, ...) sit at the top level and the
//! config payload lives under `config.`, so filters built from user input can
//! never reach metadata.

use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Anything a predicate can be evaluated against.
pub trait FieldSource {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>>;
}

impl FieldSource for Value {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        crate::value::lookup(self, path).map(Cow::Borrowed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    In,
    NotIn,
    Lt,
    Gt,
    Lte,
    Gte,
}

/// A typed constant. Lists are homogeneous by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    String(String),
    Number(f64),
    Bool(bool),
    Strings(Vec<String>),
    Numbers(Vec<f64>),
    Bools(Vec<bool>),
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Constant::String(value.to_string())
    }
}

impl From<String> for Constant {
    fn from(value: String) -> Self {
        Constant::String(value)
    }
}

impl From<u64> for Constant {
    fn from(value: u64) -> Self {
        Constant::Number(value as f64)
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Constant::Number(value)
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Constant::Bool(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        field: String,
        op: CompareOp,
        constant: Constant,
    },
    Exists {
        field: String,
        exists: bool,
    },
}

impl Predicate {
    pub fn eq<F: Into<String>, C: Into<Constant>>(field: F, constant: C) -> Self {
        Predicate::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            constant: constant.into(),
        }
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        let mut operands = match self {
            Predicate::And(operands) => operands,
            predicate => vec![predicate],
        };
        match other {
            Predicate::And(more) => operands.extend(more),
            predicate => operands.push(predicate),
        }
        Predicate::And(operands)
    }

    pub fn matches<D: FieldSource + ?Sized>(&self, document: &D) -> bool {
        match self {
            Predicate::And(operands) => operands.iter().all(|p| p.matches(document)),
            Predicate::Or(operands) => operands.iter().any(|p| p.matches(document)),
            Predicate::Exists { field, exists } => {
                crate::value::is_set(document.field(field).as_deref()) == *exists
            }
            Predicate::Compare {
                field,
                op,
                constant,
            } => {
                let value = document.field(field);
                let value = value.as_deref().filter(|v| !v.is_null());
                compare(value, *op, constant)
            }
        }
    }
}

fn compare(value: Option<&Value>, op: CompareOp, constant: &Constant) -> bool {
    match op {
        CompareOp::Eq => value.is_some_and(|v| equals(v, constant)),
        CompareOp::Neq => !value.is_some_and(|v| equals(v, constant)),
        CompareOp::In => value.is_some_and(|v| contained_in(v, constant)),
        CompareOp::NotIn => !value.is_some_and(|v| contained_in(v, constant)),
        CompareOp::Lt => ordering(value, constant).is_some_and(|o| o == Ordering::Less),
        CompareOp::Gt => ordering(value, constant).is_some_and(|o| o == Ordering::Greater),
        CompareOp::Lte => ordering(value, constant).is_some_and(|o| o != Ordering::Greater),
        CompareOp::Gte => ordering(value, constant).is_some_and(|o| o != Ordering::Less),
    }
}

fn scalar_equals(value: &Value, constant: &Constant) -> bool {
    match (value, constant) {
        (Value::String(s), Constant::String(c)) => s == c,
        (Value::Number(n), Constant::Number(c)) => n.as_f64() == Some(*c),
        (Value::Bool(b), Constant::Bool(c)) => b == c,
        _ => false,
    }
}

// A list field equals a scalar constant when any element does, and equals a
// list constant when the elements match in order.
fn equals(value: &Value, constant: &Constant) -> bool {
    match (value, constant) {
        (Value::Array(items), Constant::Strings(c)) => {
            items.len() == c.len()
                && items.iter().zip(c).all(|(v, c)| v.as_str() == Some(c.as_str()))
        }
        (Value::Array(items), Constant::Numbers(c)) => {
            items.len() == c.len() && items.iter().zip(c).all(|(v, c)| v.as_f64() == Some(*c))
        }
        (Value::Array(items), Constant::Bools(c)) => {
            items.len() == c.len() && items.iter().zip(c).all(|(v, c)| v.as_bool() == Some(*c))
        }
        (Value::Array(items), _) => items.iter().any(|item| scalar_equals(item, constant)),
        _ => scalar_equals(value, constant),
    }
}

fn contained_in(value: &Value, constant: &Constant) -> bool {
    if let Value::Array(items) = value {
        return items.iter().any(|item| contained_in(item, constant));
    }
    match (value, constant) {
        (Value::String(s), Constant::Strings(c)) => c.iter().any(|c| c == s),
        (Value::Number(n), Constant::Numbers(c)) => {
            n.as_f64().is_some_and(|n| c.iter().any(|c| *c == n))
        }
        (Value::Bool(b), Constant::Bools(c)) => c.contains(b),
        _ => false,
    }
}

fn ordering(value: Option<&Value>, constant: &Constant) -> Option<Ordering> {
    match (value?, constant) {
        (Value::String(s), Constant::String(c)) => Some(s.as_str().cmp(c.as_str())),
        (Value::Number(n), Constant::Number(c)) => n.as_f64()?.partial_cmp(c),
        (Value::Bool(b), Constant::Bool(c)) => Some(b.cmp(c)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compare_predicate(field: &str, op: CompareOp, constant: Constant) -> Predicate {
        Predicate::Compare {
            field: field.to_string(),
            op,
            constant,
        }
    }

    #[test]
    fn test_eq_and_neq() {
        let doc = json!({"a": 10, "b": "x", "c": true});
        assert!(Predicate::eq("a", 10_u64).matches(&doc));
        assert!(Predicate::eq("a", 10.0).matches(&doc));
        assert!(Predicate::eq("b", "x").matches(&doc));
        assert!(!Predicate::eq("b", "y").matches(&doc));
        assert!(!Predicate::eq("a", "10").matches(&doc));
        assert!(compare_predicate("b", CompareOp::Neq, "y".into()).matches(&doc));
        // Missing fields never equal anything.
        assert!(!Predicate::eq("missing", "x").matches(&doc));
        assert!(compare_predicate("missing", CompareOp::Neq, "x".into()).matches(&doc));
    }

    #[test]
    fn test_array_fields() {
        let doc = json!({"tags": ["a", "b"]});
        assert!(Predicate::eq("tags", "a").matches(&doc));
        assert!(
            compare_predicate(
                "tags",
                CompareOp::Eq,
                Constant::Strings(vec!["a".into(), "b".into()])
            )
            .matches(&doc)
        );
        assert!(
            compare_predicate("tags", CompareOp::In, Constant::Strings(vec!["b".into()]))
                .matches(&doc)
        );
        assert!(
            compare_predicate("tags", CompareOp::NotIn, Constant::Strings(vec!["z".into()]))
                .matches(&doc)
        );
    }

    #[test]
    fn test_ordering() {
        let doc = json!({"n": 5, "s": "m"});
        assert!(compare_predicate("n", CompareOp::Lt, Constant::Number(6.0)).matches(&doc));
        assert!(compare_predicate("n", CompareOp::Lte, Constant::Number(5.0)).matches(&doc));
        assert!(!compare_predicate("n", CompareOp::Gt, Constant::Number(5.0)).matches(&doc));
        assert!(compare_predicate("n", CompareOp::Gte, Constant::Number(5.0)).matches(&doc));
        assert!(compare_predicate("s", CompareOp::Gt, "a".into()).matches(&doc));
        // Kind mismatch never orders.
        assert!(!compare_predicate("s", CompareOp::Lt, Constant::Number(1.0)).matches(&doc));
        assert!(!compare_predicate("s", CompareOp::Gte, Constant::Number(1.0)).matches(&doc));
    }

    #[test]
    fn test_exists() {
        let doc = json!({"a": 1, "b": null});
        let exists = |field: &str, exists: bool| Predicate::Exists {
            field: field.to_string(),
            exists,
        };
        assert!(exists("a", true).matches(&doc));
        assert!(exists("b", false).matches(&doc));
        assert!(exists("c", false).matches(&doc));
    }

    #[test]
    fn test_and_flattens() {
        let predicate = Predicate::eq("a", 1_u64)
            .and(Predicate::eq("b", 2_u64))
            .and(Predicate::eq("c", 3_u64));
        match &predicate {
            Predicate::And(operands) => assert_eq!(operands.len(), 3),
            other => panic!("unexpected predicate {other:?}"),
        }
        assert!(predicate.matches(&json!({"a": 1, "b": 2, "c": 3})));
        assert!(!predicate.matches(&json!({"a": 1, "b": 2, "c": 4})));
        assert!(Predicate::And(vec![]).matches(&json!({})));
        assert!(!Predicate::Or(vec![]).matches(&json!({})));
    }
}
