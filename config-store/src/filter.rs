//! Translation of caller-supplied filter expressions into backend predicates.
//!
//! Filters reference paths inside a config payload. Compilation prefixes
//! every path with the payload field of the stored document and infers the
//! type of each constant, rejecting anything ambiguous instead of coercing.

use crate::document::CONFIG_FIELD;
use crate::predicate::{CompareOp, Constant, Predicate};
use crate::value::ValueKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("unknown logical operator while building filter")]
    UnknownLogicalOperator,
    #[error("unknown relational operator while building filter")]
    UnknownRelationalOperator,
    #[error("filter path is empty")]
    EmptyPath,
    #[error("list constant for `{path}` is empty")]
    EmptyList { path: String },
    #[error("list constant for `{path}` mixes {first} and {other} elements")]
    MixedList {
        path: String,
        first: &'static str,
        other: &'static str,
    },
    #[error("unsupported {kind} constant for `{path}`")]
    UnsupportedConstant { path: String, kind: &'static str },
    #[error("operator {operator:?} on `{path}` requires a {expected} constant")]
    OperatorMismatch {
        path: String,
        operator: RelationalOperator,
        expected: &'static str,
    },
    #[error("invalid filter expression: {0}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    Unspecified,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationalOperator {
    #[default]
    Unspecified,
    Eq,
    Neq,
    In,
    NotIn,
    Lt,
    Gt,
    Lte,
    Gte,
    Exists,
    NotExists,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalFilter {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub operands: Vec<FilterExpression>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationalFilter {
    /// Dotted path inside the config payload.
    pub path: String,
    #[serde(default)]
    pub operator: RelationalOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpression {
    Logical(LogicalFilter),
    Relational(RelationalFilter),
}

impl FilterExpression {
    pub fn and(operands: Vec<FilterExpression>) -> Self {
        FilterExpression::Logical(LogicalFilter {
            operator: LogicalOperator::And,
            operands,
        })
    }

    pub fn or(operands: Vec<FilterExpression>) -> Self {
        FilterExpression::Logical(LogicalFilter {
            operator: LogicalOperator::Or,
            operands,
        })
    }

    pub fn relational<P: Into<String>>(
        path: P,
        operator: RelationalOperator,
        value: Value,
    ) -> Self {
        FilterExpression::Relational(RelationalFilter {
            path: path.into(),
            operator,
            value,
        })
    }

    /// Parses a filter from its JSON form, reporting malformed input as an
    /// invalid argument rather than a decode failure.
    pub fn from_json(json: &str) -> Result<Self, FilterError> {
        serde_json::from_str(json).map_err(|e| FilterError::Malformed(e.to_string()))
    }
}

/// Compiles a filter into a predicate over stored documents.
pub fn compile(filter: &FilterExpression) -> Result<Predicate, FilterError> {
    match filter {
        FilterExpression::Logical(logical) => compile_logical(logical),
        FilterExpression::Relational(relational) => compile_relational(relational),
    }
}

fn compile_logical(filter: &LogicalFilter) -> Result<Predicate, FilterError> {
    let operands = filter
        .operands
        .iter()
        .map(compile)
        .collect::<Result<Vec<_>, _>>()?;

    match filter.operator {
        LogicalOperator::And => Ok(Predicate::And(operands)),
        LogicalOperator::Or => Ok(Predicate::Or(operands)),
        LogicalOperator::Unspecified => Err(FilterError::UnknownLogicalOperator),
    }
}

fn compile_relational(filter: &RelationalFilter) -> Result<Predicate, FilterError> {
    if filter.path.is_empty() {
        return Err(FilterError::EmptyPath);
    }
    let field = config_field_path(&filter.path);

    let op = match filter.operator {
        RelationalOperator::Eq => CompareOp::Eq,
        RelationalOperator::Neq => CompareOp::Neq,
        RelationalOperator::In => CompareOp::In,
        RelationalOperator::NotIn => CompareOp::NotIn,
        RelationalOperator::Lt => CompareOp::Lt,
        RelationalOperator::Gt => CompareOp::Gt,
        RelationalOperator::Lte => CompareOp::Lte,
        RelationalOperator::Gte => CompareOp::Gte,
        RelationalOperator::Exists => return Ok(Predicate::Exists { field, exists: true }),
        RelationalOperator::NotExists => {
            return Ok(Predicate::Exists {
                field,
                exists: false,
            });
        }
        RelationalOperator::Unspecified => return Err(FilterError::UnknownRelationalOperator),
    };

    let constant = constant_from_value(&filter.path, &filter.value)?;
    check_operator(&filter.path, filter.operator, op, &constant)?;

    Ok(Predicate::Compare {
        field,
        op,
        constant,
    })
}

fn config_field_path(path: &str) -> String {
    format!("{CONFIG_FIELD}.{path}")
}

fn check_operator(
    path: &str,
    operator: RelationalOperator,
    op: CompareOp,
    constant: &Constant,
) -> Result<(), FilterError> {
    let is_list = matches!(
        constant,
        Constant::Strings(_) | Constant::Numbers(_) | Constant::Bools(_)
    );
    let mismatch = |expected| FilterError::OperatorMismatch {
        path: path.to_string(),
        operator,
        expected,
    };
    match op {
        CompareOp::In | CompareOp::NotIn if !is_list => Err(mismatch("list")),
        CompareOp::Lt | CompareOp::Gt | CompareOp::Lte | CompareOp::Gte if is_list => {
            Err(mismatch("scalar"))
        }
        _ => Ok(()),
    }
}

/// Infers the typed constant for a filter value.
fn constant_from_value(path: &str, value: &Value) -> Result<Constant, FilterError> {
    let unsupported = |kind: ValueKind| FilterError::UnsupportedConstant {
        path: path.to_string(),
        kind: kind.as_str(),
    };

    match value {
        Value::String(s) => Ok(Constant::String(s.clone())),
        Value::Number(n) => n
            .as_f64()
            .map(Constant::Number)
            .ok_or_else(|| unsupported(ValueKind::Number)),
        Value::Bool(b) => Ok(Constant::Bool(*b)),
        Value::Array(items) => list_constant(path, items),
        Value::Object(_) | Value::Null => Err(unsupported(ValueKind::of(value))),
    }
}

fn list_constant(path: &str, items: &[Value]) -> Result<Constant, FilterError> {
    let first = items.first().ok_or_else(|| FilterError::EmptyList {
        path: path.to_string(),
    })?;
    let kind = ValueKind::of(first);

    if let Some(other) = items.iter().map(ValueKind::of).find(|k| *k != kind) {
        return Err(FilterError::MixedList {
            path: path.to_string(),
            first: kind.as_str(),
            other: other.as_str(),
        });
    }

    match kind {
        ValueKind::String => Ok(Constant::Strings(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )),
        ValueKind::Number => Ok(Constant::Numbers(
            items.iter().filter_map(Value::as_f64).collect(),
        )),
        ValueKind::Bool => Ok(Constant::Bools(
            items.iter().filter_map(Value::as_bool).collect(),
        )),
        ValueKind::Null | ValueKind::List | ValueKind::Struct => {
            Err(FilterError::UnsupportedConstant {
                path: path.to_string(),
                kind: "nested list element",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ConfigDocument;
    use crate::types::ConfigResource;
    use serde_json::json;

    fn eq(path: &str, value: Value) -> FilterExpression {
        FilterExpression::relational(path, RelationalOperator::Eq, value)
    }

    fn document(config: Value) -> ConfigDocument {
        let key = ConfigResource::new("rules", "ns", "tenant").context("ctx");
        ConfigDocument::new(&key, 1, config, "user", "user@example.com", 0, 0)
    }

    #[test]
    fn test_and_of_eq() {
        let filter = FilterExpression::and(vec![eq("k1", json!(10)), eq("k2", json!("v2"))]);
        let predicate = compile(&filter).unwrap();

        assert_eq!(
            predicate,
            Predicate::And(vec![
                Predicate::eq("config.k1", 10.0),
                Predicate::eq("config.k2", "v2"),
            ])
        );
        assert!(predicate.matches(&document(json!({"k1": 10, "k2": "v2"}))));
        assert!(!predicate.matches(&document(json!({"k1": 10, "k2": "v3"}))));
    }

    #[test]
    fn test_in_list() {
        let filter = FilterExpression::relational("k", RelationalOperator::In, json!(["x", "y"]));
        let predicate = compile(&filter).unwrap();

        assert!(predicate.matches(&document(json!({"k": "x"}))));
        assert!(predicate.matches(&document(json!({"k": "y"}))));
        assert!(!predicate.matches(&document(json!({"k": "z"}))));
    }

    #[test]
    fn test_paths_stay_inside_config() {
        // `tenantId` is document metadata, the filter must not reach it.
        let predicate = compile(&eq("tenantId", json!("tenant"))).unwrap();
        assert!(!predicate.matches(&document(json!({}))));
        assert!(predicate.matches(&document(json!({"tenantId": "tenant"}))));
    }

    #[test]
    fn test_or_and_nested_paths() {
        let filter = FilterExpression::or(vec![
            eq("a.b", json!(true)),
            FilterExpression::relational("n", RelationalOperator::Gte, json!(3)),
        ]);
        let predicate = compile(&filter).unwrap();

        assert!(predicate.matches(&document(json!({"a": {"b": true}}))));
        assert!(predicate.matches(&document(json!({"n": 3}))));
        assert!(!predicate.matches(&document(json!({"a": {"b": false}, "n": 2}))));
    }

    #[test]
    fn test_exists() {
        let filter = FilterExpression::relational("a", RelationalOperator::Exists, Value::Null);
        let predicate = compile(&filter).unwrap();
        assert!(predicate.matches(&document(json!({"a": 0}))));
        assert!(!predicate.matches(&document(json!({"b": 0}))));

        let filter = FilterExpression::relational("a", RelationalOperator::NotExists, Value::Null);
        assert!(compile(&filter).unwrap().matches(&document(json!({"b": 0}))));
    }

    #[test]
    fn test_unspecified_operators() {
        let filter = FilterExpression::Logical(LogicalFilter {
            operator: LogicalOperator::Unspecified,
            operands: vec![eq("a", json!(1))],
        });
        assert_eq!(compile(&filter), Err(FilterError::UnknownLogicalOperator));

        let filter = FilterExpression::relational("a", RelationalOperator::Unspecified, json!(1));
        assert_eq!(compile(&filter), Err(FilterError::UnknownRelationalOperator));
    }

    #[test]
    fn test_invalid_constants() {
        let cases = [
            (RelationalOperator::In, json!([])),
            (RelationalOperator::In, json!(["a", 1])),
            (RelationalOperator::In, json!([{"a": 1}])),
            (RelationalOperator::In, json!("a")),
            (RelationalOperator::Eq, json!({"a": 1})),
            (RelationalOperator::Eq, Value::Null),
            (RelationalOperator::Lt, json!([1, 2])),
        ];
        for (operator, value) in cases {
            let filter = FilterExpression::relational("k", operator, value.clone());
            assert!(
                compile(&filter).is_err(),
                "expected {operator:?} with {value} to be rejected"
            );
        }
    }

    #[test]
    fn test_from_json() {
        let filter = FilterExpression::from_json(
            r#"{"logical": {"operator": "and", "operands": [
                {"relational": {"path": "k1", "operator": "eq", "value": 10}},
                {"relational": {"path": "k2", "operator": "not_in", "value": [1, 2]}}
            ]}}"#,
        )
        .unwrap();
        let predicate = compile(&filter).unwrap();
        assert!(predicate.matches(&document(json!({"k1": 10, "k2": 3}))));
        assert!(!predicate.matches(&document(json!({"k1": 10, "k2": 2}))));

        // Operators default to unspecified when omitted.
        let filter =
            FilterExpression::from_json(r#"{"relational": {"path": "k", "value": 1}}"#).unwrap();
        assert_eq!(compile(&filter), Err(FilterError::UnknownRelationalOperator));

        assert!(matches!(
            FilterExpression::from_json(r#"{"unknown": {}}"#),
            Err(FilterError::Malformed(_))
        ));
    }
}
