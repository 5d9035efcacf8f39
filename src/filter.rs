//! Declarative predicate filter over instrument snapshots.
//!
//! The wire format is a recursive `{ operator: [operand, ...] }` tree with
//! `{"var": "fieldName"}` leaves. Parsing happens once at subscribe time so
//! a malformed tree is rejected at the request boundary; evaluation is pure
//! and three-state (true, false, or error), with errors collapsed to
//! "does not match" at the dispatch gate. An evaluation error is logged and
//! never escapes.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::instruments::{FieldMap, FieldValue};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("malformed predicate: {0}")]
    Malformed(String),
    #[error("unsupported operator '{0}'")]
    UnknownOperator(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("type mismatch: cannot compare {0} with {1}")]
    TypeMismatch(&'static str, &'static str),
    #[error("operator '{0}' cannot order {1} values")]
    NotOrdered(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A literal or a field reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Num(f64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        op: CompareOp,
        lhs: Operand,
        rhs: Operand,
    },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    In {
        needle: Operand,
        haystack: Vec<Operand>,
    },
}

/// Value domain during evaluation; timestamps and integers coerce to
/// numbers so `lastTradeSize > 1000000` works regardless of storage type.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Num(f64),
    Text(String),
    Bool(bool),
}

impl Resolved {
    fn kind(&self) -> &'static str {
        match self {
            Resolved::Num(_) => "number",
            Resolved::Text(_) => "string",
            Resolved::Bool(_) => "boolean",
        }
    }

    fn from_field(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Num(_) | FieldValue::Int(_) | FieldValue::Time(_) => {
                value.as_f64().map(Resolved::Num)
            }
            FieldValue::Text(s) => Some(Resolved::Text(s.clone())),
            FieldValue::Bool(b) => Some(Resolved::Bool(*b)),
            FieldValue::List(_) => None,
        }
    }
}

impl Predicate {
    /// Parse the wire tree. Rejects unknown operators, wrong arities, and
    /// operands that are neither literals nor `{"var": ...}` references.
    pub fn parse(value: &Value) -> Result<Self, FilterError> {
        let object = value
            .as_object()
            .ok_or_else(|| FilterError::Malformed("predicate must be an object".into()))?;
        if object.len() != 1 {
            return Err(FilterError::Malformed(
                "predicate object must have exactly one operator key".into(),
            ));
        }
        let Some((operator, args)) = object.iter().next() else {
            return Err(FilterError::Malformed("empty predicate object".into()));
        };

        match operator.as_str() {
            "and" | "or" => {
                let items = expect_array(operator, args)?;
                if items.is_empty() {
                    return Err(FilterError::Malformed(format!(
                        "'{operator}' needs at least one operand"
                    )));
                }
                let parsed = items
                    .iter()
                    .map(Predicate::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                if operator == "and" {
                    Ok(Predicate::All(parsed))
                } else {
                    Ok(Predicate::Any(parsed))
                }
            }
            "not" | "!" => {
                let inner = match args {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    Value::Array(_) => {
                        return Err(FilterError::Malformed(
                            "'not' takes exactly one operand".into(),
                        ))
                    }
                    other => other,
                };
                Ok(Predicate::Not(Box::new(Predicate::parse(inner)?)))
            }
            "in" => {
                let items = expect_array(operator, args)?;
                if items.len() != 2 {
                    return Err(FilterError::Malformed(
                        "'in' takes [needle, list]".into(),
                    ));
                }
                let needle = parse_operand(&items[0])?;
                let haystack = items[1]
                    .as_array()
                    .ok_or_else(|| {
                        FilterError::Malformed("'in' second operand must be a list".into())
                    })?
                    .iter()
                    .map(parse_operand)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Predicate::In { needle, haystack })
            }
            "==" | "!=" | "<" | "<=" | ">" | ">=" => {
                let items = expect_array(operator, args)?;
                if items.len() != 2 {
                    return Err(FilterError::Malformed(format!(
                        "'{operator}' takes exactly two operands"
                    )));
                }
                let op = match operator.as_str() {
                    "==" => CompareOp::Eq,
                    "!=" => CompareOp::Ne,
                    "<" => CompareOp::Lt,
                    "<=" => CompareOp::Le,
                    ">" => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                Ok(Predicate::Compare {
                    op,
                    lhs: parse_operand(&items[0])?,
                    rhs: parse_operand(&items[1])?,
                })
            }
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }

    /// Three-state evaluation against a snapshot field map.
    pub fn evaluate(&self, fields: &FieldMap) -> Result<bool, FilterError> {
        match self {
            Predicate::Compare { op, lhs, rhs } => {
                let left = resolve(lhs, fields)?;
                let right = resolve(rhs, fields)?;
                compare(*op, &left, &right)
            }
            Predicate::All(items) => {
                for item in items {
                    if !item.evaluate(fields)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any(items) => {
                for item in items {
                    if item.evaluate(fields)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.evaluate(fields)?),
            Predicate::In { needle, haystack } => {
                let needle = resolve(needle, fields)?;
                for candidate in haystack {
                    let candidate = resolve(candidate, fields)?;
                    // Mismatched element types are non-matches, not errors:
                    // the list is a literal the subscriber wrote.
                    if candidate.kind() == needle.kind() && candidate == needle {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// The gate: evaluation errors collapse to "does not match".
    pub fn matches(&self, fields: &FieldMap) -> bool {
        match self.evaluate(fields) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(error = %e, "predicate evaluation failed; treating as non-match");
                false
            }
        }
    }
}

fn expect_array<'v>(operator: &str, value: &'v Value) -> Result<&'v Vec<Value>, FilterError> {
    value
        .as_array()
        .ok_or_else(|| FilterError::Malformed(format!("'{operator}' operands must be a list")))
}

fn parse_operand(value: &Value) -> Result<Operand, FilterError> {
    match value {
        Value::Object(map) => {
            let var = map
                .get("var")
                .and_then(Value::as_str)
                .filter(|_| map.len() == 1)
                .ok_or_else(|| {
                    FilterError::Malformed(format!("expected {{\"var\": ...}}, got {value}"))
                })?;
            Ok(Operand::Var(var.to_string()))
        }
        Value::String(s) => Ok(Operand::Text(s.clone())),
        Value::Bool(b) => Ok(Operand::Bool(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(Operand::Num)
            .ok_or_else(|| FilterError::Malformed(format!("unrepresentable number {n}"))),
        other => Err(FilterError::Malformed(format!(
            "operand must be a literal or a var reference, got {other}"
        ))),
    }
}

fn resolve(operand: &Operand, fields: &FieldMap) -> Result<Resolved, FilterError> {
    match operand {
        Operand::Var(name) => {
            let value = fields
                .get(name.as_str())
                .ok_or_else(|| FilterError::UnknownField(name.clone()))?;
            Resolved::from_field(value)
                .ok_or_else(|| FilterError::TypeMismatch("list", "scalar"))
        }
        Operand::Num(n) => Ok(Resolved::Num(*n)),
        Operand::Text(s) => Ok(Resolved::Text(s.clone())),
        Operand::Bool(b) => Ok(Resolved::Bool(*b)),
    }
}

fn compare(op: CompareOp, left: &Resolved, right: &Resolved) -> Result<bool, FilterError> {
    match op {
        CompareOp::Eq | CompareOp::Ne => {
            if left.kind() != right.kind() {
                return Err(FilterError::TypeMismatch(left.kind(), right.kind()));
            }
            let equal = left == right;
            Ok(if op == CompareOp::Eq { equal } else { !equal })
        }
        _ => match (left, right) {
            (Resolved::Num(l), Resolved::Num(r)) => Ok(match op {
                CompareOp::Lt => l < r,
                CompareOp::Le => l <= r,
                CompareOp::Gt => l > r,
                CompareOp::Ge => l >= r,
                CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
            }),
            _ => {
                let offender = if matches!(left, Resolved::Num(_)) {
                    right.kind()
                } else {
                    left.kind()
                };
                Err(FilterError::NotOrdered(op.as_str(), offender))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::seed;
    use serde_json::json;

    fn bond_fields() -> FieldMap {
        seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2).field_map()
    }

    fn parse(value: serde_json::Value) -> Predicate {
        Predicate::parse(&value).unwrap()
    }

    #[test]
    fn test_equality_on_security_type() {
        let fields = bond_fields();
        let p = parse(json!({ "==": [{ "var": "securityType" }, "Bond"] }));
        assert!(p.matches(&fields));
        let p = parse(json!({ "==": [{ "var": "securityType" }, "Future"] }));
        assert!(!p.matches(&fields));
    }

    #[test]
    fn test_numeric_ordering() {
        let fields = bond_fields();
        let p = parse(json!({ ">": [{ "var": "price" }, 90.0] }));
        assert!(p.matches(&fields));
        let p = parse(json!({ "<=": [{ "var": "yield" }, 4.0] }));
        assert!(!p.matches(&fields));
    }

    #[test]
    fn test_logical_operators() {
        let fields = bond_fields();
        let p = parse(json!({
            "and": [
                { "==": [{ "var": "currency" }, "USD"] },
                { "or": [
                    { "==": [{ "var": "rating" }, "AAA"] },
                    { "==": [{ "var": "rating" }, "AA"] }
                ]}
            ]
        }));
        assert!(p.matches(&fields));
        let p = parse(json!({ "not": [{ "==": [{ "var": "status" }, "ACTIVE"] }] }));
        assert!(!p.matches(&fields));
    }

    #[test]
    fn test_membership() {
        let fields = bond_fields();
        let p = parse(json!({ "in": [{ "var": "sector" }, ["GOVERNMENT", "AGENCY"]] }));
        assert!(p.matches(&fields));
        let p = parse(json!({ "in": [{ "var": "sector" }, ["CORPORATE", 42]] }));
        assert!(!p.matches(&fields));
    }

    #[test]
    fn test_unknown_field_is_non_match_not_panic() {
        let fields = bond_fields();
        let p = parse(json!({ "==": [{ "var": "strikePrice" }, 110.0] }));
        assert_eq!(p.matches(&fields), false);
        assert!(matches!(
            p.evaluate(&fields),
            Err(FilterError::UnknownField(_))
        ));
    }

    #[test]
    fn test_type_mismatch_is_error_collapsed_to_false() {
        let fields = bond_fields();
        let p = parse(json!({ "==": [{ "var": "price" }, "expensive"] }));
        assert!(matches!(
            p.evaluate(&fields),
            Err(FilterError::TypeMismatch(_, _))
        ));
        assert!(!p.matches(&fields));

        let p = parse(json!({ ">": [{ "var": "securityType" }, 10] }));
        assert!(matches!(p.evaluate(&fields), Err(FilterError::NotOrdered(_, _))));
    }

    #[test]
    fn test_parse_rejects_malformed_trees() {
        assert!(Predicate::parse(&json!("price")).is_err());
        assert!(Predicate::parse(&json!({ "===": [1, 2] })).is_err());
        assert!(Predicate::parse(&json!({ "==": [1] })).is_err());
        assert!(Predicate::parse(&json!({ "and": [] })).is_err());
        assert!(Predicate::parse(&json!({ "in": [{ "var": "sector" }, "GOVERNMENT"] })).is_err());
        assert!(Predicate::parse(&json!({ "==": [{ "var": "a" }, { "x": 1 }] })).is_err());
    }

    #[test]
    fn test_timestamps_compare_as_numbers() {
        let fields = bond_fields();
        let p = parse(json!({ ">": [{ "var": "lastUpdate" }, 0] }));
        assert!(p.matches(&fields));
    }
}
