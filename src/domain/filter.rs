//! Structured query filters.
//!
//! Filters arrive as documents in the familiar `{field: value}` /
//! `{field: {"$op": operand}}` shape. They are parsed into an [`Expression`]
//! tree that can be evaluated in memory against cached documents, and
//! rewritten for change-feed subscriptions.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use super::document::{DocId, Document, ID_FIELD, get_path};
use super::sort::compare_values;

const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Prefix applied to document fields when matching change events.
pub const FULL_DOCUMENT_PREFIX: &str = "fullDocument.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),
    #[error("`{0}` expects an array")]
    ExpectedArray(String),
    #[error("`{0}` expects filter documents")]
    ExpectedDocument(String),
    #[error("field `{0}` mixes operators with literal keys")]
    MixedOperators(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Nor(Vec<Expression>),
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Nin(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Exists(String, bool),
    ElemMatch(String, Box<Expression>),
}

impl Expression {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::And(items) => items.iter().all(|item| item.matches(doc)),
            Self::Or(items) => items.iter().any(|item| item.matches(doc)),
            Self::Nor(items) => !items.iter().any(|item| item.matches(doc)),
            Self::Eq(field, expected) => field_equals(doc, field, expected),
            Self::Ne(field, expected) => !field_equals(doc, field, expected),
            Self::In(field, candidates) => candidates
                .iter()
                .any(|candidate| field_equals(doc, field, candidate)),
            Self::Nin(field, candidates) => !candidates
                .iter()
                .any(|candidate| field_equals(doc, field, candidate)),
            Self::Gt(field, bound) => field_compares(doc, field, bound, Ordering::is_gt),
            Self::Gte(field, bound) => field_compares(doc, field, bound, Ordering::is_ge),
            Self::Lt(field, bound) => field_compares(doc, field, bound, Ordering::is_lt),
            Self::Lte(field, bound) => field_compares(doc, field, bound, Ordering::is_le),
            Self::Exists(field, wanted) => get_path(doc, field).is_some() == *wanted,
            Self::ElemMatch(field, inner) => match get_path(doc, field) {
                Some(Value::Array(items)) => items.iter().any(|item| match item {
                    Value::Object(element) => inner.matches(element),
                    _ => false,
                }),
                _ => false,
            },
        }
    }
}

pub fn parse_filter(filter: &Document) -> Result<Expression, FilterParseError> {
    let clauses = filter
        .iter()
        .map(|(key, value)| parse_clause(key, value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(collapse_and(clauses))
}

fn collapse_and(mut clauses: Vec<Expression>) -> Expression {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Expression::And(clauses)
    }
}

fn parse_clause(key: &str, value: &Value) -> Result<Expression, FilterParseError> {
    match key {
        "$and" => Ok(Expression::And(parse_list(key, value)?)),
        "$or" => Ok(Expression::Or(parse_list(key, value)?)),
        "$nor" => Ok(Expression::Nor(parse_list(key, value)?)),
        op if op.starts_with('$') => Err(FilterParseError::UnsupportedOperator(op.to_string())),
        field => parse_field(field, value),
    }
}

fn parse_list(op: &str, value: &Value) -> Result<Vec<Expression>, FilterParseError> {
    let Value::Array(items) = value else {
        return Err(FilterParseError::ExpectedArray(op.to_string()));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(filter) => parse_filter(filter),
            _ => Err(FilterParseError::ExpectedDocument(op.to_string())),
        })
        .collect()
}

fn parse_field(field: &str, value: &Value) -> Result<Expression, FilterParseError> {
    let Value::Object(operators) = value else {
        return Ok(Expression::Eq(field.to_string(), value.clone()));
    };
    if !operators.keys().any(|key| key.starts_with('$')) {
        return Ok(Expression::Eq(field.to_string(), value.clone()));
    }
    if !operators.keys().all(|key| key.starts_with('$')) {
        return Err(FilterParseError::MixedOperators(field.to_string()));
    }

    let conditions = operators
        .iter()
        .map(|(op, operand)| parse_operator(field, op, operand))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(collapse_and(conditions))
}

fn parse_operator(field: &str, op: &str, operand: &Value) -> Result<Expression, FilterParseError> {
    let field = field.to_string();
    let expression = match op {
        "$eq" => Expression::Eq(field, operand.clone()),
        "$ne" => Expression::Ne(field, operand.clone()),
        "$gt" => Expression::Gt(field, operand.clone()),
        "$gte" => Expression::Gte(field, operand.clone()),
        "$lt" => Expression::Lt(field, operand.clone()),
        "$lte" => Expression::Lte(field, operand.clone()),
        "$in" | "$nin" => {
            let Value::Array(candidates) = operand else {
                return Err(FilterParseError::ExpectedArray(op.to_string()));
            };
            if op == "$in" {
                Expression::In(field, candidates.clone())
            } else {
                Expression::Nin(field, candidates.clone())
            }
        }
        "$exists" => Expression::Exists(field, is_truthy(operand)),
        "$elemMatch" => {
            let Value::Object(inner) = operand else {
                return Err(FilterParseError::ExpectedDocument(op.to_string()));
            };
            Expression::ElemMatch(field, Box::new(parse_filter(inner)?))
        }
        other => return Err(FilterParseError::UnsupportedOperator(other.to_string())),
    };
    Ok(expression)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn field_equals(doc: &Document, field: &str, expected: &Value) -> bool {
    let Some(actual) = get_path(doc, field) else {
        return expected.is_null();
    };

    if field == ID_FIELD
        && let (Some(actual), Some(expected)) =
            (DocId::from_value(actual), DocId::from_value(expected))
    {
        return actual == expected;
    }

    values_equal(actual, expected)
        || matches!(actual, Value::Array(items) if items.iter().any(|item| values_equal(item, expected)))
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

fn field_compares(
    doc: &Document,
    field: &str,
    bound: &Value,
    accept: fn(Ordering) -> bool,
) -> bool {
    let check = |value: &Value| {
        comparable(value, bound) && accept(compare_values(Some(value), Some(bound)))
    };
    match get_path(doc, field) {
        Some(Value::Array(items)) => items.iter().any(check),
        Some(value) => check(value),
        None => false,
    }
}

/// Result of evaluating a filter that may not be understood in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMatch {
    Match,
    NoMatch,
    /// The filter uses constructs the evaluator does not support.
    Undecidable,
}

impl FilterMatch {
    /// Only a definitive miss excludes a document.
    pub fn excludes(self) -> bool {
        self == Self::NoMatch
    }
}

pub fn evaluate(filter: &Document, doc: &Document) -> FilterMatch {
    match parse_filter(filter) {
        Ok(expression) if expression.matches(doc) => FilterMatch::Match,
        Ok(_) => FilterMatch::NoMatch,
        Err(_) => FilterMatch::Undecidable,
    }
}

pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    evaluate(filter, doc) == FilterMatch::Match
}

/// Condition of a single-field filter the cache can answer from memory.
#[derive(Debug, Clone, PartialEq)]
pub enum SimpleCondition {
    Eq(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
}

/// A filter on exactly one field using equality, `$in` or `$nin`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleFilter {
    pub field: String,
    pub condition: SimpleCondition,
}

impl SimpleFilter {
    pub fn parse(filter: &Document) -> Option<Self> {
        if filter.len() != 1 {
            return None;
        }
        let (field, value) = filter.iter().next()?;
        if field.starts_with('$') {
            return None;
        }

        let condition = match value {
            Value::Object(operators) if operators.keys().any(|key| key.starts_with('$')) => {
                if operators.len() != 1 {
                    return None;
                }
                let (op, operand) = operators.iter().next()?;
                match (op.as_str(), operand) {
                    ("$eq", operand) => SimpleCondition::Eq(operand.clone()),
                    ("$in", Value::Array(candidates)) => SimpleCondition::In(candidates.clone()),
                    ("$nin", Value::Array(candidates)) => SimpleCondition::Nin(candidates.clone()),
                    _ => return None,
                }
            }
            other => SimpleCondition::Eq(other.clone()),
        };

        Some(Self {
            field: field.clone(),
            condition,
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match &self.condition {
            SimpleCondition::Eq(expected) => field_equals(doc, &self.field, expected),
            SimpleCondition::In(candidates) => candidates
                .iter()
                .any(|candidate| field_equals(doc, &self.field, candidate)),
            SimpleCondition::Nin(candidates) => !candidates
                .iter()
                .any(|candidate| field_equals(doc, &self.field, candidate)),
        }
    }

    /// Ids named by an `_id` equality or `$in` filter.
    pub fn requested_ids(&self) -> Option<HashSet<DocId>> {
        if self.field != ID_FIELD {
            return None;
        }
        match &self.condition {
            SimpleCondition::Eq(value) => DocId::from_value(value).map(|id| HashSet::from([id])),
            SimpleCondition::In(values) => values.iter().map(DocId::from_value).collect(),
            SimpleCondition::Nin(_) => None,
        }
    }
}

/// Rewrite a document filter so it applies to change events, where the
/// document lives under `fullDocument`.
pub fn to_change_feed_match(filter: &Document) -> Document {
    filter
        .iter()
        .map(|(key, value)| {
            if LOGICAL_OPERATORS.contains(&key.as_str()) {
                let rewritten = match value {
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(inner) => Value::Object(to_change_feed_match(inner)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                (key.clone(), rewritten)
            } else if key.starts_with('$') {
                (key.clone(), value.clone())
            } else {
                (format!("{FULL_DOCUMENT_PREFIX}{key}"), value.clone())
            }
        })
        .collect()
}

/// Remove every condition comparing against `target`.
///
/// Used to drop the caller's identity from a filter so that subscribers
/// differing only by who they are share one change feed. Logical arrays lose
/// emptied branches, vanish when nothing is left, and a single surviving
/// `$and` branch is merged into the parent.
pub fn strip_value(filter: &Document, target: &Value) -> Document {
    let mut stripped = Document::new();
    for (key, value) in filter {
        if values_equal(value, target) {
            continue;
        }

        match value {
            Value::Array(items) if LOGICAL_OPERATORS.contains(&key.as_str()) => {
                let mut branches: Vec<Document> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Object(inner) => Some(strip_value(inner, target)),
                        _ => None,
                    })
                    .filter(|branch| !branch.is_empty())
                    .collect();
                if branches.is_empty() {
                    continue;
                }
                if key == "$and" && branches.len() == 1 {
                    stripped.extend(branches.remove(0));
                    continue;
                }
                stripped.insert(
                    key.clone(),
                    Value::Array(branches.into_iter().map(Value::Object).collect()),
                );
            }
            Value::Object(inner) if !key.starts_with('$') => {
                let nested = strip_value(inner, target);
                if !nested.is_empty() {
                    stripped.insert(key.clone(), Value::Object(nested));
                }
            }
            other => {
                stripped.insert(key.clone(), other.clone());
            }
        }
    }
    stripped
}
