//! Document-store rendering of a `Predicate`: a Mongo-style JSON filter, and a matcher that
//! evaluates such a filter against stored records.

use crate::error::AppError;
use crate::query::filter::{Comparison, Condition, Predicate};
use crate::response::Record;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

fn operator_key(c: Comparison) -> &'static str {
    match c {
        Comparison::In => "$in",
        Comparison::NotIn => "$nin",
        Comparison::Pattern => "$regex",
        Comparison::Gte => "$gte",
        Comparison::Gt => "$gt",
        Comparison::Lte => "$lte",
        Comparison::Lt => "$lt",
        Comparison::NotNull => "$ne",
    }
}

fn render_condition(condition: &Condition) -> Value {
    match condition {
        // objects are wrapped so their keys are never read as operators
        Condition::Equals(v @ Value::Object(_)) => json!({ "$eq": v }),
        Condition::Equals(v) => v.clone(),
        Condition::Compare(slots) => {
            let mut ops = Map::new();
            for (c, v) in slots {
                // not_null carries no operand; it renders as `$ne: null`
                let operand = if *c == Comparison::NotNull { Value::Null } else { v.clone() };
                ops.insert(operator_key(*c).to_string(), operand);
            }
            Value::Object(ops)
        }
    }
}

/// `{field: cond, ...}`, wrapped in `$and` when restrictions or a search group are present.
pub fn render(predicate: &Predicate) -> Value {
    let mut base = Map::new();
    for (field, condition) in predicate.fields() {
        base.insert(field.clone(), render_condition(condition));
    }
    if predicate.restrictions().is_empty() && predicate.any_of().is_empty() {
        return Value::Object(base);
    }

    let mut all = Vec::new();
    if !base.is_empty() {
        all.push(Value::Object(base));
    }
    for (field, condition) in predicate.restrictions() {
        let mut clause = Map::new();
        clause.insert(field.clone(), render_condition(condition));
        all.push(Value::Object(clause));
    }
    if !predicate.any_of().is_empty() {
        let any: Vec<Value> = predicate
            .any_of()
            .iter()
            .map(|(field, pattern)| {
                let mut clause = Map::new();
                clause.insert(field.clone(), json!({ "$regex": pattern }));
                Value::Object(clause)
            })
            .collect();
        all.push(json!({ "$or": any }));
    }
    json!({ "$and": all })
}

#[derive(Debug)]
enum Test {
    Eq(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Regex(Regex),
    Range(Ordering, bool, Value),
    Ne(Value),
}

#[derive(Debug)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Field(String, Vec<Test>),
}

/// Parsed filter document, ready to be matched against records.
#[derive(Debug)]
pub struct DocumentFilter {
    root: Node,
}

impl DocumentFilter {
    pub fn parse(document: &Value) -> Result<Self, AppError> {
        Ok(DocumentFilter {
            root: parse_node(document)?,
        })
    }

    pub fn from_predicate(predicate: &Predicate) -> Result<Self, AppError> {
        let document = render(predicate);
        tracing::debug!(filter = %document, "document filter");
        Self::parse(&document)
    }

    pub fn matches(&self, record: &Record) -> bool {
        eval(&self.root, record)
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::validation("filters", message)
}

fn parse_node(document: &Value) -> Result<Node, AppError> {
    let obj = document
        .as_object()
        .ok_or_else(|| invalid("filter document must be an object"))?;
    let mut nodes = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let parts = value
                    .as_array()
                    .ok_or_else(|| invalid(format!("{} expects a list", key)))?
                    .iter()
                    .map(parse_node)
                    .collect::<Result<Vec<_>, _>>()?;
                nodes.push(if key == "$and" { Node::And(parts) } else { Node::Or(parts) });
            }
            field => nodes.push(Node::Field(field.to_string(), parse_tests(value)?)),
        }
    }
    Ok(Node::And(nodes))
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(m) => !m.is_empty() && m.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_tests(value: &Value) -> Result<Vec<Test>, AppError> {
    if !is_operator_object(value) {
        return Ok(vec![Test::Eq(value.clone())]);
    }
    let mut tests = Vec::new();
    if let Value::Object(ops) = value {
        for (op, operand) in ops {
            let list = || match operand {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let test = match op.as_str() {
                "$eq" => Test::Eq(operand.clone()),
                "$ne" => Test::Ne(operand.clone()),
                "$in" => Test::In(list()),
                "$nin" => Test::NotIn(list()),
                "$regex" => {
                    let pattern = operand.as_str().unwrap_or_default();
                    Test::Regex(
                        Regex::new(pattern)
                            .map_err(|e| invalid(format!("invalid pattern '{}': {}", pattern, e)))?,
                    )
                }
                "$gte" => Test::Range(Ordering::Greater, true, operand.clone()),
                "$gt" => Test::Range(Ordering::Greater, false, operand.clone()),
                "$lte" => Test::Range(Ordering::Less, true, operand.clone()),
                "$lt" => Test::Range(Ordering::Less, false, operand.clone()),
                other => return Err(invalid(format!("unsupported operator {}", other))),
            };
            tests.push(test);
        }
    }
    Ok(tests)
}

fn eval(node: &Node, record: &Record) -> bool {
    match node {
        Node::And(parts) => parts.iter().all(|n| eval(n, record)),
        Node::Or(parts) => parts.iter().any(|n| eval(n, record)),
        Node::Field(field, tests) => {
            let actual = record.get(field).unwrap_or(&Value::Null);
            tests.iter().all(|t| run_test(t, actual))
        }
    }
}

fn run_test(test: &Test, actual: &Value) -> bool {
    match test {
        Test::Eq(expected) => matches_value(actual, expected),
        Test::Ne(expected) => !matches_value(actual, expected),
        Test::In(options) => options.iter().any(|o| matches_value(actual, o)),
        Test::NotIn(options) => !options.iter().any(|o| matches_value(actual, o)),
        Test::Regex(re) => match actual {
            Value::String(s) => re.is_match(s),
            Value::Array(items) => items.iter().any(|v| v.as_str().map(|s| re.is_match(s)).unwrap_or(false)),
            _ => false,
        },
        Test::Range(direction, inclusive, bound) => match compare(actual, bound) {
            Some(Ordering::Equal) => *inclusive,
            Some(ord) => ord == *direction,
            None => false,
        },
    }
}

/// Equality with array-membership semantics: a scalar matches an array that contains it.
fn matches_value(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), e) if !e.is_array() => items.iter().any(|v| values_equal(v, e)),
        (a, e) => values_equal(a, e),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two scalars of the same kind. Mixed kinds and nulls are incomparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
