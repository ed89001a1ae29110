//! Filter compiler: turns ordered `Filter` entries into a backend-neutral `Predicate`.

use crate::config::{RelationshipKind, ResourceDescriptor};
use crate::error::AppError;
use crate::query::types::{Filter, Operator};
use serde_json::Value;
use std::collections::BTreeMap;

/// Keys every stored record carries whether or not the resource declares them.
pub const IMPLICIT_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Comparison {
    In,
    NotIn,
    /// Case-sensitive regular expression.
    Pattern,
    Gte,
    Gt,
    Lte,
    Lt,
    NotNull,
}

/// What one field must satisfy. `Equals(Null)` means "is null".
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Equals(Value),
    Compare(BTreeMap<Comparison, Value>),
}

impl Condition {
    pub fn compare(comparison: Comparison, value: Value) -> Self {
        Condition::Compare(BTreeMap::from([(comparison, value)]))
    }

    pub fn one_of(ids: impl IntoIterator<Item = Value>) -> Self {
        Condition::compare(Comparison::In, Value::Array(ids.into_iter().collect()))
    }
}

/// Conjunction of per-field conditions, extra restrictions added by the repository
/// (relationship scoping, exclusions), and an optional disjunctive search group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicate {
    fields: BTreeMap<String, Condition>,
    restrictions: Vec<(String, Condition)>,
    any_of: Vec<(String, String)>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Condition> {
        &self.fields
    }

    pub fn restrictions(&self) -> &[(String, Condition)] {
        &self.restrictions
    }

    /// `(field, pattern)` pairs of which at least one must match.
    pub fn any_of(&self) -> &[(String, String)] {
        &self.any_of
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.restrictions.is_empty() && self.any_of.is_empty()
    }

    /// AND an extra condition that does not merge with the caller's filters on the same field.
    pub fn restrict(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.restrictions.push((field.into(), condition));
        self
    }

    /// OR an escaped substring pattern across every searchable field of `resource`.
    /// An empty term, or a resource without searchable fields, leaves the predicate unchanged.
    pub fn with_search(mut self, resource: &ResourceDescriptor, term: &str) -> Self {
        if term.is_empty() {
            return self;
        }
        let pattern = substring_pattern(term);
        for field in resource.searchable_fields() {
            self.any_of.push((field.database_field.clone(), pattern.clone()));
        }
        self
    }

    fn apply(&mut self, filter: &Filter) {
        let (comparison, value) = match filter.operator {
            Operator::Equals => {
                self.fields
                    .insert(filter.field.clone(), Condition::Equals(filter.value.clone()));
                return;
            }
            Operator::IsNull => {
                self.fields.insert(filter.field.clone(), Condition::Equals(Value::Null));
                return;
            }
            Operator::In => (Comparison::In, as_list(&filter.value)),
            Operator::NotIn => (Comparison::NotIn, as_list(&filter.value)),
            Operator::Matches => (Comparison::Pattern, Value::String(as_text(&filter.value))),
            Operator::Contains => (
                Comparison::Pattern,
                Value::String(substring_pattern(&as_text(&filter.value))),
            ),
            Operator::Gte => (Comparison::Gte, filter.value.clone()),
            Operator::Gt => (Comparison::Gt, filter.value.clone()),
            Operator::Lte => (Comparison::Lte, filter.value.clone()),
            Operator::Lt => (Comparison::Lt, filter.value.clone()),
            Operator::NotNull => (Comparison::NotNull, Value::Null),
        };
        match self.fields.get_mut(&filter.field) {
            Some(Condition::Compare(slots)) => {
                slots.insert(comparison, value);
            }
            _ => {
                self.fields
                    .insert(filter.field.clone(), Condition::compare(comparison, value));
            }
        }
    }
}

/// Compile caller filters for `resource`. Unknown fields are a validation error.
pub fn compile(resource: &ResourceDescriptor, filters: &[Filter]) -> Result<Predicate, AppError> {
    let mut predicate = Predicate::new();
    for filter in filters {
        if !is_filterable(resource, &filter.field) {
            return Err(AppError::validation(
                filter.field.clone(),
                format!("field '{}' not found on {}", filter.field, resource.name),
            ));
        }
        predicate.apply(filter);
    }
    tracing::debug!(resource = %resource.name, filters = filters.len(), "compiled filter predicate");
    Ok(predicate)
}

/// Plain fields, implicit columns and BelongsTo keys can be filtered on. To-many sets cannot.
pub fn is_filterable(resource: &ResourceDescriptor, key: &str) -> bool {
    IMPLICIT_FIELDS.contains(&key)
        || resource.plain_field(key).is_some()
        || resource.relationship_fields().any(|f| {
            f.relation()
                .map(|r| r.kind == RelationshipKind::BelongsTo && r.storage_key() == key)
                .unwrap_or(false)
        })
}

/// `.*<escaped>.*`: the term is matched literally anywhere in the value.
pub fn substring_pattern(term: &str) -> String {
    format!(".*{}.*", regex::escape(term))
}

fn as_list(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
