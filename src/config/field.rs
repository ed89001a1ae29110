//! Field descriptors: declarative metadata for one attribute or relationship slot of a resource.

use crate::case;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage type of a field. Serialized the way declarations spell it (`bigInteger`, `datetime`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatabaseFieldType {
    String,
    Text,
    Integer,
    BigInteger,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Timestamp,
    Enum,
    Json,
    Array,
    Increments,
}

impl DatabaseFieldType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DatabaseFieldType::Integer | DatabaseFieldType::BigInteger | DatabaseFieldType::Increments
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            DatabaseFieldType::Date | DatabaseFieldType::DateTime | DatabaseFieldType::Timestamp
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
    BelongsToMany,
}

impl RelationshipKind {
    /// Whether the owner stores a collection of related ids (as opposed to a single reference).
    pub fn is_to_many(self) -> bool {
        matches!(self, RelationshipKind::HasMany | RelationshipKind::BelongsToMany)
    }
}

/// Explicit relationship target: resolved against the registry by `target` name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationshipKind,
    pub target: String,
}

impl Relation {
    /// Key under which the owner record exposes this relationship: the target's camelCase name,
    /// pluralized for to-many kinds.
    pub fn storage_key(&self) -> String {
        if self.kind.is_to_many() {
            case::camel_case(&case::pluralize(&self.target))
        } else {
            case::camel_case(&self.target)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldComponent {
    Plain,
    Relationship(Relation),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: Value,
}

impl SelectOption {
    pub fn new(label: impl Into<String>, value: impl Into<Value>) -> Self {
        SelectOption {
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub database_field: String,
    pub database_field_type: DatabaseFieldType,
    pub component: FieldComponent,
    pub is_unique: bool,
    pub is_searchable: bool,
    pub is_nullable: bool,
    pub is_hidden: bool,
    pub default_value: Option<Value>,
    /// Opaque to the core; consumed by the external validator.
    pub validation_rules: Vec<String>,
    pub select_options: Vec<SelectOption>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, database_field_type: DatabaseFieldType) -> Self {
        let name = name.into();
        FieldDescriptor {
            database_field: case::snake_case(&name),
            name,
            database_field_type,
            component: FieldComponent::Plain,
            is_unique: false,
            is_searchable: false,
            is_nullable: true,
            is_hidden: false,
            default_value: None,
            validation_rules: Vec::new(),
            select_options: Vec::new(),
        }
    }

    fn relationship(kind: RelationshipKind, target: impl Into<String>) -> Self {
        let target = target.into();
        let field_type = if kind.is_to_many() {
            DatabaseFieldType::Array
        } else {
            DatabaseFieldType::BigInteger
        };
        let mut field = FieldDescriptor::new(target.clone(), field_type);
        field.component = FieldComponent::Relationship(Relation { kind, target });
        field
    }

    pub fn relation(&self) -> Option<&Relation> {
        match &self.component {
            FieldComponent::Relationship(r) => Some(r),
            FieldComponent::Plain => None,
        }
    }

    pub fn is_relationship(&self) -> bool {
        self.relation().is_some()
    }

    /// Key this field occupies in a normalized record.
    pub fn record_key(&self) -> String {
        match self.relation() {
            Some(rel) => rel.storage_key(),
            None => self.database_field.clone(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.is_searchable = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    pub fn not_nullable(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validation_rules.extend(rules.into_iter().map(Into::into));
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = SelectOption>) -> Self {
        self.select_options = options.into_iter().collect();
        self
    }

    /// Override the storage key derived from the label.
    pub fn database_field(mut self, key: impl Into<String>) -> Self {
        self.database_field = key.into();
        self
    }

    /// Value a new record receives when the payload omits this field.
    pub fn storage_default(&self) -> Value {
        if let Some(v) = &self.default_value {
            return v.clone();
        }
        match (&self.component, self.database_field_type) {
            (FieldComponent::Relationship(r), _) if r.kind.is_to_many() => Value::Array(Vec::new()),
            (FieldComponent::Relationship(_), _) => Value::Null,
            (_, DatabaseFieldType::Array) => Value::Array(Vec::new()),
            _ => Value::Null,
        }
    }
}

pub fn text(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::String)
}

pub fn textarea(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Text)
}

pub fn integer(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Integer)
}

pub fn big_integer(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::BigInteger)
}

pub fn boolean(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Boolean)
}

pub fn date(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Date)
}

pub fn date_time(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::DateTime)
}

pub fn timestamp(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Timestamp)
}

pub fn select(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Enum)
}

pub fn json(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Json)
}

pub fn array(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Array)
}

pub fn increments(name: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::new(name, DatabaseFieldType::Increments).not_nullable()
}

pub fn belongs_to(target: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::relationship(RelationshipKind::BelongsTo, target)
}

pub fn has_many(target: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::relationship(RelationshipKind::HasMany, target)
}

pub fn belongs_to_many(target: impl Into<String>) -> FieldDescriptor {
    FieldDescriptor::relationship(RelationshipKind::BelongsToMany, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_calls_return_changed_values() {
        let base = text("Email");
        let changed = base.clone().unique().searchable().rules(["required", "email"]);
        assert!(!base.is_unique);
        assert!(changed.is_unique && changed.is_searchable);
        assert_eq!(changed.validation_rules, vec!["required", "email"]);
        assert_eq!(changed.database_field, "email");
    }

    #[test]
    fn relationship_fields_carry_explicit_target() {
        let f = belongs_to_many("Administrator Role");
        let rel = f.relation().expect("relation");
        assert_eq!(rel.kind, RelationshipKind::BelongsToMany);
        assert_eq!(rel.target, "Administrator Role");
        assert_eq!(f.storage_default(), Value::Array(vec![]));
        assert_eq!(belongs_to("User").storage_default(), Value::Null);
    }

    #[test]
    fn storage_keys_follow_related_names() {
        assert_eq!(
            belongs_to_many("Administrator Role").relation().unwrap().storage_key(),
            "administratorRoles"
        );
        assert_eq!(has_many("Category").relation().unwrap().storage_key(), "categories");
        assert_eq!(belongs_to("Blog Post").relation().unwrap().storage_key(), "blogPost");
    }

    #[test]
    fn field_type_serializes_like_declarations() {
        assert_eq!(
            serde_json::to_value(DatabaseFieldType::BigInteger).unwrap(),
            serde_json::json!("bigInteger")
        );
        assert_eq!(
            serde_json::to_value(DatabaseFieldType::DateTime).unwrap(),
            serde_json::json!("datetime")
        );
    }
}
