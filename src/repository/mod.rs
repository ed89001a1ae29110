//! Storage-agnostic repository. Backends implement the storage primitives; every public
//! operation (create/update/find/aggregate/relationship listings) is built on top of them here.

mod memory;
mod postgres;

pub use memory::DocumentRepository;
pub use postgres::{ensure_database_exists, PgRepository};

use crate::config::{Registry, RelationshipKind, ResourceDescriptor};
use crate::error::AppError;
use crate::query::{
    compile, Aggregate, AggregateRange, Comparison, Condition, FetchQuery, Filter, NormalizedQuery, Operator,
    Predicate,
};
use crate::relation::{self, PathTree};
use crate::response::{normalize_id, select_fields, Page, Record};
use async_trait::async_trait;
use serde_json::Value;

/// Rows to skip and the maximum number to return (`None`: no limit).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub skip: u64,
    pub limit: Option<u64>,
}

impl Window {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn page(query: &NormalizedQuery) -> Self {
        Window {
            skip: query.skip(),
            limit: Some(query.limit()),
        }
    }

    pub fn first() -> Self {
        Window { skip: 0, limit: Some(1) }
    }
}

/// Keys the backend owns; payloads cannot set them.
const RESERVED_KEYS: [&str; 3] = ["id", "created_at", "updated_at"];

fn declared_keys(resource: &ResourceDescriptor) -> Vec<String> {
    resource.fields.iter().map(|f| f.record_key()).collect()
}

fn retain_declared(resource: &ResourceDescriptor, record: &mut Record) {
    let keys = declared_keys(resource);
    record.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()) && keys.iter().any(|d| d == k));
}

/// Relationship values hold numeric ids: to-many keys become deduplicated arrays, a
/// BelongsTo keeps a single id (or null).
fn normalize_relationships(resource: &ResourceDescriptor, record: &mut Record) {
    for field in resource.relationship_fields() {
        let Some(rel) = field.relation() else { continue };
        let Some(value) = record.get_mut(&rel.storage_key()) else { continue };
        if !rel.kind.is_to_many() {
            *value = normalize_id(value);
            continue;
        }
        let raw = match value.take() {
            Value::Array(ids) => ids,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let mut ids: Vec<Value> = Vec::new();
        for id in raw {
            let id = normalize_id(&id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        *value = Value::Array(ids);
    }
}

fn not_found(resource: &ResourceDescriptor, id: &Value) -> AppError {
    AppError::NotFound(format!("Cannot find a {} with id of {}", resource.name, id))
}

#[async_trait]
pub trait Repository: Send + Sync {
    fn registry(&self) -> &Registry;

    /// Create the storage for every registered resource (tables, junctions, collections).
    async fn materialize(&self) -> Result<(), AppError>;

    /// Persist a new record (declared keys only, defaults filled) and return it normalized.
    async fn insert(&self, resource: &ResourceDescriptor, record: Record) -> Result<Record, AppError>;

    /// Merge `changes` into an existing record. `None` when the id does not exist.
    async fn modify(
        &self,
        resource: &ResourceDescriptor,
        id: &Value,
        changes: Record,
    ) -> Result<Option<Record>, AppError>;

    async fn select(
        &self,
        resource: &ResourceDescriptor,
        predicate: &Predicate,
        window: Window,
    ) -> Result<Vec<Record>, AppError>;

    async fn count(&self, resource: &ResourceDescriptor, predicate: &Predicate) -> Result<u64, AppError>;

    /// Delete a record and every relationship id pointing at it. `false` when nothing was removed.
    async fn remove(&self, resource: &ResourceDescriptor, id: &Value) -> Result<bool, AppError>;

    /// Add `related_ids` to the to-many relationship stored under `key`. Existing ids are kept once.
    async fn attach_related(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        id: &Value,
        related_ids: &[Value],
    ) -> Result<(), AppError>;

    async fn detach_related(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        id: &Value,
        related_ids: &[Value],
    ) -> Result<(), AppError>;

    /// `count` ignores `columns`; the others fold over every value of the listed columns.
    async fn aggregate(
        &self,
        resource: &ResourceDescriptor,
        aggregate: Aggregate,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError>;

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        payload: Record,
        relationship_payload: Record,
    ) -> Result<Record, AppError> {
        let mut record = payload;
        record.extend(relationship_payload);
        let mut record = resource.apply_before_create(record);
        retain_declared(resource, &mut record);
        for field in &resource.fields {
            record
                .entry(field.record_key())
                .or_insert_with(|| field.storage_default());
        }
        normalize_relationships(resource, &mut record);
        self.check_unique(resource, &record, None).await?;
        let created = self
            .insert(resource, record)
            .await
            .map_err(|e| e.context(&resource.name, "create"))?;
        tracing::debug!(resource = %resource.name, id = ?created.get("id"), "record created");
        Ok(created)
    }

    async fn update(
        &self,
        resource: &ResourceDescriptor,
        id: &Value,
        payload: Record,
        relationship_payload: Record,
    ) -> Result<Record, AppError> {
        let id = normalize_id(id);
        let mut changes = payload;
        changes.extend(relationship_payload);
        let mut changes = resource.apply_before_update(changes);
        retain_declared(resource, &mut changes);
        normalize_relationships(resource, &mut changes);
        self.check_unique(resource, &changes, Some(&id)).await?;
        let updated = self
            .modify(resource, &id, changes)
            .await
            .map_err(|e| e.context(&resource.name, "update"))?;
        updated.ok_or_else(|| not_found(resource, &id))
    }

    /// Conflict when another record already holds a value of a unique field.
    async fn check_unique(
        &self,
        resource: &ResourceDescriptor,
        record: &Record,
        exclude_id: Option<&Value>,
    ) -> Result<(), AppError> {
        for field in resource.plain_fields().filter(|f| f.is_unique) {
            let Some(value) = record.get(&field.database_field) else { continue };
            if value.is_null() {
                continue;
            }
            let existing = match exclude_id {
                Some(id) => {
                    self.find_one_by_field_excluding_one(resource, &field.database_field, value, id, None)
                        .await?
                }
                None => self.find_one_by_field(resource, &field.database_field, value, None).await?,
            };
            if existing.is_some() {
                return Err(AppError::Conflict(format!(
                    "{} with {} {} already exists",
                    resource.name, field.database_field, value
                )));
            }
        }
        Ok(())
    }

    async fn find_one_by_id(
        &self,
        resource: &ResourceDescriptor,
        id: &Value,
        fields: Option<&[String]>,
        with_relationships: &[String],
    ) -> Result<Option<Record>, AppError> {
        let predicate = Predicate::new().restrict("id", Condition::Equals(normalize_id(id)));
        let Some(record) = self
            .select(resource, &predicate, Window::first())
            .await
            .map_err(|e| e.context(&resource.name, "find one by id"))?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let tree = PathTree::parse(with_relationships);
        let record = if tree.is_empty() {
            record
        } else {
            relation::populate(self, resource, record, &tree).await?
        };
        Ok(Some(select_fields(record, fields)))
    }

    async fn find_one_by_field(
        &self,
        resource: &ResourceDescriptor,
        field: &str,
        value: &Value,
        fields: Option<&[String]>,
    ) -> Result<Option<Record>, AppError> {
        let predicate = compile(resource, &[Filter::new(field, Operator::Equals, value.clone())])?;
        let rows = self
            .select(resource, &predicate, Window::first())
            .await
            .map_err(|e| e.context(&resource.name, "find one by field"))?;
        Ok(rows.into_iter().next().map(|r| select_fields(r, fields)))
    }

    async fn find_one_by_field_excluding_one(
        &self,
        resource: &ResourceDescriptor,
        field: &str,
        value: &Value,
        exclude_id: &Value,
        fields: Option<&[String]>,
    ) -> Result<Option<Record>, AppError> {
        let predicate = compile(resource, &[Filter::new(field, Operator::Equals, value.clone())])?.restrict(
            "id",
            Condition::compare(Comparison::NotIn, Value::Array(vec![normalize_id(exclude_id)])),
        );
        let rows = self
            .select(resource, &predicate, Window::first())
            .await
            .map_err(|e| e.context(&resource.name, "find one by field"))?;
        Ok(rows.into_iter().next().map(|r| select_fields(r, fields)))
    }

    /// Caller filters compiled for `resource`.
    fn handle_filter_queries(&self, resource: &ResourceDescriptor, filters: &[Filter]) -> Result<Predicate, AppError> {
        compile(resource, filters)
    }

    fn populate_search_queries(&self, term: &str, resource: &ResourceDescriptor, predicate: Predicate) -> Predicate {
        predicate.with_search(resource, term)
    }

    fn listing_predicate(&self, resource: &ResourceDescriptor, query: &NormalizedQuery) -> Result<Predicate, AppError> {
        let predicate = self.handle_filter_queries(resource, &query.filters)?;
        Ok(self.populate_search_queries(&query.search, resource, predicate))
    }

    async fn find_all_data(&self, resource: &ResourceDescriptor, query: &FetchQuery) -> Result<Vec<Record>, AppError> {
        let query = query.normalized();
        let predicate = self.listing_predicate(resource, &query)?;
        let rows = self
            .select(resource, &predicate, Window::page(&query))
            .await
            .map_err(|e| e.context(&resource.name, "find all"))?;
        Ok(rows.into_iter().map(|r| select_fields(r, query.fields())).collect())
    }

    async fn find_all_count(&self, resource: &ResourceDescriptor, query: &FetchQuery) -> Result<u64, AppError> {
        let query = query.normalized();
        let predicate = self.listing_predicate(resource, &query)?;
        self.count(resource, &predicate)
            .await
            .map_err(|e| e.context(&resource.name, "count"))
    }

    async fn find_all(&self, resource: &ResourceDescriptor, query: &FetchQuery) -> Result<Page, AppError> {
        let normalized = query.normalized();
        let total = self.find_all_count(resource, query).await?;
        let data = self.find_all_data(resource, query).await?;
        Ok(Page::new(data, normalized.page, normalized.per_page, total))
    }

    async fn find_all_by_ids(
        &self,
        resource: &ResourceDescriptor,
        ids: &[Value],
        fields: Option<&[String]>,
    ) -> Result<Vec<Record>, AppError> {
        let predicate = Predicate::new().restrict("id", Condition::one_of(ids.iter().map(normalize_id)));
        let rows = self
            .select(resource, &predicate, Window::all())
            .await
            .map_err(|e| e.context(&resource.name, "find all by ids"))?;
        Ok(rows.into_iter().map(|r| select_fields(r, fields)).collect())
    }

    async fn find_all_belonging_to_many(
        &self,
        resource: &ResourceDescriptor,
        related: &ResourceDescriptor,
        id: &Value,
        query: &FetchQuery,
    ) -> Result<Page, AppError> {
        relation::resolve_to(resource, RelationshipKind::BelongsToMany, related)?
            .list_related(self, &normalize_id(id), query)
            .await
    }

    async fn find_all_belonging_to_many_data(
        &self,
        resource: &ResourceDescriptor,
        related: &ResourceDescriptor,
        id: &Value,
        query: &FetchQuery,
    ) -> Result<Vec<Record>, AppError> {
        relation::resolve_to(resource, RelationshipKind::BelongsToMany, related)?
            .list_related_data(self, &normalize_id(id), query)
            .await
    }

    async fn find_all_belonging_to_many_count(
        &self,
        resource: &ResourceDescriptor,
        related: &ResourceDescriptor,
        id: &Value,
        query: &FetchQuery,
    ) -> Result<u64, AppError> {
        relation::resolve_to(resource, RelationshipKind::BelongsToMany, related)?
            .count_related(self, &normalize_id(id), query)
            .await
    }

    async fn find_all_has_many(
        &self,
        resource: &ResourceDescriptor,
        related: &ResourceDescriptor,
        id: &Value,
        query: &FetchQuery,
    ) -> Result<Page, AppError> {
        relation::resolve_to(resource, RelationshipKind::HasMany, related)?
            .list_related(self, &normalize_id(id), query)
            .await
    }

    async fn find_all_has_many_data(
        &self,
        resource: &ResourceDescriptor,
        related: &ResourceDescriptor,
        id: &Value,
        query: &FetchQuery,
    ) -> Result<Vec<Record>, AppError> {
        relation::resolve_to(resource, RelationshipKind::HasMany, related)?
            .list_related_data(self, &normalize_id(id), query)
            .await
    }

    async fn find_all_has_many_count(
        &self,
        resource: &ResourceDescriptor,
        related: &ResourceDescriptor,
        id: &Value,
        query: &FetchQuery,
    ) -> Result<u64, AppError> {
        relation::resolve_to(resource, RelationshipKind::HasMany, related)?
            .count_related(self, &normalize_id(id), query)
            .await
    }

    async fn delete_by_id(&self, resource: &ResourceDescriptor, id: &Value) -> Result<bool, AppError> {
        let id = normalize_id(id);
        let removed = self
            .remove(resource, &id)
            .await
            .map_err(|e| e.context(&resource.name, "delete"))?;
        tracing::debug!(resource = %resource.name, id = %id, removed, "delete by id");
        Ok(removed)
    }

    async fn aggregate_count(&self, resource: &ResourceDescriptor, range: &AggregateRange) -> Result<f64, AppError> {
        self.aggregate(resource, Aggregate::Count, range, &[])
            .await
            .map_err(|e| e.context(&resource.name, "aggregate count"))
    }

    async fn aggregate_avg(
        &self,
        resource: &ResourceDescriptor,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError> {
        self.aggregate_columns(resource, Aggregate::Avg, range, columns).await
    }

    async fn aggregate_min(
        &self,
        resource: &ResourceDescriptor,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError> {
        self.aggregate_columns(resource, Aggregate::Min, range, columns).await
    }

    async fn aggregate_max(
        &self,
        resource: &ResourceDescriptor,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError> {
        self.aggregate_columns(resource, Aggregate::Max, range, columns).await
    }

    async fn aggregate_columns(
        &self,
        resource: &ResourceDescriptor,
        aggregate: Aggregate,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError> {
        if columns.is_empty() {
            return Err(AppError::validation("columns", "at least one column is required"));
        }
        for column in columns {
            if resource.plain_field(column).is_none() && !crate::query::IMPLICIT_FIELDS.contains(&column.as_str()) {
                return Err(AppError::validation(
                    column.clone(),
                    format!("field '{}' not found on {}", column, resource.name),
                ));
            }
        }
        self.aggregate(resource, aggregate, range, columns)
            .await
            .map_err(|e| e.context(&resource.name, "aggregate"))
    }
}

/// Fold numeric values with an aggregate. Empty input yields 0.
pub fn fold_numbers(aggregate: Aggregate, values: impl IntoIterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        return 0.0;
    }
    match aggregate {
        Aggregate::Count => values.len() as f64,
        Aggregate::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_numbers() {
        assert_eq!(fold_numbers(Aggregate::Avg, [2.0, 4.0, 9.0]), 5.0);
        assert_eq!(fold_numbers(Aggregate::Min, [2.0, -4.0]), -4.0);
        assert_eq!(fold_numbers(Aggregate::Max, [2.0, -4.0]), 2.0);
        assert_eq!(fold_numbers(Aggregate::Avg, []), 0.0);
    }

    #[test]
    fn relationship_ids_are_normalized() {
        use crate::config::{belongs_to, belongs_to_many, resource, text};
        use serde_json::json;
        let post = resource("Post").fields([text("Title"), belongs_to("Author"), belongs_to_many("Tag")]);
        let mut record = json!({"title": "7", "author": "3", "tags": ["1", 2, "2"]})
            .as_object()
            .cloned()
            .unwrap();
        normalize_relationships(&post, &mut record);
        assert_eq!(Value::Object(record), json!({"title": "7", "author": 3, "tags": [1, 2]}));

        let mut scalar = json!({"tags": "4"}).as_object().cloned().unwrap();
        normalize_relationships(&post, &mut scalar);
        assert_eq!(scalar["tags"], json!([4]));
    }

    #[test]
    fn page_window() {
        let q = FetchQuery::new().page(3).per_page(20).normalized();
        assert_eq!(Window::page(&q), Window { skip: 40, limit: Some(20) });
    }
}
