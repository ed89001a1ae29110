//! In-process document store: one collection of JSON documents per resource, keyed by `_id`.

use crate::config::{Registry, RelationshipKind, ResourceDescriptor};
use crate::error::AppError;
use crate::query::document::values_equal;
use crate::query::{Aggregate, AggregateRange, DocumentFilter, Predicate};
use crate::relation::stored_ids;
use crate::repository::{fold_numbers, Repository, Window};
use crate::response::{rekey_id, Record};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

const NATIVE_ID: &str = "_id";

#[derive(Debug, Default)]
struct Collection {
    last_id: i64,
    docs: BTreeMap<i64, Record>,
}

pub struct DocumentRepository {
    registry: Arc<Registry>,
    collections: RwLock<HashMap<String, Collection>>,
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn doc_id(id: &Value) -> Option<i64> {
    id.as_i64()
}

fn created_at(doc: &Record) -> Option<DateTime<Utc>> {
    doc.get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn normalized(doc: &Record) -> Record {
    rekey_id(doc.clone(), NATIVE_ID)
}

fn doc_mut<'a>(
    collections: &'a mut HashMap<String, Collection>,
    resource: &ResourceDescriptor,
    id: &Value,
) -> Option<&'a mut Record> {
    let key = doc_id(id)?;
    collections.get_mut(&resource.table)?.docs.get_mut(&key)
}

/// Drop `id` from a reference slot: a matching BelongsTo becomes null, arrays lose the id.
fn unlink(doc: &mut Record, key: &str, kind: RelationshipKind, id: &Value) {
    match (kind, doc.get_mut(key)) {
        (RelationshipKind::BelongsTo, Some(v)) if values_equal(v, id) => *v = Value::Null,
        (_, Some(Value::Array(ids))) => ids.retain(|v| !values_equal(v, id)),
        _ => {}
    }
}

fn link(doc: &mut Record, key: &str, related_ids: &[Value]) {
    let slot = doc.entry(key.to_string()).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(ids) = slot {
        for rid in related_ids {
            if !contains_id(ids, rid) {
                ids.push(rid.clone());
            }
        }
    }
}

fn contains_id(ids: &[Value], id: &Value) -> bool {
    ids.iter().any(|v| values_equal(v, id))
}

fn inverse_kind(kind: RelationshipKind) -> RelationshipKind {
    match kind {
        RelationshipKind::BelongsTo => RelationshipKind::HasMany,
        RelationshipKind::HasMany => RelationshipKind::BelongsTo,
        RelationshipKind::BelongsToMany => RelationshipKind::BelongsToMany,
    }
}

/// Mirror the relationship keys that changed between `before` and `after` onto the related
/// documents, wherever the target declares the inverse relation. PostgreSQL gets the same
/// result from the shared FK column or junction table.
fn sync_inverse(
    registry: &Registry,
    collections: &mut HashMap<String, Collection>,
    resource: &ResourceDescriptor,
    id: &Value,
    before: &Record,
    after: &Record,
) {
    for field in resource.relationship_fields() {
        let Some(rel) = field.relation() else { continue };
        let key = rel.storage_key();
        if before.get(&key) == after.get(&key) {
            continue;
        }
        // self junctions are one-directional
        if rel.kind == RelationshipKind::BelongsToMany && rel.target == resource.name {
            continue;
        }
        let Some(target) = registry.find(&rel.target) else { continue };
        let Some(inverse) = target
            .relationship_to(inverse_kind(rel.kind), &resource.name)
            .and_then(|f| f.relation())
        else {
            continue;
        };
        let inverse_key = inverse.storage_key();

        let old = stored_ids(before, &key);
        let new = stored_ids(after, &key);

        for rid in old.iter().filter(|v| !contains_id(&new, v)) {
            if let Some(related) = doc_mut(collections, target, rid) {
                unlink(related, &inverse_key, inverse.kind, id);
            }
        }
        for rid in new.iter().filter(|v| !contains_id(&old, v)) {
            let Some(related) = doc_mut(collections, target, rid) else { continue };
            if inverse.kind != RelationshipKind::BelongsTo {
                link(related, &inverse_key, std::slice::from_ref(id));
                continue;
            }
            // a BelongsTo has one owner: the previous one gives the member up
            let previous = related.insert(inverse_key.clone(), id.clone());
            if let Some(prev) = previous.filter(|p| !p.is_null() && !values_equal(p, id)) {
                if let Some(owner) = doc_mut(collections, resource, &prev) {
                    unlink(owner, &key, rel.kind, rid);
                }
            }
        }
    }
}

impl DocumentRepository {
    pub fn new(registry: Arc<Registry>) -> Self {
        DocumentRepository {
            registry,
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn missing(resource: &ResourceDescriptor, id: &Value) -> AppError {
        AppError::NotFound(format!("Cannot find a {} with id of {}", resource.name, id))
    }
}

#[async_trait]
impl Repository for DocumentRepository {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn materialize(&self) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        for resource in self.registry.all() {
            collections.entry(resource.table.clone()).or_default();
        }
        tracing::info!(collections = collections.len(), "document collections ready");
        Ok(())
    }

    async fn insert(&self, resource: &ResourceDescriptor, mut record: Record) -> Result<Record, AppError> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(resource.table.clone()).or_default();
        collection.last_id += 1;
        let id = collection.last_id;
        let stamp = now();
        record.insert(NATIVE_ID.into(), Value::from(id));
        record.insert("created_at".into(), stamp.clone());
        record.insert("updated_at".into(), stamp);
        collection.docs.insert(id, record.clone());
        sync_inverse(&self.registry, &mut collections, resource, &Value::from(id), &Record::new(), &record);
        tracing::debug!(collection = %resource.table, id, "insert document");
        Ok(normalized(&record))
    }

    async fn modify(
        &self,
        resource: &ResourceDescriptor,
        id: &Value,
        changes: Record,
    ) -> Result<Option<Record>, AppError> {
        let mut collections = self.collections.write().await;
        let Some(doc) = doc_mut(&mut collections, resource, id) else {
            return Ok(None);
        };
        let before = doc.clone();
        doc.extend(changes);
        doc.insert("updated_at".into(), now());
        let after = doc.clone();
        sync_inverse(&self.registry, &mut collections, resource, id, &before, &after);
        tracing::debug!(collection = %resource.table, id = %id, "update document");
        Ok(Some(normalized(&after)))
    }

    async fn select(
        &self,
        resource: &ResourceDescriptor,
        predicate: &Predicate,
        window: Window,
    ) -> Result<Vec<Record>, AppError> {
        let filter = DocumentFilter::from_predicate(predicate)?;
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&resource.table) else {
            return Ok(Vec::new());
        };
        let matching = collection
            .docs
            .values()
            .map(normalized)
            .filter(|r| filter.matches(r))
            .skip(usize::try_from(window.skip).unwrap_or(usize::MAX));
        Ok(match window.limit {
            Some(limit) => matching
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .collect(),
            None => matching.collect(),
        })
    }

    async fn count(&self, resource: &ResourceDescriptor, predicate: &Predicate) -> Result<u64, AppError> {
        let filter = DocumentFilter::from_predicate(predicate)?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(&resource.table)
            .map(|c| c.docs.values().filter(|d| filter.matches(&normalized(d))).count() as u64)
            .unwrap_or(0))
    }

    async fn remove(&self, resource: &ResourceDescriptor, id: &Value) -> Result<bool, AppError> {
        let Some(key) = doc_id(id) else { return Ok(false) };
        let mut collections = self.collections.write().await;
        let removed = collections
            .get_mut(&resource.table)
            .and_then(|c| c.docs.remove(&key))
            .is_some();
        if !removed {
            return Ok(false);
        }

        // drop dangling references held by other documents
        for owner in self.registry.all() {
            for field in owner.relationship_fields() {
                let Some(rel) = field.relation() else { continue };
                if rel.target != resource.name {
                    continue;
                }
                let storage_key = rel.storage_key();
                let Some(collection) = collections.get_mut(&owner.table) else { continue };
                for doc in collection.docs.values_mut() {
                    unlink(doc, &storage_key, rel.kind, id);
                }
            }
        }
        Ok(true)
    }

    async fn attach_related(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        id: &Value,
        related_ids: &[Value],
    ) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        let doc = doc_mut(&mut collections, resource, id).ok_or_else(|| Self::missing(resource, id))?;
        let before = doc.clone();
        link(doc, key, related_ids);
        doc.insert("updated_at".into(), now());
        let after = doc.clone();
        sync_inverse(&self.registry, &mut collections, resource, id, &before, &after);
        Ok(())
    }

    async fn detach_related(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        id: &Value,
        related_ids: &[Value],
    ) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        let doc = doc_mut(&mut collections, resource, id).ok_or_else(|| Self::missing(resource, id))?;
        let before = doc.clone();
        if let Some(Value::Array(ids)) = doc.get_mut(key) {
            ids.retain(|v| !related_ids.iter().any(|r| values_equal(v, r)));
        }
        doc.insert("updated_at".into(), now());
        let after = doc.clone();
        sync_inverse(&self.registry, &mut collections, resource, id, &before, &after);
        Ok(())
    }

    async fn aggregate(
        &self,
        resource: &ResourceDescriptor,
        aggregate: Aggregate,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&resource.table) else {
            return Ok(0.0);
        };
        let in_range: Vec<&Record> = collection
            .docs
            .values()
            .filter(|d| created_at(d).map(|at| range.contains(at)).unwrap_or(false))
            .collect();
        if aggregate == Aggregate::Count {
            return Ok(in_range.len() as f64);
        }
        let values = in_range
            .iter()
            .flat_map(|d| columns.iter().filter_map(move |c| d.get(c.as_str()).and_then(Value::as_f64)));
        Ok(fold_numbers(aggregate, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{belongs_to, belongs_to_many, has_many, resource, text};
    use crate::query::FetchQuery;
    use serde_json::json;

    fn repo() -> DocumentRepository {
        let registry = Registry::register([
            resource("Post").fields([text("Title"), belongs_to_many("Tag")]),
            resource("Tag").fields([text("Name")]),
        ])
        .unwrap();
        DocumentRepository::new(Arc::new(registry))
    }

    fn payload(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    async fn stored(repo: &DocumentRepository, name: &str, id: i64) -> Record {
        let resource = repo.registry().require(name).unwrap().clone();
        repo.find_one_by_id(&resource, &json!(id), None, &[]).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn native_id_is_rekeyed() {
        let repo = repo();
        let post = repo.registry().require("Post").unwrap().clone();
        let created = repo
            .create(&post, payload(json!({"title": "Hello"})), Record::new())
            .await
            .unwrap();
        assert_eq!(created.get("id"), Some(&json!(1)));
        assert!(!created.contains_key("_id"));
        assert_eq!(created.get("tags"), Some(&json!([])));
        assert!(created.get("created_at").and_then(Value::as_str).is_some());
    }

    #[tokio::test]
    async fn attach_is_idempotent_and_detach_removes() {
        let repo = repo();
        let post = repo.registry().require("Post").unwrap().clone();
        repo.create(&post, payload(json!({"title": "A"})), Record::new())
            .await
            .unwrap();
        repo.attach_related(&post, "tags", &json!(1), &[json!(1), json!(2)])
            .await
            .unwrap();
        repo.attach_related(&post, "tags", &json!(1), &[json!(2)])
            .await
            .unwrap();
        let found = repo.find_one_by_id(&post, &json!(1), None, &[]).await.unwrap().unwrap();
        assert_eq!(found.get("tags"), Some(&json!([1, 2])));

        repo.detach_related(&post, "tags", &json!(1), &[json!(1)])
            .await
            .unwrap();
        let found = repo.find_one_by_id(&post, &json!("1"), None, &[]).await.unwrap().unwrap();
        assert_eq!(found.get("tags"), Some(&json!([2])));

        let err = repo
            .attach_related(&post, "tags", &json!(99), &[json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn inverse_keys_follow_writes() {
        let registry = Registry::register([
            resource("Post").fields([text("Title"), belongs_to_many("Tag"), has_many("Comment")]),
            resource("Tag").fields([text("Name"), belongs_to_many("Post")]),
            resource("Comment").fields([text("Body"), belongs_to("Post")]),
        ])
        .unwrap();
        let repo = DocumentRepository::new(Arc::new(registry));
        let post = repo.registry().require("Post").unwrap().clone();
        let tag = repo.registry().require("Tag").unwrap().clone();
        let comment = repo.registry().require("Comment").unwrap().clone();

        repo.insert(&tag, payload(json!({"name": "rust"}))).await.unwrap();
        repo.insert(&post, payload(json!({"title": "A", "tags": [1]}))).await.unwrap();
        repo.insert(&post, payload(json!({"title": "B"}))).await.unwrap();
        repo.insert(&comment, payload(json!({"body": "hi", "post": 1}))).await.unwrap();

        assert_eq!(stored(&repo, "Tag", 1).await["posts"], json!([1]));
        assert_eq!(stored(&repo, "Post", 1).await["comments"], json!([1]));

        // moving the comment through the to-many side releases the old owner
        repo.modify(&post, &json!(2), payload(json!({"comments": [1]}))).await.unwrap();
        assert_eq!(stored(&repo, "Comment", 1).await["post"], json!(2));
        assert_eq!(stored(&repo, "Post", 1).await["comments"], json!([]));

        repo.modify(&comment, &json!(1), payload(json!({"post": null}))).await.unwrap();
        assert_eq!(stored(&repo, "Post", 2).await["comments"], json!([]));

        repo.detach_related(&tag, "posts", &json!(1), &[json!(1)]).await.unwrap();
        assert_eq!(stored(&repo, "Post", 1).await["tags"], json!([]));
        repo.attach_related(&post, "tags", &json!(2), &[json!(1)]).await.unwrap();
        assert_eq!(stored(&repo, "Tag", 1).await["posts"], json!([2]));
    }

    #[tokio::test]
    async fn listing_before_materialize_is_empty() {
        let repo = repo();
        let tag = repo.registry().require("Tag").unwrap().clone();
        let page = repo.find_all(&tag, &FetchQuery::new()).await.unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(page.page_count, 0);
        repo.materialize().await.unwrap();
        assert_eq!(repo.find_all_count(&tag, &FetchQuery::new()).await.unwrap(), 0);
    }
}
