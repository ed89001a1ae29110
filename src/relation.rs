//! Relationship resolution and the queries that run through a resolved plan:
//! related listings, attach/detach, and `with_relationships` population.

use crate::config::{Registry, RelationshipKind, ResourceDescriptor};
use crate::error::AppError;
use crate::query::{Condition, FetchQuery, Predicate};
use crate::repository::{Repository, Window};
use crate::response::{normalize_id, select_fields, Page, Record};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Population paths are truncated to this many segments.
pub const MAX_POPULATE_DEPTH: usize = 3;

#[derive(Clone, Debug)]
pub struct RelationshipPlan<'a> {
    pub owner: &'a ResourceDescriptor,
    pub related: &'a ResourceDescriptor,
    pub kind: RelationshipKind,
    /// Key on the owner record holding the related id(s).
    pub owner_key: String,
    /// Key the owner would occupy on a related record.
    pub inverse_key: String,
}

/// Resolve a relationship of `owner` by field name, storage key or related slug.
pub fn resolve<'a>(
    registry: &'a Registry,
    owner: &'a ResourceDescriptor,
    name: &str,
) -> Result<RelationshipPlan<'a>, AppError> {
    for field in owner.relationship_fields() {
        let Some(rel) = field.relation() else { continue };
        let related = registry.require(&rel.target)?;
        if field.name == name || rel.storage_key() == name || related.slug == name {
            return Ok(plan(owner, related, rel.kind, rel.storage_key()));
        }
    }
    Err(AppError::Configuration(format!(
        "relationship '{}' is not declared on {}",
        name, owner.name
    )))
}

/// Resolve the relationship of `kind` from `owner` to `related`.
pub fn resolve_to<'a>(
    owner: &'a ResourceDescriptor,
    kind: RelationshipKind,
    related: &'a ResourceDescriptor,
) -> Result<RelationshipPlan<'a>, AppError> {
    let field = owner.relationship_to(kind, &related.name).ok_or_else(|| {
        AppError::Configuration(format!(
            "{} does not declare {:?} {}",
            owner.name, kind, related.name
        ))
    })?;
    Ok(plan(owner, related, kind, field.record_key()))
}

fn plan<'a>(
    owner: &'a ResourceDescriptor,
    related: &'a ResourceDescriptor,
    kind: RelationshipKind,
    owner_key: String,
) -> RelationshipPlan<'a> {
    let inverse_key = match kind {
        RelationshipKind::HasMany => owner.camel_case_name.clone(),
        RelationshipKind::BelongsTo | RelationshipKind::BelongsToMany => owner.camel_case_name_plural.clone(),
    };
    RelationshipPlan {
        owner,
        related,
        kind,
        owner_key,
        inverse_key,
    }
}

/// Related ids stored on an owner record under `key`.
pub fn stored_ids(record: &Record, key: &str) -> Vec<Value> {
    match record.get(key) {
        Some(Value::Array(ids)) => ids.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single.clone()],
    }
}

impl<'a> RelationshipPlan<'a> {
    /// Owner lookup, then `id ∈ stored ids` AND caller filters AND search.
    async fn related_predicate<R>(&self, repo: &R, owner_id: &Value, query: &FetchQuery) -> Result<Predicate, AppError>
    where
        R: Repository + ?Sized,
    {
        let owner = repo
            .find_one_by_id(self.owner, owner_id, None, &[])
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Cannot find a {} with id of {}", self.owner.name, owner_id))
            })?;
        let ids = stored_ids(&owner, &self.owner_key);
        let normalized = query.normalized();
        let predicate = repo
            .handle_filter_queries(self.related, &normalized.filters)?
            .restrict("id", Condition::one_of(ids));
        Ok(repo.populate_search_queries(&normalized.search, self.related, predicate))
    }

    pub async fn count_related<R>(&self, repo: &R, owner_id: &Value, query: &FetchQuery) -> Result<u64, AppError>
    where
        R: Repository + ?Sized,
    {
        let predicate = self.related_predicate(repo, owner_id, query).await?;
        repo.count(self.related, &predicate)
            .await
            .map_err(|e| e.context(&self.related.name, "count related"))
    }

    /// One page of related records: skip `perPage * (page - 1)`, limit `perPage`.
    pub async fn list_related_data<R>(
        &self,
        repo: &R,
        owner_id: &Value,
        query: &FetchQuery,
    ) -> Result<Vec<Record>, AppError>
    where
        R: Repository + ?Sized,
    {
        let predicate = self.related_predicate(repo, owner_id, query).await?;
        let normalized = query.normalized();
        let rows = repo
            .select(self.related, &predicate, Window::page(&normalized))
            .await
            .map_err(|e| e.context(&self.related.name, "list related"))?;
        Ok(rows
            .into_iter()
            .map(|r| select_fields(r, normalized.fields()))
            .collect())
    }

    /// Count and page fetch run as separate steps; a write in between can skew `pageCount`.
    pub async fn list_related<R>(&self, repo: &R, owner_id: &Value, query: &FetchQuery) -> Result<Page, AppError>
    where
        R: Repository + ?Sized,
    {
        let normalized = query.normalized();
        let total = self.count_related(repo, owner_id, query).await?;
        let data = self.list_related_data(repo, owner_id, query).await?;
        Ok(Page::new(data, normalized.page, normalized.per_page, total))
    }

    fn require_to_many(&self, operation: &str) -> Result<(), AppError> {
        if self.kind.is_to_many() {
            Ok(())
        } else {
            Err(AppError::validation(
                self.owner_key.clone(),
                format!("cannot {} on a {:?} relationship", operation, self.kind),
            ))
        }
    }

    pub async fn attach<R>(&self, repo: &R, owner_id: &Value, related_ids: &[Value]) -> Result<(), AppError>
    where
        R: Repository + ?Sized,
    {
        self.require_to_many("attach")?;
        let ids: Vec<Value> = related_ids.iter().map(normalize_id).collect();
        repo.attach_related(self.owner, &self.owner_key, &normalize_id(owner_id), &ids)
            .await
            .map_err(|e| e.context(&self.owner.name, "attach"))
    }

    pub async fn detach<R>(&self, repo: &R, owner_id: &Value, related_ids: &[Value]) -> Result<(), AppError>
    where
        R: Repository + ?Sized,
    {
        self.require_to_many("detach")?;
        let ids: Vec<Value> = related_ids.iter().map(normalize_id).collect();
        repo.detach_related(self.owner, &self.owner_key, &normalize_id(owner_id), &ids)
            .await
            .map_err(|e| e.context(&self.owner.name, "detach"))
    }
}

/// Dotted population paths folded into a tree, each branch cut at `MAX_POPULATE_DEPTH`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathTree(BTreeMap<String, PathTree>);

impl PathTree {
    pub fn parse<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut root = PathTree::default();
        for path in paths {
            let segments: Vec<&str> = path.as_ref().split('.').filter(|s| !s.is_empty()).collect();
            if segments.len() > MAX_POPULATE_DEPTH {
                tracing::debug!(path = path.as_ref(), "population path truncated");
            }
            let mut node = &mut root;
            for segment in segments.into_iter().take(MAX_POPULATE_DEPTH) {
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        root
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.values().map(|child| 1 + child.depth()).max().unwrap_or(0)
    }
}

type PopulateFuture<'a> = Pin<Box<dyn Future<Output = Result<Record, AppError>> + Send + 'a>>;

/// Replace relationship ids on `record` with the related records named by `tree`, recursively.
pub fn populate<'a, R>(
    repo: &'a R,
    resource: &'a ResourceDescriptor,
    mut record: Record,
    tree: &'a PathTree,
) -> PopulateFuture<'a>
where
    R: Repository + ?Sized,
{
    Box::pin(async move {
        for (segment, children) in &tree.0 {
            let plan = resolve(repo.registry(), resource, segment)?;
            let value = match plan.kind {
                RelationshipKind::BelongsTo => match record.get(&plan.owner_key) {
                    Some(id) if !id.is_null() => {
                        match repo.find_one_by_id(plan.related, id, None, &[]).await? {
                            Some(related) => Value::Object(populate(repo, plan.related, related, children).await?),
                            None => Value::Null,
                        }
                    }
                    _ => continue,
                },
                RelationshipKind::HasMany | RelationshipKind::BelongsToMany => {
                    let ids = stored_ids(&record, &plan.owner_key);
                    let mut out = Vec::new();
                    for related in repo.find_all_by_ids(plan.related, &ids, None).await? {
                        out.push(Value::Object(populate(repo, plan.related, related, children).await?));
                    }
                    Value::Array(out)
                }
            };
            record.insert(plan.owner_key.clone(), value);
        }
        Ok(record)
    })
}
