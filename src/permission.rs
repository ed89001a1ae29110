//! Permission bootstrap: derive CRUD and action permissions for every resource, persist the
//! missing ones, and grant the full set to the super-admin role on each boot.

use crate::case;
use crate::config::system::{SUPER_ADMIN_NAME, SUPER_ADMIN_SLUG};
use crate::config::{Registry, RelationshipKind, ResourceDescriptor};
use crate::error::AppError;
use crate::query::{compile, Filter, Operator, Predicate};
use crate::relation;
use crate::repository::{Repository, Window};
use crate::response::Record;
use serde_json::{json, Value};
use std::collections::HashSet;

const CRUD: [&str; 4] = ["create", "read", "update", "delete"];

#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapReport {
    /// Distinct permission slugs derived from the registry.
    pub derived: usize,
    /// Permission records created by this run.
    pub inserted: usize,
    pub super_admin_id: Value,
}

/// `create:slug`, `read:slug`, `update:slug`, `delete:slug`, then `run:slug:action` per action.
pub fn resource_permissions(resource: &ResourceDescriptor) -> Vec<String> {
    let crud = CRUD.iter().map(|verb| format!("{}:{}", verb, resource.slug));
    let actions = resource
        .actions
        .iter()
        .map(|a| format!("run:{}:{}", resource.slug, a.slug));
    crud.chain(actions).collect()
}

/// Every permission slug in registry order, without duplicates.
pub fn derive_permissions(registry: &Registry) -> Vec<String> {
    let mut seen = HashSet::new();
    registry
        .all()
        .iter()
        .flat_map(resource_permissions)
        .filter(|slug| seen.insert(slug.clone()))
        .collect()
}

/// "run:blog-post:publish" -> "Run blog post publish"
pub fn permission_name(slug: &str) -> String {
    case::sentence_case(&slug.replace(':', " "))
}

fn fatal(e: AppError) -> AppError {
    match e {
        AppError::FatalBoot(_) => e,
        other => AppError::FatalBoot(format!("permission bootstrap: {}", other)),
    }
}

fn ids_of(records: &[Record]) -> Vec<Value> {
    records.iter().filter_map(|r| r.get("id").cloned()).collect()
}

async fn super_admin<R>(repo: &R, role: &ResourceDescriptor) -> Result<Option<Record>, AppError>
where
    R: Repository + ?Sized,
{
    repo.find_one_by_field(role, "slug", &json!(SUPER_ADMIN_SLUG), None)
        .await
}

async fn run<R>(registry: &Registry, repo: &R) -> Result<BootstrapReport, AppError>
where
    R: Repository + ?Sized,
{
    let permission = registry.permission()?;
    let role = registry.role()?;

    let derived = derive_permissions(registry);
    let existing_filter = compile(
        permission,
        &[Filter::new("slug", Operator::In, Value::Array(derived.iter().map(|s| json!(s)).collect()))],
    )?;
    let existing: HashSet<String> = repo
        .select(permission, &existing_filter, Window::all())
        .await?
        .iter()
        .filter_map(|r| r.get("slug").and_then(Value::as_str).map(str::to_string))
        .collect();

    let mut inserted = 0;
    for slug in derived.iter().filter(|s| !existing.contains(*s)) {
        let mut record = Record::new();
        record.insert("name".into(), json!(permission_name(slug)));
        record.insert("slug".into(), json!(slug));
        repo.create(permission, record, Record::new()).await?;
        inserted += 1;
    }

    let role_record = match super_admin(repo, role).await? {
        Some(found) => found,
        None => {
            let mut record = Record::new();
            record.insert("name".into(), json!(SUPER_ADMIN_NAME));
            record.insert("slug".into(), json!(SUPER_ADMIN_SLUG));
            tracing::info!("creating super-admin role");
            repo.create(role, record, Record::new()).await?
        }
    };
    let super_admin_id = role_record.get("id").cloned().unwrap_or(Value::Null);

    let all_permissions = repo.select(permission, &Predicate::new(), Window::all()).await?;
    let grant = relation::resolve_to(role, RelationshipKind::BelongsToMany, permission)?;
    let mut relationships = Record::new();
    relationships.insert(grant.owner_key.clone(), Value::Array(ids_of(&all_permissions)));
    repo.update(role, &super_admin_id, Record::new(), relationships).await?;

    Ok(BootstrapReport {
        derived: derived.len(),
        inserted,
        super_admin_id,
    })
}

/// Persist missing permissions and grant them all to the super-admin role.
/// Stale permissions are left in place. Any failure is `FatalBoot`.
pub async fn bootstrap_permissions<R>(registry: &Registry, repo: &R) -> Result<BootstrapReport, AppError>
where
    R: Repository + ?Sized,
{
    let report = run(registry, repo).await.map_err(fatal)?;
    tracing::info!(
        derived = report.derived,
        inserted = report.inserted,
        super_admin = %report.super_admin_id,
        "permissions bootstrapped"
    );
    Ok(report)
}

/// Create an administrator attached to the super-admin role.
pub async fn create_administrator<R>(registry: &Registry, repo: &R, payload: Record) -> Result<Record, AppError>
where
    R: Repository + ?Sized,
{
    let administrator = registry.administrator()?;
    let role = registry.role()?;
    let role_record = super_admin(repo, role).await?.ok_or_else(|| {
        AppError::validation(
            "administratorRoles",
            "the super-admin role does not exist yet; bootstrap permissions first",
        )
    })?;
    let role_id = role_record.get("id").cloned().unwrap_or(Value::Null);

    let membership = relation::resolve_to(administrator, RelationshipKind::BelongsToMany, role)?;
    let mut relationships = Record::new();
    relationships.insert(membership.owner_key.clone(), json!([role_id]));
    let created = repo.create(administrator, payload, relationships).await?;
    tracing::info!(id = ?created.get("id"), "administrator created");
    Ok(created)
}
