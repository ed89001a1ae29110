//! PostgreSQL backend. Statements come from `crate::sql`; rows are decoded by column type and
//! re-keyed to record keys, with to-many id sets batch-loaded per page.

use crate::config::{Registry, ResourceDescriptor, Settings};
use crate::error::{AppError, ConfigError};
use crate::migration;
use crate::query::{Aggregate, AggregateRange, Predicate};
use crate::repository::{Repository, Window};
use crate::response::Record;
use crate::sql::{
    aggregate_columns, aggregate_count, count_where, delete, insert, link_to_many, select_by_id,
    select_to_many_ids, select_where, unlink_to_many, update, AggregateFn, Column, PgBindValue, QueryBuf,
    TableLayout,
};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{ConnectOptions, PgPool, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

pub struct PgRepository {
    pool: PgPool,
    registry: Arc<Registry>,
    layouts: HashMap<String, TableLayout>,
}

fn bind_all<'q>(
    sql: &'q str,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(sql);
    for p in params {
        query = query.bind(PgBindValue::from_json(p));
    }
    query
}

impl PgRepository {
    /// Resolve a table layout for every registered resource.
    pub fn new(pool: PgPool, registry: Arc<Registry>, schema: &str) -> Result<Self, AppError> {
        let mut layouts = HashMap::new();
        for resource in registry.all() {
            layouts.insert(resource.name.clone(), TableLayout::resolve(&registry, resource, schema)?);
        }
        Ok(PgRepository {
            pool,
            registry,
            layouts,
        })
    }

    /// Create the database if missing, open a pool and resolve layouts.
    pub async fn connect(settings: &Settings, registry: Arc<Registry>) -> Result<Self, AppError> {
        ensure_database_exists(&settings.database_url).await?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.database_url)
            .await?;
        Self::new(pool, registry, &settings.schema)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn layout(&self, resource: &ResourceDescriptor) -> Result<&TableLayout, AppError> {
        self.layouts
            .get(&resource.name)
            .ok_or_else(|| AppError::Configuration(format!("resource '{}' is not registered", resource.name)))
    }

    async fn fetch_rows(&self, q: &QueryBuf) -> Result<Vec<PgRow>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        Ok(bind_all(&q.sql, &q.params).fetch_all(&self.pool).await?)
    }

    /// Decode rows and attach the id set of every to-many relationship.
    async fn hydrate(&self, layout: &TableLayout, rows: Vec<PgRow>) -> Result<Vec<Record>, AppError> {
        let mut records = rows
            .iter()
            .map(|row| row_to_record(layout, row))
            .collect::<Result<Vec<_>, _>>()?;
        if records.is_empty() || layout.to_many.is_empty() {
            return Ok(records);
        }
        let owner_ids: Vec<Value> = records.iter().filter_map(|r| r.get("id").cloned()).collect();
        for to_many in &layout.to_many {
            let q = select_to_many_ids(layout, to_many, &owner_ids);
            let mut grouped: HashMap<i64, Vec<Value>> = HashMap::new();
            for row in self.fetch_rows(&q).await? {
                let owner: i64 = row.try_get("owner_id")?;
                let related: i64 = row.try_get("related_id")?;
                grouped.entry(owner).or_default().push(Value::from(related));
            }
            for record in &mut records {
                let ids = record
                    .get("id")
                    .and_then(Value::as_i64)
                    .and_then(|id| grouped.remove(&id))
                    .unwrap_or_default();
                record.insert(to_many.key.clone(), Value::Array(ids));
            }
        }
        Ok(records)
    }

    /// Replace (or extend, when `replace` is false) to-many links named in `record`.
    async fn write_links(
        tx: &mut sqlx::PgConnection,
        layout: &TableLayout,
        id: &Value,
        record: &Record,
        replace: bool,
    ) -> Result<(), AppError> {
        for to_many in &layout.to_many {
            let Some(value) = record.get(&to_many.key) else { continue };
            let ids: Vec<Value> = match value {
                Value::Array(ids) => ids.clone(),
                Value::Null => Vec::new(),
                single => vec![single.clone()],
            };
            if replace {
                let q = unlink_to_many(layout, to_many, id, None);
                tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
                bind_all(&q.sql, &q.params).execute(&mut *tx).await?;
            }
            for q in link_to_many(layout, to_many, id, &ids) {
                tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
                bind_all(&q.sql, &q.params)
                    .execute(&mut *tx)
                    .await
                    .map_err(AppError::from_db)?;
            }
        }
        Ok(())
    }

    async fn scalar_f64(&self, q: &QueryBuf) -> Result<f64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query_scalar::<_, f64>(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        Ok(query.fetch_one(&self.pool).await?)
    }
}

#[async_trait]
impl Repository for PgRepository {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn materialize(&self) -> Result<(), AppError> {
        let mut layouts: Vec<&TableLayout> = Vec::new();
        for resource in self.registry.all() {
            layouts.push(self.layout(resource)?);
        }
        migration::materialize(&self.pool, &layouts).await
    }

    async fn insert(&self, resource: &ResourceDescriptor, record: Record) -> Result<Record, AppError> {
        let layout = self.layout(resource)?;
        let mut tx = self.pool.begin().await?;
        let q = insert(layout, &record);
        tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
        let row = bind_all(&q.sql, &q.params)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::from_db)?;
        let created = row_to_record(layout, &row)?;
        let id = created.get("id").cloned().unwrap_or(Value::Null);
        Self::write_links(&mut tx, layout, &id, &record, false).await?;
        tx.commit().await?;
        let rows = self.fetch_rows(&select_by_id_for(layout, &id)).await?;
        Ok(self.hydrate(layout, rows).await?.into_iter().next().unwrap_or(created))
    }

    async fn modify(
        &self,
        resource: &ResourceDescriptor,
        id: &Value,
        changes: Record,
    ) -> Result<Option<Record>, AppError> {
        let layout = self.layout(resource)?;
        let mut tx = self.pool.begin().await?;
        let q = update(layout, id, &changes);
        tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
        let row = bind_all(&q.sql, &q.params)
            .fetch_optional(&mut *tx)
            .await
            .map_err(AppError::from_db)?;
        if row.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }
        Self::write_links(&mut tx, layout, id, &changes, true).await?;
        tx.commit().await?;
        let rows = self.fetch_rows(&select_by_id_for(layout, id)).await?;
        Ok(self.hydrate(layout, rows).await?.into_iter().next())
    }

    async fn select(
        &self,
        resource: &ResourceDescriptor,
        predicate: &Predicate,
        window: Window,
    ) -> Result<Vec<Record>, AppError> {
        let layout = self.layout(resource)?;
        let q = select_where(layout, predicate, window.limit, Some(window.skip))?;
        let rows = self.fetch_rows(&q).await?;
        self.hydrate(layout, rows).await
    }

    async fn count(&self, resource: &ResourceDescriptor, predicate: &Predicate) -> Result<u64, AppError> {
        let layout = self.layout(resource)?;
        let q = count_where(layout, predicate)?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query_scalar::<_, i64>(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        let n = query.fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    /// Junction rows cascade and FK columns are nulled by the constraints `materialize` creates.
    async fn remove(&self, resource: &ResourceDescriptor, id: &Value) -> Result<bool, AppError> {
        let layout = self.layout(resource)?;
        let q = delete(layout);
        tracing::debug!(sql = %q.sql, id = %id, "query");
        let row = sqlx::query(&q.sql)
            .bind(PgBindValue::from_json(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn attach_related(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        id: &Value,
        related_ids: &[Value],
    ) -> Result<(), AppError> {
        let layout = self.layout(resource)?;
        if self.fetch_rows(&select_by_id_for(layout, id)).await?.is_empty() {
            return Err(AppError::NotFound(format!(
                "Cannot find a {} with id of {}",
                resource.name, id
            )));
        }
        let mut record = Record::new();
        record.insert(key.to_string(), Value::Array(related_ids.to_vec()));
        let mut tx = self.pool.begin().await?;
        Self::write_links(&mut tx, layout, id, &record, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn detach_related(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        id: &Value,
        related_ids: &[Value],
    ) -> Result<(), AppError> {
        let layout = self.layout(resource)?;
        let to_many = layout
            .to_many(key)
            .ok_or_else(|| AppError::validation(key, format!("'{}' is not a to-many relationship", key)))?;
        let q = unlink_to_many(layout, to_many, id, Some(related_ids));
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        bind_all(&q.sql, &q.params).execute(&self.pool).await?;
        Ok(())
    }

    async fn aggregate(
        &self,
        resource: &ResourceDescriptor,
        aggregate: Aggregate,
        range: &AggregateRange,
        columns: &[String],
    ) -> Result<f64, AppError> {
        let layout = self.layout(resource)?;
        let q = match aggregate {
            Aggregate::Count => aggregate_count(layout, range),
            Aggregate::Avg => aggregate_columns(layout, AggregateFn::Avg, range, columns)?,
            Aggregate::Min => aggregate_columns(layout, AggregateFn::Min, range, columns)?,
            Aggregate::Max => aggregate_columns(layout, AggregateFn::Max, range, columns)?,
        };
        self.scalar_f64(&q).await
    }
}

fn select_by_id_for(layout: &TableLayout, id: &Value) -> QueryBuf {
    let mut q = select_by_id(layout);
    q.params.push(id.clone());
    q
}

/// Exposed columns re-keyed to record keys. FK columns of other resources' HasMany are skipped.
fn row_to_record(layout: &TableLayout, row: &PgRow) -> Result<Record, AppError> {
    let mut record = Record::new();
    for column in &layout.columns {
        let Some(key) = column.key.as_deref() else { continue };
        record.insert(key.to_string(), cell_to_value(row, column)?);
    }
    Ok(record)
}

fn cell_to_value(row: &PgRow, column: &Column) -> Result<Value, AppError> {
    let name = column.name.as_str();
    Ok(match column.cast {
        "bigint" => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
        "integer" => row.try_get::<Option<i32>, _>(name)?.map(Value::from),
        "boolean" => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        "date" => row
            .try_get::<Option<chrono::NaiveDate>, _>(name)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        "timestamptz" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)?
            .map(|d| Value::String(d.to_rfc3339_opts(SecondsFormat::Micros, true))),
        "jsonb" => row.try_get::<Option<Value>, _>(name)?,
        _ => row.try_get::<Option<String>, _>(name)?.map(Value::String),
    }
    .unwrap_or(Value::Null))
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| ConfigError::Settings(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", crate::sql::quoted(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), ConfigError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| ConfigError::Settings("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres", base), db_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_database_name_from_url() {
        let (admin, name) = parse_db_name_from_url("postgres://u:p@db:5432/blog?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@db:5432/postgres");
        assert_eq!(name, "blog");
        assert!(parse_db_name_from_url("nopath").is_err());
    }
}
