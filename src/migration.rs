//! Materialize resource storage in PostgreSQL: schema, one table per resource, unique
//! constraints, foreign keys, and junction tables. Order follows PostgreSQL dependencies.

use crate::error::AppError;
use crate::sql::{qualified_table, quoted, Link, TableLayout};
use sqlx::PgPool;
use std::collections::HashSet;

/// CREATE TABLE for a resource. Existing tables are kept.
pub fn create_table_sql(layout: &TableLayout) -> String {
    let mut defs: Vec<String> = Vec::new();
    for c in &layout.columns {
        let mut def = format!("{} {}", quoted(&c.name), c.ddl);
        if matches!(c.name.as_str(), "created_at" | "updated_at") {
            def.push_str(" NOT NULL DEFAULT NOW()");
        } else if !c.nullable && c.name != "id" {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
    }
    defs.push(format!("PRIMARY KEY ({})", quoted("id")));
    for c in layout.columns.iter().filter(|c| c.unique && c.name != "id") {
        defs.push(format!("UNIQUE ({})", quoted(&c.name)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        qualified_table(&layout.schema, &layout.table),
        defs.join(",\n  ")
    )
}

/// ADD COLUMN IF NOT EXISTS for every non-key column, so fields declared later reach existing tables.
pub fn add_column_sql(layout: &TableLayout) -> Vec<String> {
    layout
        .columns
        .iter()
        .filter(|c| c.name != "id")
        .map(|c| {
            let default = if matches!(c.name.as_str(), "created_at" | "updated_at") {
                " NOT NULL DEFAULT NOW()"
            } else {
                ""
            };
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}{}",
                qualified_table(&layout.schema, &layout.table),
                quoted(&c.name),
                c.ddl,
                default
            )
        })
        .collect()
}

/// FK constraints for BelongsTo and HasMany columns. Deleting the referenced row nulls the column.
pub fn foreign_key_sql(layout: &TableLayout) -> Vec<String> {
    layout
        .columns
        .iter()
        .filter_map(|c| {
            let target = c.references.as_deref()?;
            Some(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE SET NULL",
                qualified_table(&layout.schema, &layout.table),
                quoted(&format!("{}_{}_fkey", layout.table, c.name)),
                quoted(&c.name),
                qualified_table(&layout.schema, target),
                quoted("id")
            ))
        })
        .collect()
}

/// Junction tables for BelongsToMany. Deleting either side cascades to its pairs.
pub fn junction_sql(layout: &TableLayout) -> Vec<(String, String)> {
    layout
        .to_many
        .iter()
        .filter_map(|t| match &t.link {
            Link::Junction {
                table,
                owner_column,
                related_column,
            } => Some((
                table.clone(),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (\n  {} BIGINT NOT NULL REFERENCES {} ({}) ON DELETE CASCADE,\n  {} BIGINT NOT NULL REFERENCES {} ({}) ON DELETE CASCADE,\n  PRIMARY KEY ({}, {})\n)",
                    qualified_table(&layout.schema, table),
                    quoted(owner_column),
                    qualified_table(&layout.schema, &layout.table),
                    quoted("id"),
                    quoted(related_column),
                    qualified_table(&layout.schema, &t.related_table),
                    quoted("id"),
                    quoted(owner_column),
                    quoted(related_column)
                ),
            )),
            Link::Foreign { .. } => None,
        })
        .collect()
}

/// SQLSTATE 42710 (duplicate_object): the constraint exists from an earlier boot.
fn is_duplicate_object(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "42710")
        .unwrap_or(false)
}

fn fatal(step: &str) -> impl Fn(sqlx::Error) -> AppError + '_ {
    move |e| AppError::FatalBoot(format!("{}: {}", step, e))
}

/// Create schema, tables, FK constraints and junctions for every layout.
/// Idempotent: tables and junctions use IF NOT EXISTS; an existing FK constraint is skipped,
/// any other failure is `FatalBoot`.
pub async fn materialize(pool: &PgPool, layouts: &[&TableLayout]) -> Result<(), AppError> {
    let mut schemas = HashSet::new();
    for layout in layouts {
        if schemas.insert(layout.schema.as_str()) {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(&layout.schema)))
                .execute(pool)
                .await
                .map_err(fatal("create schema"))?;
        }
    }

    for layout in layouts {
        let sql = create_table_sql(layout);
        tracing::debug!(sql = %sql, "materialize");
        sqlx::query(&sql)
            .execute(pool)
            .await
            .map_err(fatal("create table"))?;
        for sql in add_column_sql(layout) {
            sqlx::query(&sql)
                .execute(pool)
                .await
                .map_err(fatal("add column"))?;
        }
    }

    for layout in layouts {
        for sql in foreign_key_sql(layout) {
            match sqlx::query(&sql).execute(pool).await {
                Ok(_) => {}
                Err(e) if is_duplicate_object(&e) => {
                    tracing::debug!(table = %layout.table, "foreign key already present");
                }
                Err(e) => return Err(fatal("add foreign key")(e)),
            }
        }
    }

    let mut junctions = HashSet::new();
    for layout in layouts {
        for (table, sql) in junction_sql(layout) {
            if junctions.insert(table) {
                sqlx::query(&sql)
                    .execute(pool)
                    .await
                    .map_err(fatal("create junction"))?;
            }
        }
    }

    tracing::info!(tables = layouts.len(), junctions = junctions.len(), "schema materialized");
    Ok(())
}
