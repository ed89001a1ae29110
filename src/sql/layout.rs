//! Relational layout of a resource: one table per resource, FK columns for BelongsTo,
//! FK columns on the related table for HasMany, and a shared junction table per BelongsToMany pair.

use crate::config::{DatabaseFieldType, Registry, RelationshipKind, ResourceDescriptor};
use crate::error::AppError;

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    /// Record key the column is exposed under. `None` for FK columns owned by another
    /// resource's HasMany relationship.
    pub key: Option<String>,
    pub ddl: &'static str,
    pub cast: &'static str,
    pub nullable: bool,
    pub unique: bool,
    /// Referenced table for FK columns.
    pub references: Option<String>,
}

impl Column {
    fn implicit(name: &str, ddl: &'static str, cast: &'static str) -> Self {
        Column {
            name: name.to_string(),
            key: Some(name.to_string()),
            ddl,
            cast,
            nullable: false,
            unique: false,
            references: None,
        }
    }

    fn foreign(name: String, key: Option<String>, references: String) -> Self {
        Column {
            name,
            key,
            ddl: "BIGINT",
            cast: "bigint",
            nullable: true,
            unique: false,
            references: Some(references),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.cast, "integer" | "bigint")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Link {
    /// HasMany: `fk_column` on the related table points back at the owner.
    Foreign { fk_column: String },
    /// BelongsToMany: pairs stored in a junction table.
    Junction {
        table: String,
        owner_column: String,
        related_column: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToManyLayout {
    pub key: String,
    pub related_table: String,
    pub link: Link,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableLayout {
    pub schema: String,
    pub table: String,
    pub resource: String,
    pub columns: Vec<Column>,
    pub to_many: Vec<ToManyLayout>,
}

/// `(ddl type, cast type)` for a declared field type.
pub fn pg_type(t: DatabaseFieldType) -> (&'static str, &'static str) {
    match t {
        DatabaseFieldType::String | DatabaseFieldType::Text | DatabaseFieldType::Enum => ("TEXT", "text"),
        DatabaseFieldType::Integer => ("INTEGER", "integer"),
        DatabaseFieldType::BigInteger => ("BIGINT", "bigint"),
        DatabaseFieldType::Increments => ("BIGSERIAL", "bigint"),
        DatabaseFieldType::Boolean => ("BOOLEAN", "boolean"),
        DatabaseFieldType::Date => ("DATE", "date"),
        DatabaseFieldType::DateTime | DatabaseFieldType::Timestamp => ("TIMESTAMPTZ", "timestamptz"),
        DatabaseFieldType::Json | DatabaseFieldType::Array => ("JSONB", "jsonb"),
    }
}

pub fn fk_column(resource: &ResourceDescriptor) -> String {
    format!("{}_id", resource.snake_case_name)
}

/// Junction shared by both sides of a BelongsToMany pair: named after the two tables in sorted order.
pub fn junction(owner: &ResourceDescriptor, related: &ResourceDescriptor) -> Link {
    let mut tables = [owner.table.as_str(), related.table.as_str()];
    tables.sort_unstable();
    let owner_column = fk_column(owner);
    let related_column = if owner.name == related.name {
        format!("related_{}", fk_column(related))
    } else {
        fk_column(related)
    };
    Link::Junction {
        table: format!("{}_{}", tables[0], tables[1]),
        owner_column,
        related_column,
    }
}

impl TableLayout {
    pub fn resolve(registry: &Registry, resource: &ResourceDescriptor, schema: &str) -> Result<Self, AppError> {
        let mut columns = vec![Column {
            unique: true,
            ..Column::implicit("id", "BIGSERIAL", "bigint")
        }];

        for f in resource.plain_fields() {
            let (ddl, cast) = pg_type(f.database_field_type);
            columns.push(Column {
                name: f.database_field.clone(),
                key: Some(f.database_field.clone()),
                ddl,
                cast,
                nullable: f.is_nullable,
                unique: f.is_unique,
                references: None,
            });
        }

        let mut to_many = Vec::new();
        for f in resource.relationship_fields() {
            let Some(rel) = f.relation() else { continue };
            let related = registry.require(&rel.target)?;
            match rel.kind {
                RelationshipKind::BelongsTo => columns.push(Column::foreign(
                    fk_column(related),
                    Some(rel.storage_key()),
                    related.table.clone(),
                )),
                RelationshipKind::HasMany => to_many.push(ToManyLayout {
                    key: rel.storage_key(),
                    related_table: related.table.clone(),
                    link: Link::Foreign {
                        fk_column: fk_column(resource),
                    },
                }),
                RelationshipKind::BelongsToMany => to_many.push(ToManyLayout {
                    key: rel.storage_key(),
                    related_table: related.table.clone(),
                    link: junction(resource, related),
                }),
            }
        }

        // FK columns for other resources' HasMany pointing here
        for owner in registry.all() {
            let points_here = owner.relationship_fields().any(|f| {
                f.relation()
                    .map(|r| r.kind == RelationshipKind::HasMany && r.target == resource.name)
                    .unwrap_or(false)
            });
            let name = fk_column(owner);
            if points_here && !columns.iter().any(|c| c.name == name) {
                columns.push(Column::foreign(name, None, owner.table.clone()));
            }
        }

        columns.push(Column::implicit("created_at", "TIMESTAMPTZ", "timestamptz"));
        columns.push(Column::implicit("updated_at", "TIMESTAMPTZ", "timestamptz"));

        Ok(TableLayout {
            schema: schema.to_string(),
            table: resource.table.clone(),
            resource: resource.name.clone(),
            columns,
            to_many,
        })
    }

    /// Column exposed under a record key.
    pub fn column_for_key(&self, key: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.key.as_deref() == Some(key))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn to_many(&self, key: &str) -> Option<&ToManyLayout> {
        self.to_many.iter().find(|t| t.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{belongs_to, belongs_to_many, has_many, integer, resource, text};

    fn registry() -> Registry {
        Registry::register([
            resource("Post").fields([
                text("Title").unique(),
                integer("Views"),
                belongs_to("Author"),
                belongs_to_many("Tag"),
                has_many("Comment"),
            ]),
            resource("Tag").fields([text("Name"), belongs_to_many("Post")]),
            resource("Author").fields([text("Name")]),
            resource("Comment").fields([text("Body")]),
        ])
        .unwrap()
    }

    #[test]
    fn belongs_to_is_an_fk_column_exposed_under_the_camel_key() {
        let reg = registry();
        let layout = TableLayout::resolve(&reg, reg.find("Post").unwrap(), "public").unwrap();
        let author = layout.column_for_key("author").unwrap();
        assert_eq!(author.name, "author_id");
        assert_eq!(author.references.as_deref(), Some("authors"));
        assert!(layout.column_for_key("title").unwrap().unique);
        assert!(layout.column_for_key("tags").is_none());
    }

    #[test]
    fn belongs_to_many_pairs_share_a_junction() {
        let reg = registry();
        let post = TableLayout::resolve(&reg, reg.find("Post").unwrap(), "public").unwrap();
        let tag = TableLayout::resolve(&reg, reg.find("Tag").unwrap(), "public").unwrap();
        let Link::Junction { table: a, owner_column, related_column } = &post.to_many("tags").unwrap().link else {
            panic!("expected junction");
        };
        let Link::Junction { table: b, .. } = &tag.to_many("posts").unwrap().link else {
            panic!("expected junction");
        };
        assert_eq!(a, "posts_tags");
        assert_eq!(a, b);
        assert_eq!((owner_column.as_str(), related_column.as_str()), ("post_id", "tag_id"));
    }

    #[test]
    fn has_many_adds_hidden_fk_on_related_table() {
        let reg = registry();
        let comment = TableLayout::resolve(&reg, reg.find("Comment").unwrap(), "public").unwrap();
        let fk = comment.column("post_id").unwrap();
        assert_eq!(fk.key, None);
        let post = TableLayout::resolve(&reg, reg.find("Post").unwrap(), "public").unwrap();
        assert_eq!(
            post.to_many("comments").unwrap().link,
            Link::Foreign { fk_column: "post_id".into() }
        );
    }
}
