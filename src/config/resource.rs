//! Resource and action descriptors. Built once with value-returning builders, then frozen into the registry.

use crate::case;
use crate::config::field::{FieldDescriptor, RelationshipKind};
use crate::error::AppError;
use crate::response::Record;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Pure payload transform applied before persisting.
pub type Hook = Arc<dyn Fn(Record) -> Record + Send + Sync>;

pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Value, AppError>> + Send>>;

/// Opaque action body. The core only invokes it; it never inspects the result.
pub type ActionHandler = Arc<dyn Fn(ActionContext) -> ActionFuture + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ActionContext {
    pub resource_slug: String,
    pub payload: Record,
}

#[derive(Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub slug: String,
    pub fields: Vec<FieldDescriptor>,
    pub is_standalone: bool,
    pub is_destructive: bool,
    pub handler: Option<ActionHandler>,
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("slug", &self.slug)
            .field("fields", &self.fields.len())
            .field("is_standalone", &self.is_standalone)
            .field("is_destructive", &self.is_destructive)
            .finish()
    }
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        ActionDescriptor {
            slug: case::slug(&name),
            name,
            fields: Vec::new(),
            is_standalone: false,
            is_destructive: false,
            handler: None,
        }
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }

    pub fn standalone(mut self) -> Self {
        self.is_standalone = true;
        self
    }

    pub fn destructive(mut self) -> Self {
        self.is_destructive = true;
        self
    }

    pub fn handle<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx| -> ActionFuture { Box::pin(handler(ctx)) }));
        self
    }
}

pub fn action(name: impl Into<String>) -> ActionDescriptor {
    ActionDescriptor::new(name)
}

#[derive(Clone)]
pub struct ResourceDescriptor {
    pub name: String,
    pub slug: String,
    pub table: String,
    pub snake_case_name: String,
    pub camel_case_name: String,
    pub camel_case_name_plural: String,
    pub pascal_case_name: String,
    pub fields: Vec<FieldDescriptor>,
    pub actions: Vec<ActionDescriptor>,
    pub before_create: Option<Hook>,
    pub before_update: Option<Hook>,
    /// UI-only metadata, carried untouched.
    pub display_in_navigation: bool,
    pub per_page_options: Vec<u64>,
    pub display_field: Option<String>,
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .field("slug", &self.slug)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("actions", &self.actions)
            .field("before_create", &self.before_create.is_some())
            .field("before_update", &self.before_update.is_some())
            .finish()
    }
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let plural = case::pluralize(&name);
        ResourceDescriptor {
            slug: case::slug(&name),
            table: case::snake_case(&plural),
            snake_case_name: case::snake_case(&name),
            camel_case_name: case::camel_case(&name),
            camel_case_name_plural: case::camel_case(&plural),
            pascal_case_name: case::pascal_case(&name),
            name,
            fields: Vec::new(),
            actions: Vec::new(),
            before_create: None,
            before_update: None,
            display_in_navigation: true,
            per_page_options: vec![10, 25, 50],
            display_field: None,
        }
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = ActionDescriptor>) -> Self {
        self.actions = actions.into_iter().collect();
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn before_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.before_create = Some(Arc::new(hook));
        self
    }

    pub fn before_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.before_update = Some(Arc::new(hook));
        self
    }

    pub fn display_in_navigation(mut self) -> Self {
        self.display_in_navigation = true;
        self
    }

    pub fn hide_from_navigation(mut self) -> Self {
        self.display_in_navigation = false;
        self
    }

    pub fn per_page_options(mut self, options: impl IntoIterator<Item = u64>) -> Self {
        self.per_page_options = options.into_iter().collect();
        self
    }

    pub fn display_field(mut self, field: impl Into<String>) -> Self {
        self.display_field = Some(field.into());
        self
    }

    pub fn plain_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.is_relationship())
    }

    pub fn relationship_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_relationship())
    }

    pub fn searchable_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.plain_fields().filter(|f| f.is_searchable)
    }

    pub fn plain_field(&self, database_field: &str) -> Option<&FieldDescriptor> {
        self.plain_fields().find(|f| f.database_field == database_field)
    }

    pub fn action(&self, slug: &str) -> Option<&ActionDescriptor> {
        self.actions.iter().find(|a| a.slug == slug)
    }

    /// Relationship field declared with the given kind and target, if any.
    pub fn relationship_to(&self, kind: RelationshipKind, target: &str) -> Option<&FieldDescriptor> {
        self.relationship_fields().find(|f| {
            f.relation()
                .map(|r| r.kind == kind && r.target == target)
                .unwrap_or(false)
        })
    }

    pub fn apply_before_create(&self, payload: Record) -> Record {
        match &self.before_create {
            Some(hook) => hook(payload),
            None => payload,
        }
    }

    pub fn apply_before_update(&self, payload: Record) -> Record {
        match &self.before_update {
            Some(hook) => hook(payload),
            None => payload,
        }
    }
}

pub fn resource(name: impl Into<String>) -> ResourceDescriptor {
    ResourceDescriptor::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::field::{belongs_to_many, text};
    use serde_json::json;

    #[test]
    fn derives_names() {
        let r = resource("Administrator Permission");
        assert_eq!(r.slug, "administrator-permission");
        assert_eq!(r.table, "administrator_permissions");
        assert_eq!(r.camel_case_name, "administratorPermission");
        assert_eq!(r.camel_case_name_plural, "administratorPermissions");
        assert_eq!(r.pascal_case_name, "AdministratorPermission");
    }

    #[test]
    fn hooks_transform_payload() {
        let r = resource("Post")
            .fields([text("Title"), belongs_to_many("Tag")])
            .before_create(|mut p| {
                p.insert("title".into(), json!("from hook"));
                p
            });
        let out = r.apply_before_create(Record::new());
        assert_eq!(out.get("title"), Some(&json!("from hook")));
        let untouched = r.apply_before_update(Record::new());
        assert!(untouched.is_empty());
        assert_eq!(r.plain_fields().count(), 1);
        assert_eq!(r.relationship_fields().count(), 1);
    }

    #[test]
    fn action_slug_is_derived() {
        let a = action("Publish on").destructive();
        assert_eq!(a.slug, "publish-on");
        assert!(a.is_destructive);
        assert!(a.handler.is_none());
    }
}
