//! Shared application state: the frozen registry, the selected repository, and the payload
//! validator. Built once by `boot`.

use crate::config::{ActionContext, Backend, Registry, ResourceDescriptor, Settings};
use crate::error::{AppError, ValidationMessage};
use crate::permission::{bootstrap_permissions, BootstrapReport};
use crate::repository::{DocumentRepository, PgRepository, Repository};
use crate::response::Record;
use serde_json::Value;
use std::sync::Arc;

/// Payload validation collaborator. Rule evaluation lives outside the core.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &Record, resource: &ResourceDescriptor) -> (bool, Vec<ValidationMessage>);
}

/// Accepts every payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, _payload: &Record, _resource: &ResourceDescriptor) -> (bool, Vec<ValidationMessage>) {
        (true, Vec::new())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub repository: Arc<dyn Repository>,
    pub validator: Arc<dyn PayloadValidator>,
}

/// Register resources, open the configured backend, materialize storage and bootstrap permissions.
/// Runs once, in order; the first failure aborts.
pub async fn boot(
    settings: &Settings,
    resources: impl IntoIterator<Item = ResourceDescriptor>,
) -> Result<(AppState, BootstrapReport), AppError> {
    let registry = Arc::new(Registry::register(resources)?);
    let repository: Arc<dyn Repository> = match settings.backend {
        Backend::Document => Arc::new(DocumentRepository::new(registry.clone())),
        Backend::Postgres => Arc::new(PgRepository::connect(settings, registry.clone()).await?),
    };
    tracing::info!(backend = ?settings.backend, "repository selected");

    let state = AppState::new(registry, repository);
    let report = state.start().await?;
    Ok((state, report))
}

impl AppState {
    pub fn new(registry: Arc<Registry>, repository: Arc<dyn Repository>) -> Self {
        AppState {
            registry,
            repository,
            validator: Arc::new(AcceptAll),
        }
    }

    pub fn with_validator(mut self, validator: impl PayloadValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Materialize storage, then bootstrap permissions.
    pub async fn start(&self) -> Result<BootstrapReport, AppError> {
        self.repository.materialize().await.map_err(|e| match e {
            AppError::FatalBoot(_) => e,
            other => AppError::FatalBoot(format!("materialize: {}", other)),
        })?;
        bootstrap_permissions(&self.registry, self.repository.as_ref()).await
    }

    pub fn resource(&self, slug: &str) -> Result<&ResourceDescriptor, AppError> {
        self.registry
            .by_slug(slug)
            .ok_or_else(|| AppError::Configuration(format!("resource '{}' is not registered", slug)))
    }

    fn check(&self, resource: &ResourceDescriptor, payload: &Record) -> Result<(), AppError> {
        let (ok, messages) = self.validator.validate(payload, resource);
        if ok {
            Ok(())
        } else {
            Err(AppError::Validation(messages))
        }
    }

    pub async fn create_validated(
        &self,
        resource: &ResourceDescriptor,
        payload: Record,
        relationship_payload: Record,
    ) -> Result<Record, AppError> {
        self.check(resource, &payload)?;
        self.repository.create(resource, payload, relationship_payload).await
    }

    pub async fn update_validated(
        &self,
        resource: &ResourceDescriptor,
        id: &Value,
        payload: Record,
        relationship_payload: Record,
    ) -> Result<Record, AppError> {
        self.check(resource, &payload)?;
        self.repository.update(resource, id, payload, relationship_payload).await
    }

    /// Invoke the handler of `action_slug` on the resource at `resource_slug`.
    pub async fn run_action(&self, resource_slug: &str, action_slug: &str, payload: Record) -> Result<Value, AppError> {
        let resource = self.resource(resource_slug)?;
        let action = resource.action(action_slug).ok_or_else(|| {
            AppError::Configuration(format!("action '{}' is not declared on {}", action_slug, resource.name))
        })?;
        let handler = action.handler.clone().ok_or_else(|| {
            AppError::Configuration(format!("action '{}' on {} has no handler", action_slug, resource.name))
        })?;
        tracing::debug!(resource = %resource.slug, action = %action.slug, "run action");
        handler(ActionContext {
            resource_slug: resource.slug.clone(),
            payload,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{action, resource, text};
    use serde_json::json;

    struct RequireTitle;

    impl PayloadValidator for RequireTitle {
        fn validate(&self, payload: &Record, _resource: &ResourceDescriptor) -> (bool, Vec<ValidationMessage>) {
            if payload.contains_key("title") {
                (true, Vec::new())
            } else {
                (false, vec![ValidationMessage::new("title", "required")])
            }
        }
    }

    fn state() -> AppState {
        let registry = Arc::new(
            Registry::register([resource("Post")
                .fields([text("Title")])
                .actions([action("Echo").handle(|ctx| async move { Ok(Value::Object(ctx.payload)) })])])
            .unwrap(),
        );
        let repository = Arc::new(DocumentRepository::new(registry.clone()));
        AppState::new(registry, repository)
    }

    #[tokio::test]
    async fn validator_runs_before_create() {
        let state = state().with_validator(RequireTitle);
        let post = state.resource("post").unwrap().clone();
        let err = state
            .create_validated(&post, Record::new(), Record::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m[0].field == "title"));

        let mut payload = Record::new();
        payload.insert("title".into(), json!("Hi"));
        let created = state.create_validated(&post, payload, Record::new()).await.unwrap();
        assert_eq!(created.get("title"), Some(&json!("Hi")));
    }

    #[tokio::test]
    async fn run_action_invokes_handler() {
        let state = state();
        let mut payload = Record::new();
        payload.insert("x".into(), json!(1));
        let out = state.run_action("post", "echo", payload).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert!(matches!(
            state.run_action("post", "missing", Record::new()).await,
            Err(AppError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn start_bootstraps_document_store() {
        let state = state();
        let report = state.start().await.unwrap();
        assert_eq!(report.inserted, report.derived);
        assert_eq!(report.super_admin_id, json!(1));
    }
}
