//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declaration problems found while building or validating the registry. Fatal at boot.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("duplicate slug '{slug}' shared by '{first}' and '{second}'")]
    DuplicateSlug {
        slug: String,
        first: String,
        second: String,
    },
    #[error("settings: {0}")]
    Settings(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// One entry of a structured validation error list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub field: String,
    pub message: String,
}

impl ValidationMessage {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationMessage {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Unknown resource or relationship referenced at request time.
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("validation failed: {}", join_messages(.0))]
    Validation(Vec<ValidationMessage>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Boot-time failure (schema materialization, permission bootstrap). Aborts startup.
    #[error("fatal boot error: {0}")]
    FatalBoot(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{operation} on {resource} failed: {message}")]
    Storage {
        resource: String,
        operation: &'static str,
        message: String,
    },
}

fn join_messages(messages: &[ValidationMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.field, m.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    /// Single-message validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation(vec![ValidationMessage::new(field, message)])
    }

    /// Map a sqlx error, turning unique violations into `Conflict`.
    pub fn from_db(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return AppError::Conflict(db.message().to_string());
            }
        }
        AppError::Db(e)
    }

    /// Attach the resource and operation in flight to storage failures.
    /// Typed request errors (validation, not found, conflict, configuration) pass through unchanged.
    pub fn context(self, resource: &str, operation: &'static str) -> Self {
        match self {
            AppError::Db(sqlx::Error::RowNotFound) => {
                AppError::NotFound(format!("{} ({})", resource, operation))
            }
            AppError::Db(e) => AppError::Storage {
                resource: resource.to_string(),
                operation,
                message: e.to_string(),
            },
            other => other,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::FatalBoot(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            AppError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::Configuration(_) => "configuration_error",
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::FatalBoot(_) => "fatal_boot",
            AppError::Db(sqlx::Error::RowNotFound) => "not_found",
            AppError::Db(_) => "database_error",
            AppError::Storage { .. } => "storage_error",
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = match &self {
            AppError::Validation(messages) => serde_json::to_value(messages).ok(),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
