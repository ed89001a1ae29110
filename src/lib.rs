//! Resource engine: declarative resources over a backend-agnostic repository, with filtering,
//! relationship resolution, aggregates and permission bootstrap.

pub mod case;
pub mod config;
pub mod error;
pub mod migration;
pub mod permission;
pub mod query;
pub mod relation;
pub mod repository;
pub mod response;
pub mod sql;
pub mod state;

pub use config::{Registry, ResourceDescriptor, Settings};
pub use error::{AppError, ConfigError, ValidationMessage};
pub use permission::{bootstrap_permissions, create_administrator, BootstrapReport};
pub use query::{Aggregate, AggregateRange, FetchQuery, Filter, Operator};
pub use repository::{DocumentRepository, PgRepository, Repository};
pub use response::{Page, Record};
pub use state::{boot, AcceptAll, AppState, PayloadValidator};
