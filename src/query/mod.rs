pub mod document;
pub mod filter;
pub mod types;

pub use document::DocumentFilter;
pub use filter::{compile, Comparison, Condition, Predicate, IMPLICIT_FIELDS};
pub use types::*;
