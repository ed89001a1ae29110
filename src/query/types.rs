//! Query object accepted by every listing call, plus its normalized form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PER_PAGE: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    In,
    NotIn,
    Matches,
    Contains,
    Gte,
    Gt,
    Lte,
    Lt,
    IsNull,
    NotNull,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Filter {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// `{ page?, perPage?|per_page?, search?, fields?, filters? }` as received from the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    /// Legacy spelling; `perPage` takes precedence when both are present.
    #[serde(default, rename = "per_page")]
    pub legacy_per_page: Option<u64>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl FetchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn per_page(mut self, per_page: u64) -> Self {
        self.per_page = Some(per_page);
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, operator, value));
        self
    }

    /// Apply defaults: page 1, perPage 10 (from `perPage`, else `per_page`), empty search.
    /// Zero values count as absent.
    pub fn normalized(&self) -> NormalizedQuery {
        NormalizedQuery {
            page: self.page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE),
            per_page: self
                .per_page
                .filter(|n| *n > 0)
                .or(self.legacy_per_page.filter(|n| *n > 0))
                .unwrap_or(DEFAULT_PER_PAGE),
            search: self.search.clone().unwrap_or_default(),
            fields: self.fields.clone(),
            filters: self.filters.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedQuery {
    pub page: u64,
    pub per_page: u64,
    pub search: String,
    pub fields: Option<Vec<String>>,
    pub filters: Vec<Filter>,
}

impl NormalizedQuery {
    /// `perPage * (page - 1)`, saturating for out-of-range input.
    pub fn skip(&self) -> u64 {
        self.per_page.saturating_mul(self.page.saturating_sub(1))
    }

    pub fn limit(&self) -> u64 {
        self.per_page
    }

    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }
}

/// Inclusive `created_at` window used by the aggregate operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AggregateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        AggregateRange { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Avg,
    Min,
    Max,
}
