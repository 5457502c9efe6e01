//! Storage backends for config documents.
//!
//! A backend is a document collection offering predicate scans with
//! sort/limit, counting, unconditional and conditional inserts and bulk
//! inserts. Documents are never updated in place: every version is a new
//! document and `(key, version)` is unique.

mod filesystem;
mod memory;

pub use filesystem::{Compression, FilesystemBackend};
pub use memory::MemoryBackend;

use crate::document::ConfigDocument;
use crate::predicate::{FieldSource, Predicate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("version {version} of {key} already exists")]
    DuplicateVersion { key: String, version: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Sort on one document field.
#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new<F: Into<String>>(field: F, order: SortOrder) -> Self {
        SortKey {
            field: field.into(),
            order,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Predicate>,
    pub sort: Vec<SortKey>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(filter: Predicate) -> Self {
        Query {
            filter: Some(filter),
            ..Default::default()
        }
    }

    pub fn sort_by<F: Into<String>>(mut self, field: F, order: SortOrder) -> Self {
        self.sort.push(SortKey::new(field, order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, document: &ConfigDocument) -> bool {
        self.filter.as_ref().is_none_or(|f| f.matches(document))
    }

    /// Applies sort, offset and limit to documents that already passed the filter.
    pub fn finish(&self, mut documents: Vec<ConfigDocument>) -> Vec<ConfigDocument> {
        sort_documents(&mut documents, &self.sort);
        documents
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// Documents matching the query, sorted and paginated.
    async fn find(&self, query: &Query) -> Result<Vec<ConfigDocument>, BackendError>;

    /// Appends a document. Fails with `DuplicateVersion` if the version is taken.
    async fn insert(&self, document: ConfigDocument) -> Result<(), BackendError>;

    /// Atomically appends a document if exactly one stored document matches
    /// `condition` and the version is free. Returns whether it was appended.
    async fn insert_if(
        &self,
        document: ConfigDocument,
        condition: &Predicate,
    ) -> Result<bool, BackendError>;

    /// Appends many documents; each element succeeds or fails on its own.
    async fn bulk_insert(
        &self,
        documents: Vec<ConfigDocument>,
    ) -> Result<Vec<Result<(), BackendError>>, BackendError>;

    async fn health_check(&self) -> bool;
}

/// Stable multi-key sort. Missing fields sort before any present value.
pub fn sort_documents<D: FieldSource>(documents: &mut [D], sort: &[SortKey]) {
    if sort.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        sort.iter()
            .map(|key| {
                let ordering = compare_values(
                    a.field(&key.field).as_deref(),
                    b.field(&key.field).as_deref(),
                );
                match key.order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}
