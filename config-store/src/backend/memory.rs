use super::{BackendError, ConfigBackend, Query};
use crate::document::ConfigDocument;
use crate::predicate::Predicate;
use crate::types::ConfigResourceContext;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type DocumentId = (ConfigResourceContext, u64);

/// Process-local backend. Also the working set of the filesystem backend.
#[derive(Default)]
pub struct MemoryBackend {
    documents: RwLock<BTreeMap<DocumentId, ConfigDocument>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: Vec<ConfigDocument>) -> Self {
        let documents = documents
            .into_iter()
            .map(|d| ((d.key(), d.version), d))
            .collect();
        MemoryBackend {
            documents: RwLock::new(documents),
        }
    }

    pub fn snapshot(&self) -> Vec<ConfigDocument> {
        self.documents.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    pub(super) fn remove(&self, key: &ConfigResourceContext, version: u64) {
        self.documents.write().remove(&(key.clone(), version));
    }

    pub(super) fn find_sync(&self, query: &Query) -> Vec<ConfigDocument> {
        let matching = self
            .documents
            .read()
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        query.finish(matching)
    }

    pub(super) fn insert_sync(&self, document: ConfigDocument) -> Result<(), BackendError> {
        let id = (document.key(), document.version);
        let mut documents = self.documents.write();
        if documents.contains_key(&id) {
            return Err(BackendError::DuplicateVersion {
                key: id.0.to_string(),
                version: id.1,
            });
        }
        documents.insert(id, document);
        Ok(())
    }

    pub(super) fn insert_if_sync(&self, document: ConfigDocument, condition: &Predicate) -> bool {
        let id = (document.key(), document.version);
        let mut documents = self.documents.write();
        if documents.contains_key(&id) {
            return false;
        }
        let matched = documents
            .values()
            .filter(|d| condition.matches(*d))
            .take(2)
            .count();
        if matched != 1 {
            return false;
        }
        documents.insert(id, document);
        true
    }
}

#[async_trait]
impl ConfigBackend for MemoryBackend {
    async fn find(&self, query: &Query) -> Result<Vec<ConfigDocument>, BackendError> {
        Ok(self.find_sync(query))
    }

    async fn insert(&self, document: ConfigDocument) -> Result<(), BackendError> {
        self.insert_sync(document)
    }

    async fn insert_if(
        &self,
        document: ConfigDocument,
        condition: &Predicate,
    ) -> Result<bool, BackendError> {
        Ok(self.insert_if_sync(document, condition))
    }

    async fn bulk_insert(
        &self,
        documents: Vec<ConfigDocument>,
    ) -> Result<Vec<Result<(), BackendError>>, BackendError> {
        Ok(documents
            .into_iter()
            .map(|d| self.insert_sync(d))
            .collect())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SortOrder;
    use crate::document::{VERSION_FIELD, key_predicate};
    use crate::types::ConfigResource;
    use serde_json::json;

    fn key(context: &str) -> ConfigResourceContext {
        ConfigResource::new("rules", "alerting", "tenant-1").context(context)
    }

    fn doc(context: &str, version: u64) -> ConfigDocument {
        ConfigDocument::new(&key(context), version, json!({"v": version}), "u", "e", 0, 0)
    }

    #[tokio::test]
    async fn test_insert_and_find_latest() {
        let backend = MemoryBackend::new();
        for version in 1..=3 {
            backend.insert(doc("a", version)).await.unwrap();
        }
        backend.insert(doc("b", 1)).await.unwrap();

        let latest = backend
            .find(
                &Query::new(key_predicate(&key("a")))
                    .sort_by(VERSION_FIELD, SortOrder::Descending)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(latest, vec![doc("a", 3)]);
        let b = backend.find(&Query::new(key_predicate(&key("b")))).await.unwrap();
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let backend = MemoryBackend::new();
        backend.insert(doc("a", 1)).await.unwrap();
        let err = backend.insert(doc("a", 1)).await.unwrap_err();
        assert!(matches!(err, BackendError::DuplicateVersion { version: 1, .. }));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_if() {
        let backend = MemoryBackend::new();
        backend.insert(doc("a", 1)).await.unwrap();
        let condition = key_predicate(&key("a")).and(Predicate::eq(VERSION_FIELD, 1_u64));

        assert!(backend.insert_if(doc("a", 2), &condition).await.unwrap());
        // Same condition still matches version 1, but version 2 is taken.
        assert!(!backend.insert_if(doc("a", 2), &condition).await.unwrap());

        let missing = key_predicate(&key("b"));
        assert!(!backend.insert_if(doc("b", 1), &missing).await.unwrap());
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_insert_isolates_failures() {
        let backend = MemoryBackend::from_documents(vec![doc("b", 1)]);
        let results = backend
            .bulk_insert(vec![doc("a", 1), doc("b", 1), doc("c", 1)])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(backend.len(), 3);
    }
}
