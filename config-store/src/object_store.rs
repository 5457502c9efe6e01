//! Typed access to one config resource.
//!
//! An `ObjectStore` binds a resource name and namespace to an
//! [`ObjectCodec`], so domain code reads and writes its own types while the
//! versioned store keeps dealing in `serde_json::Value`.

use crate::errors::{Result, StoreError};
use crate::filter::FilterExpression;
use crate::metrics_defs::OBJECT_DECODE_FAILURES;
use crate::store::{ConfigStore, QueryOptions};
use crate::types::{ConfigRecord, ConfigResource, RequestContext};
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::counter;
use std::marker::PhantomData;
use std::sync::Arc;

pub trait ObjectCodec<T>: Send + Sync {
    fn encode(&self, object: &T) -> Result<Value, serde_json::Error>;
    fn decode(&self, value: &Value) -> Result<T, serde_json::Error>;
    /// The context an object is stored under.
    fn context_of(&self, object: &T) -> String;
}

/// Codec for serde types, stored as their JSON form.
pub struct JsonCodec<T, F> {
    context_of: F,
    _object: PhantomData<fn() -> T>,
}

impl<T, F> JsonCodec<T, F>
where
    F: Fn(&T) -> String,
{
    pub fn new(context_of: F) -> Self {
        JsonCodec {
            context_of,
            _object: PhantomData,
        }
    }
}

impl<T, F> ObjectCodec<T> for JsonCodec<T, F>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&T) -> String + Send + Sync,
{
    fn encode(&self, object: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value(object)
    }

    fn decode(&self, value: &Value) -> Result<T, serde_json::Error> {
        T::deserialize(value)
    }

    fn context_of(&self, object: &T) -> String {
        (self.context_of)(object)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigObject<T> {
    pub context: String,
    pub data: T,
    pub version: u64,
    pub creation_timestamp: u64,
    pub update_timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpsertedObject<T> {
    pub object: ConfigObject<T>,
    /// The object this upsert replaced. Absent on creation, and when the
    /// replaced value no longer decodes.
    pub previous: Option<ConfigObject<T>>,
}

pub struct ObjectStore<T, C> {
    store: Arc<ConfigStore>,
    resource_name: String,
    resource_namespace: String,
    codec: C,
    _object: PhantomData<fn() -> T>,
}

impl<T, C> ObjectStore<T, C>
where
    C: ObjectCodec<T>,
{
    pub fn new<N, S>(store: Arc<ConfigStore>, resource_name: N, resource_namespace: S, codec: C) -> Self
    where
        N: Into<String>,
        S: Into<String>,
    {
        ObjectStore {
            store,
            resource_name: resource_name.into(),
            resource_namespace: resource_namespace.into(),
            codec,
            _object: PhantomData,
        }
    }

    fn resource(&self, tenant_id: &str) -> ConfigResource {
        ConfigResource::new(
            self.resource_name.as_str(),
            self.resource_namespace.as_str(),
            tenant_id,
        )
    }

    fn decode(&self, record: ConfigRecord) -> Result<ConfigObject<T>> {
        let data = self.codec.decode(&record.value).map_err(|e| {
            counter!(OBJECT_DECODE_FAILURES).increment(1);
            StoreError::Internal(format!("could not decode {}: {e}", record.key))
        })?;
        Ok(ConfigObject {
            context: record.key.context,
            data,
            version: record.version,
            creation_timestamp: record.creation_timestamp,
            update_timestamp: record.update_timestamp,
        })
    }

    fn encode(&self, object: &T) -> Result<Value> {
        self.codec
            .encode(object)
            .map_err(|e| StoreError::InvalidArgument(format!("could not encode object: {e}")))
    }

    fn upserted(&self, record: ConfigRecord, previous: Option<ConfigRecord>) -> Result<UpsertedObject<T>> {
        let previous = previous.and_then(|p| {
            self.decode(p)
                .inspect_err(|e| tracing::warn!(error = %e, "Ignoring undecodable previous object"))
                .ok()
        });
        Ok(UpsertedObject {
            object: self.decode(record)?,
            previous,
        })
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        context: &str,
    ) -> Result<Option<ConfigObject<T>>> {
        let key = self.resource(tenant_id).context(context);
        self.store
            .read(ctx, &key)
            .await?
            .map(|record| self.decode(record))
            .transpose()
    }

    /// Objects matching `options`. Records that fail to decode are logged
    /// and left out.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ConfigObject<T>>> {
        let result = self.store.query(ctx, &self.resource(tenant_id), options).await?;
        Ok(result
            .records
            .into_iter()
            .filter_map(|record| {
                let key = record.key.clone();
                self.decode(record)
                    .inspect_err(|e| tracing::error!(key = %key, error = %e, "Skipping undecodable object"))
                    .ok()
            })
            .collect())
    }

    pub async fn upsert(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        object: &T,
        precondition: Option<&FilterExpression>,
    ) -> Result<UpsertedObject<T>> {
        let key = self.resource(tenant_id).context(self.codec.context_of(object));
        let value = self.encode(object)?;
        let result = self.store.write(ctx, &key, value, precondition).await?;
        self.upserted(result.record, result.previous)
    }

    /// Upserts every object; results are per context in input order. When
    /// several objects share a context the last one is written.
    pub async fn upsert_all(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        objects: &[T],
    ) -> Result<Vec<(String, Result<UpsertedObject<T>>)>> {
        let resource = self.resource(tenant_id);
        let mut values = IndexMap::with_capacity(objects.len());
        for object in objects {
            values.insert(
                resource.context(self.codec.context_of(object)),
                self.encode(object)?,
            );
        }

        let results = self.store.bulk_write(ctx, values).await?;
        Ok(results
            .into_iter()
            .map(|(key, result)| {
                let upserted = result.and_then(|r| self.upserted(r.record, r.previous));
                (key.context, upserted)
            })
            .collect())
    }

    /// Deletes the object stored under `context`, returning it. An object
    /// that no longer decodes is deleted but reported as `Internal`.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        context: &str,
    ) -> Result<Option<ConfigObject<T>>> {
        let key = self.resource(tenant_id).context(context);
        self.store
            .delete(ctx, &key)
            .await?
            .map(|record| self.decode(record))
            .transpose()
    }

    pub async fn delete_all(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        contexts: &[String],
    ) -> Result<Vec<(String, Result<Option<ConfigObject<T>>>)>> {
        let resource = self.resource(tenant_id);
        let keys: Vec<_> = contexts.iter().map(|c| resource.context(c.as_str())).collect();
        let results = self.store.bulk_delete(ctx, &keys).await?;
        Ok(results
            .into_iter()
            .map(|(key, result)| {
                let deleted = result.and_then(|r| r.map(|record| self.decode(record)).transpose());
                (key.context, deleted)
            })
            .collect())
    }

    /// Creates `object` unless an existing object of the tenant has the same
    /// unique key. Runs under the tenant lock, so concurrent creations in
    /// this process cannot both pass the check.
    pub async fn insert_unique<K, F>(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        object: &T,
        unique_key: F,
    ) -> Result<UpsertedObject<T>>
    where
        K: PartialEq,
        F: Fn(&T) -> K,
    {
        let _tenant = self.store.lock_tenant(tenant_id).await?;

        let key = unique_key(object);
        let existing = self.list(ctx, tenant_id, &QueryOptions::default()).await?;
        if let Some(duplicate) = existing.iter().find(|o| unique_key(&o.data) == key) {
            return Err(StoreError::AlreadyExists(format!(
                "an object with the same key exists in context {}",
                duplicate.context
            )));
        }

        self.upsert(ctx, tenant_id, object, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::filter::RelationalOperator;
    use crate::guard::TenantLocks;
    use crate::types::ConfigResource;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Rule {
        id: String,
        name: String,
        severity: u32,
    }

    fn rule(id: &str, name: &str, severity: u32) -> Rule {
        Rule {
            id: id.into(),
            name: name.into(),
            severity,
        }
    }

    type RuleStore = ObjectStore<Rule, JsonCodec<Rule, fn(&Rule) -> String>>;

    fn rule_store(store: Arc<ConfigStore>) -> RuleStore {
        fn rule_id(rule: &Rule) -> String {
            rule.id.clone()
        }
        ObjectStore::new(store, "rules", "alerting", JsonCodec::new(rule_id as fn(&Rule) -> String))
    }

    fn ctx() -> RequestContext {
        RequestContext::new().with_user("user-1", "user-1@example.com")
    }

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let rules = rule_store(Arc::new(ConfigStore::new(Arc::new(MemoryBackend::new()))));

        let created = rules.upsert(&ctx(), "t1", &rule("r1", "cpu", 1), None).await.unwrap();
        assert_eq!(created.object.context, "r1");
        assert_eq!(created.object.version, 1);
        assert_eq!(created.previous, None);

        let updated = rules.upsert(&ctx(), "t1", &rule("r1", "cpu", 2), None).await.unwrap();
        assert_eq!(updated.object.data.severity, 2);
        assert_eq!(updated.previous.unwrap().data.severity, 1);

        let fetched = rules.get(&ctx(), "t1", "r1").await.unwrap().unwrap();
        assert_eq!(fetched.data, rule("r1", "cpu", 2));
        assert_eq!(rules.get(&ctx(), "t2", "r1").await.unwrap(), None);

        let deleted = rules.delete(&ctx(), "t1", "r1").await.unwrap().unwrap();
        assert_eq!(deleted.data, rule("r1", "cpu", 2));
        assert_eq!(rules.get(&ctx(), "t1", "r1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_skips_undecodable() {
        let store = Arc::new(ConfigStore::new(Arc::new(MemoryBackend::new())));
        let rules = rule_store(store.clone());
        rules.upsert(&ctx(), "t1", &rule("r1", "cpu", 1), None).await.unwrap();
        rules.upsert(&ctx(), "t1", &rule("r2", "mem", 3), None).await.unwrap();
        let broken = ConfigResource::new("rules", "alerting", "t1").context("r3");
        store
            .write(&ctx(), &broken, json!({"unexpected": true}), None)
            .await
            .unwrap();

        let filter = FilterExpression::relational("severity", RelationalOperator::Gte, json!(1));
        let listed = rules
            .list(&ctx(), "t1", &QueryOptions::with_filter(filter))
            .await
            .unwrap();
        let mut ids: Vec<&str> = listed.iter().map(|o| o.data.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["r1", "r2"]);

        let all = rules.list(&ctx(), "t1", &QueryOptions::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let err = rules.get(&ctx(), "t1", "r3").await.unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
    }

    #[tokio::test]
    async fn test_upsert_with_precondition() {
        let rules = rule_store(Arc::new(ConfigStore::new(Arc::new(MemoryBackend::new()))));
        rules.upsert(&ctx(), "t1", &rule("r1", "cpu", 1), None).await.unwrap();

        let stale = FilterExpression::relational("severity", RelationalOperator::Eq, json!(5));
        let err = rules
            .upsert(&ctx(), "t1", &rule("r1", "cpu", 2), Some(&stale))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_upsert_all_and_delete_all() {
        let rules = rule_store(Arc::new(ConfigStore::new(Arc::new(MemoryBackend::new()))));
        let results = rules
            .upsert_all(
                &ctx(),
                "t1",
                &[rule("r1", "cpu", 1), rule("r2", "mem", 2), rule("r1", "cpu", 3)],
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "r1");
        assert_eq!(results[0].1.as_ref().unwrap().object.data.severity, 3);

        let deleted = rules
            .delete_all(&ctx(), "t1", &["r2".to_string(), "r9".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted[0].1.as_ref().unwrap().as_ref().unwrap().data.name, "mem");
        assert_eq!(deleted[1].1.as_ref().unwrap(), &None);
    }

    #[tokio::test]
    async fn test_insert_unique() {
        let rules = rule_store(Arc::new(ConfigStore::new(Arc::new(MemoryBackend::new()))));
        let by_name = |r: &Rule| r.name.clone();

        rules
            .insert_unique(&ctx(), "t1", &rule("r1", "cpu", 1), by_name)
            .await
            .unwrap();
        let err = rules
            .insert_unique(&ctx(), "t1", &rule("r2", "cpu", 2), by_name)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(!err.is_retryable());

        // Uniqueness is per tenant.
        rules
            .insert_unique(&ctx(), "t2", &rule("r2", "cpu", 2), by_name)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_unique_aborts_when_tenant_is_locked() {
        let store = Arc::new(
            ConfigStore::new(Arc::new(MemoryBackend::new()))
                .with_tenant_locks(TenantLocks::new(8, Duration::from_millis(50))),
        );
        let rules = rule_store(store.clone());

        let _held = store.lock_tenant("t1").await.unwrap();
        let err = rules
            .insert_unique(&ctx(), "t1", &rule("r1", "cpu", 1), |r: &Rule| r.name.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted(_)));
    }
}
