//! The versioned config store.
//!
//! Every write appends a new immutable version for its key; deletes append a
//! tombstone. Reads and queries only ever surface the latest live version of
//! each key. Version sequencing for a key is serialized locally by a key
//! monitor and enforced across processes by the backend's duplicate-version
//! check and conditional insert.

use crate::backend::{
    ConfigBackend, FilesystemBackend, MemoryBackend, Query, SortKey, SortOrder, sort_documents,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendConfig, StoreConfig};
use crate::document::{
    CONFIG_FIELD, CONTEXT_FIELD, CREATION_TIMESTAMP_FIELD, ConfigDocument, UPDATE_TIMESTAMP_FIELD,
    VERSION_FIELD, key_predicate, resource_predicate,
};
use crate::errors::{Result, StoreError};
use crate::filter::{self, FilterExpression};
use crate::guard::{KeyMonitors, TenantLocks};
use crate::metrics_defs::{
    QUERY_RESULTS, STORE_BULK_SIZE, STORE_DURATION, STORE_REQUESTS, STORE_WRITE_CONFLICTS,
};
use crate::predicate::Predicate;
use crate::types::{
    ConfigRecord, ConfigResource, ConfigResourceContext, MergedConfig, RequestContext, WriteResult,
};
use crate::value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{counter, histogram};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

impl Pagination {
    fn bounds(&self) -> Result<(usize, usize)> {
        let offset = usize::try_from(self.offset)
            .map_err(|_| StoreError::InvalidArgument(format!("negative offset {}", self.offset)))?;
        let limit = match self.limit {
            Some(limit) => usize::try_from(limit)
                .map_err(|_| StoreError::InvalidArgument(format!("negative limit {limit}")))?,
            None => usize::MAX,
        };
        Ok((offset, limit))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreationTimestamp,
    UpdateTimestamp,
    Context,
    /// Dotted path inside the config value.
    Path(String),
}

impl SortField {
    fn document_field(&self) -> String {
        match self {
            SortField::CreationTimestamp => CREATION_TIMESTAMP_FIELD.to_string(),
            SortField::UpdateTimestamp => UPDATE_TIMESTAMP_FIELD.to_string(),
            SortField::Context => CONTEXT_FIELD.to_string(),
            SortField::Path(path) => format!("{CONFIG_FIELD}.{path}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: SortField,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub filter: Option<FilterExpression>,
    pub pagination: Option<Pagination>,
    pub sort_by: Vec<SortBy>,
}

impl QueryOptions {
    pub fn with_filter(filter: FilterExpression) -> Self {
        QueryOptions {
            filter: Some(filter),
            ..Default::default()
        }
    }

    // Newest first by default; context breaks ties so pages are stable.
    fn sort_keys(&self) -> Vec<SortKey> {
        let mut keys: Vec<SortKey> = self
            .sort_by
            .iter()
            .map(|s| SortKey::new(s.field.document_field(), s.order))
            .collect();
        if keys.is_empty() {
            keys.push(SortKey::new(CREATION_TIMESTAMP_FIELD, SortOrder::Descending));
        }
        keys.push(SortKey::new(CONTEXT_FIELD, SortOrder::Ascending));
        keys
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub records: Vec<ConfigRecord>,
    /// Number of matching records before pagination.
    pub total_count: u64,
}

// A version computed under the key monitor, not yet committed.
struct PendingWrite {
    document: ConfigDocument,
    previous: Option<ConfigRecord>,
}

impl PendingWrite {
    fn into_write_result(self) -> Result<WriteResult> {
        let record = self
            .document
            .into_record()
            .ok_or_else(|| StoreError::Internal("committed write produced a tombstone".into()))?;
        Ok(WriteResult {
            record,
            previous: self.previous,
        })
    }
}

pub struct ConfigStore {
    backend: Arc<dyn ConfigBackend>,
    clock: Arc<dyn Clock>,
    monitors: KeyMonitors,
    tenant_locks: TenantLocks,
    operation_timeout: Duration,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn ConfigBackend>) -> Self {
        ConfigStore {
            backend,
            clock: Arc::new(SystemClock),
            monitors: KeyMonitors::default(),
            tenant_locks: TenantLocks::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;

        let backend: Arc<dyn ConfigBackend> = match &config.backend {
            BackendConfig::Memory => Arc::new(MemoryBackend::new()),
            BackendConfig::Filesystem {
                base_dir, filename, ..
            } => Arc::new(FilesystemBackend::open(
                base_dir,
                filename,
                config.backend.compression(),
            )?),
        };

        Ok(ConfigStore {
            backend,
            clock: Arc::new(SystemClock),
            monitors: KeyMonitors::new(config.guard.monitor_idle()),
            tenant_locks: TenantLocks::new(
                config.guard.tenant_lock_stripes,
                config.guard.tenant_lock_timeout(),
            ),
            operation_timeout: config.operation_timeout(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_tenant_locks(mut self, tenant_locks: TenantLocks) -> Self {
        self.tenant_locks = tenant_locks;
        self
    }

    /// Serializes check-then-create flows for one tenant.
    pub async fn lock_tenant(&self, tenant_id: &str) -> Result<OwnedMutexGuard<()>> {
        self.tenant_locks.lock(tenant_id).await
    }

    /// Appends a new version for `key`.
    ///
    /// With a precondition, the write only commits if the current latest
    /// version of the key matches it; otherwise it fails with `Conflict` and
    /// no version is created.
    pub async fn write(
        &self,
        ctx: &RequestContext,
        key: &ConfigResourceContext,
        value: Value,
        precondition: Option<&FilterExpression>,
    ) -> Result<WriteResult> {
        self.bounded(ctx, "write", async {
            check_writable(key, &value)?;
            let condition = precondition.map(filter::compile).transpose()?;
            let _monitor = self.monitors.lock(key).await;

            let pending = self.prepare_write(ctx, key, value).await?;
            match condition {
                Some(condition) => self.commit_conditional(key, &pending, condition).await?,
                None => self.backend.insert(pending.document.clone()).await?,
            }

            tracing::debug!(key = %key, version = pending.document.version, "Wrote config");
            pending.into_write_result()
        })
        .await
    }

    /// The latest live record of `key`, if any.
    pub async fn read(
        &self,
        ctx: &RequestContext,
        key: &ConfigResourceContext,
    ) -> Result<Option<ConfigRecord>> {
        self.bounded(ctx, "read", async {
            Ok(self.latest(key).await?.and_then(ConfigDocument::into_record))
        })
        .await
    }

    pub async fn query(
        &self,
        ctx: &RequestContext,
        resource: &ConfigResource,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        self.bounded(ctx, "query", async {
            let filter = options.filter.as_ref().map(filter::compile).transpose()?;
            let (offset, limit) = options
                .pagination
                .as_ref()
                .map_or(Ok((0, usize::MAX)), Pagination::bounds)?;

            let mut matching = self.latest_live(resource, filter.as_ref()).await?;
            let total_count = matching.len() as u64;
            histogram!(QUERY_RESULTS).record(total_count as f64);

            sort_documents(&mut matching, &options.sort_keys());
            let records = matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .filter_map(ConfigDocument::into_record)
                .collect();
            Ok(QueryResult {
                records,
                total_count,
            })
        })
        .await
    }

    /// Appends a tombstone for `key` and returns the record it hid. Deleting
    /// a key with no live record is a no-op returning `None`.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        key: &ConfigResourceContext,
    ) -> Result<Option<ConfigRecord>> {
        self.bounded(ctx, "delete", async {
            let _monitor = self.monitors.lock(key).await;
            let Some(pending) = self.prepare_delete(ctx, key).await? else {
                return Ok(None);
            };
            self.backend.insert(pending.document).await?;

            tracing::debug!(key = %key, "Deleted config");
            Ok(pending.previous)
        })
        .await
    }

    /// Writes many keys, each with the semantics of an unconditional
    /// [`ConfigStore::write`]. Results follow input order; a failing element
    /// does not affect the others.
    pub async fn bulk_write(
        &self,
        ctx: &RequestContext,
        values: IndexMap<ConfigResourceContext, Value>,
    ) -> Result<Vec<(ConfigResourceContext, Result<WriteResult>)>> {
        if values.is_empty() {
            return Err(StoreError::InvalidArgument("no configs to write".into()));
        }
        histogram!(STORE_BULK_SIZE, "operation" => "bulk_write").record(values.len() as f64);

        self.bounded(ctx, "bulk_write", async {
            let _monitors = self.monitors.lock_all(values.keys()).await;

            let mut prepared = Vec::with_capacity(values.len());
            for (key, value) in values {
                let pending = match check_writable(&key, &value) {
                    Ok(()) => self.prepare_write(ctx, &key, value).await,
                    Err(e) => Err(e),
                };
                prepared.push((key, pending));
            }

            self.commit_all(prepared, PendingWrite::into_write_result)
                .await
        })
        .await
    }

    /// Deletes many keys, each with the semantics of [`ConfigStore::delete`].
    pub async fn bulk_delete(
        &self,
        ctx: &RequestContext,
        keys: &[ConfigResourceContext],
    ) -> Result<Vec<(ConfigResourceContext, Result<Option<ConfigRecord>>)>> {
        if keys.is_empty() {
            return Err(StoreError::InvalidArgument("no configs to delete".into()));
        }
        histogram!(STORE_BULK_SIZE, "operation" => "bulk_delete").record(keys.len() as f64);

        self.bounded(ctx, "bulk_delete", async {
            let _monitors = self.monitors.lock_all(keys).await;

            let mut prepared = Vec::with_capacity(keys.len());
            let mut absent = HashSet::new();
            let mut seen = HashSet::new();
            for key in keys {
                // A repeated key was already deleted by its first occurrence.
                if !seen.insert(key) {
                    absent.insert(prepared.len());
                    prepared.push((key.clone(), Err(StoreError::NotFound(key.to_string()))));
                    continue;
                }
                let pending = match self.prepare_delete(ctx, key).await {
                    Ok(Some(pending)) => Ok(pending),
                    Ok(None) => {
                        absent.insert(prepared.len());
                        Err(StoreError::NotFound(key.to_string()))
                    }
                    Err(e) => Err(e),
                };
                prepared.push((key.clone(), pending));
            }

            let results = self
                .commit_all(prepared, |pending| Ok(pending.previous))
                .await?;
            // Absent keys are reported as `None`, like a single delete.
            Ok(results
                .into_iter()
                .enumerate()
                .map(|(i, (key, result))| {
                    if absent.contains(&i) {
                        (key, Ok(None))
                    } else {
                        (key, result)
                    }
                })
                .collect())
        })
        .await
    }

    /// The default context of `resource` deep-merged with each of `contexts`
    /// in order, later contexts taking precedence. Timestamps are those of
    /// the most specific live record.
    pub async fn read_merged(
        &self,
        ctx: &RequestContext,
        resource: &ConfigResource,
        contexts: &[String],
    ) -> Result<Option<MergedConfig>> {
        let keys: Vec<ConfigResourceContext> = std::iter::once(resource.default_context())
            .chain(contexts.iter().map(|c| resource.context(c.as_str())))
            .collect();
        let records = self.read_many(ctx, &keys).await?;

        Ok(records
            .into_values()
            .fold(None, |merged: Option<MergedConfig>, record| {
                let value = match merged {
                    Some(merged) => value::merge(&merged.value, &record.value),
                    None => record.value,
                };
                Some(MergedConfig {
                    value,
                    creation_timestamp: record.creation_timestamp,
                    update_timestamp: record.update_timestamp,
                })
            }))
    }

    /// Latest live records for the given keys, in input order. Keys without
    /// a live record are omitted.
    pub async fn read_many(
        &self,
        ctx: &RequestContext,
        keys: &[ConfigResourceContext],
    ) -> Result<IndexMap<ConfigResourceContext, ConfigRecord>> {
        self.bounded(ctx, "read_many", async {
            let mut records = IndexMap::with_capacity(keys.len());
            for key in keys {
                if let Some(record) = self.latest(key).await?.and_then(ConfigDocument::into_record) {
                    records.insert(key.clone(), record);
                }
            }
            Ok(records)
        })
        .await
    }

    /// Number of live contexts of `resource` matching `filter`.
    pub async fn count(
        &self,
        ctx: &RequestContext,
        resource: &ConfigResource,
        filter: Option<&FilterExpression>,
    ) -> Result<u64> {
        self.bounded(ctx, "count", async {
            let filter = filter.map(filter::compile).transpose()?;
            Ok(self.latest_live(resource, filter.as_ref()).await?.len() as u64)
        })
        .await
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    async fn bounded<T, F>(&self, ctx: &RequestContext, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let deadline = ctx
            .deadline()
            .unwrap_or_else(|| start + self.operation_timeout);
        let result = tokio::time::timeout_at(deadline, future)
            .await
            .unwrap_or_else(|elapsed| Err(elapsed.into()));

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        if let Err(e) = &result {
            tracing::debug!(operation, error = %e, "Store operation failed");
        }
        counter!(STORE_REQUESTS, "operation" => operation, "outcome" => outcome).increment(1);
        histogram!(STORE_DURATION, "operation" => operation).record(start.elapsed().as_secs_f64());
        result
    }

    async fn latest(&self, key: &ConfigResourceContext) -> Result<Option<ConfigDocument>> {
        let query = Query::new(key_predicate(key))
            .sort_by(VERSION_FIELD, SortOrder::Descending)
            .limit(1);
        Ok(self.backend.find(&query).await?.into_iter().next())
    }

    // Latest version of every context, tombstones dropped, then filtered.
    // Filtering after dedup keeps superseded versions from matching.
    async fn latest_live(
        &self,
        resource: &ConfigResource,
        filter: Option<&Predicate>,
    ) -> Result<Vec<ConfigDocument>> {
        let query =
            Query::new(resource_predicate(resource)).sort_by(VERSION_FIELD, SortOrder::Descending);
        let mut seen = HashSet::new();
        Ok(self
            .backend
            .find(&query)
            .await?
            .into_iter()
            .filter(|d| seen.insert(d.context.clone()))
            .filter(|d| !d.is_tombstone())
            .filter(|d| filter.is_none_or(|f| f.matches(d)))
            .collect())
    }

    async fn prepare_write(
        &self,
        ctx: &RequestContext,
        key: &ConfigResourceContext,
        value: Value,
    ) -> Result<PendingWrite> {
        let latest = self.latest(key).await?;
        let version = latest.as_ref().map_or(1, |d| d.version + 1);
        let previous = latest.and_then(ConfigDocument::into_record);
        let now = self.clock.now_millis();
        let creation_timestamp = previous.as_ref().map_or(now, |p| p.creation_timestamp);

        Ok(PendingWrite {
            document: ConfigDocument::new(
                key,
                version,
                value,
                ctx.user_id(),
                ctx.user_email(),
                creation_timestamp,
                now,
            ),
            previous,
        })
    }

    async fn prepare_delete(
        &self,
        ctx: &RequestContext,
        key: &ConfigResourceContext,
    ) -> Result<Option<PendingWrite>> {
        let Some(previous) = self.latest(key).await?.and_then(ConfigDocument::into_record) else {
            return Ok(None);
        };
        let tombstone = ConfigDocument::new(
            key,
            previous.version + 1,
            Value::Null,
            ctx.user_id(),
            ctx.user_email(),
            previous.creation_timestamp,
            self.clock.now_millis(),
        );
        Ok(Some(PendingWrite {
            document: tombstone,
            previous: Some(previous),
        }))
    }

    // The precondition is pinned to the version the new document was
    // computed from, so a concurrent writer that advanced the key makes it
    // match nothing. A deleted key has nothing live to match, like a
    // missing one.
    async fn commit_conditional(
        &self,
        key: &ConfigResourceContext,
        pending: &PendingWrite,
        precondition: Predicate,
    ) -> Result<()> {
        let expected_version = pending.document.version - 1;
        let condition = key_predicate(key)
            .and(Predicate::eq(VERSION_FIELD, expected_version))
            .and(precondition);
        if pending.previous.is_none()
            || !self
                .backend
                .insert_if(pending.document.clone(), &condition)
                .await?
        {
            counter!(STORE_WRITE_CONFLICTS).increment(1);
            tracing::warn!(key = %key, expected_version, "Write precondition did not match");
            return Err(StoreError::Conflict(format!(
                "precondition failed for {key}"
            )));
        }
        Ok(())
    }

    async fn commit_all<T, F>(
        &self,
        prepared: Vec<(ConfigResourceContext, Result<PendingWrite>)>,
        finish: F,
    ) -> Result<Vec<(ConfigResourceContext, Result<T>)>>
    where
        F: Fn(PendingWrite) -> Result<T>,
    {
        let documents: Vec<ConfigDocument> = prepared
            .iter()
            .filter_map(|(_, pending)| pending.as_ref().ok())
            .map(|pending| pending.document.clone())
            .collect();
        let mut outcomes = self.backend.bulk_insert(documents).await?.into_iter();

        Ok(prepared
            .into_iter()
            .map(|(key, pending)| {
                let result = pending.and_then(|pending| match outcomes.next() {
                    Some(Ok(())) => finish(pending),
                    Some(Err(e)) => {
                        if matches!(e, crate::backend::BackendError::DuplicateVersion { .. }) {
                            counter!(STORE_WRITE_CONFLICTS).increment(1);
                        }
                        Err(e.into())
                    }
                    None => Err(StoreError::Internal(
                        "backend returned fewer results than documents".into(),
                    )),
                });
                (key, result)
            })
            .collect())
    }
}

fn check_writable(key: &ConfigResourceContext, value: &Value) -> Result<()> {
    if value.is_null() {
        return Err(StoreError::InvalidArgument(format!(
            "cannot write null config for {key}, use delete"
        )));
    }
    Ok(())
}
