//! Process-local locking for the config store.
//!
//! `KeyMonitors` serialize the read-latest, increment, insert sequence of
//! writes to one key. `TenantLocks` serialize check-then-create flows across
//! a whole tenant. Neither replaces the backend's conditional insert, which
//! remains the only guarantee across processes.

use crate::errors::{Result, StoreError};
use crate::metrics_defs::{KEY_MONITORS, TENANT_LOCK_TIMEOUTS};
use crate::types::ConfigResourceContext;
use moka::sync::Cache;
use shared::{counter, gauge};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_MONITOR_IDLE: Duration = Duration::from_secs(600);
pub const DEFAULT_TENANT_LOCK_STRIPES: usize = 1000;
pub const DEFAULT_TENANT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KeyMonitors {
    // No capacity bound: size-based eviction could drop a monitor that is
    // still held.
    monitors: Cache<ConfigResourceContext, Arc<Mutex<()>>>,
}

impl KeyMonitors {
    pub fn new(idle: Duration) -> Self {
        KeyMonitors {
            monitors: Cache::builder().time_to_idle(idle).build(),
        }
    }

    pub async fn lock(&self, key: &ConfigResourceContext) -> OwnedMutexGuard<()> {
        let monitor = self
            .monitors
            .get_with_by_ref(key, || Arc::new(Mutex::new(())));
        gauge!(KEY_MONITORS).set(self.monitors.entry_count() as f64);
        monitor.lock_owned().await
    }

    /// Locks every key in sorted order so concurrent bulk calls cannot
    /// deadlock. Duplicate keys are locked once.
    pub async fn lock_all<'a, I>(&self, keys: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a ConfigResourceContext>,
    {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }
}

impl Default for KeyMonitors {
    fn default() -> Self {
        Self::new(DEFAULT_MONITOR_IDLE)
    }
}

pub struct TenantLocks {
    stripes: Vec<Arc<Mutex<()>>>,
    timeout: Duration,
}

impl TenantLocks {
    pub fn new(stripes: usize, timeout: Duration) -> Self {
        TenantLocks {
            stripes: (0..stripes.max(1)).map(|_| Arc::new(Mutex::new(()))).collect(),
            timeout,
        }
    }

    fn stripe(&self, tenant_id: &str) -> &Arc<Mutex<()>> {
        let mut hasher = DefaultHasher::new();
        tenant_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() % self.stripes.len() as u64) as usize]
    }

    /// Waits up to the configured timeout for the tenant's stripe.
    pub async fn lock(&self, tenant_id: &str) -> Result<OwnedMutexGuard<()>> {
        let stripe = self.stripe(tenant_id).clone();
        match tokio::time::timeout(self.timeout, stripe.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                counter!(TENANT_LOCK_TIMEOUTS).increment(1);
                tracing::warn!(tenant_id, timeout = ?self.timeout, "Timed out waiting for tenant lock");
                Err(StoreError::Aborted(format!(
                    "timed out acquiring lock for tenant {tenant_id}"
                )))
            }
        }
    }
}

impl Default for TenantLocks {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_LOCK_STRIPES, DEFAULT_TENANT_LOCK_TIMEOUT)
    }
}
