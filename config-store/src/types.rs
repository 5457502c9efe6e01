use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Context used for the singleton instance of a resource.
pub const DEFAULT_CONTEXT: &str = "DEFAULT-CONTEXT";

/// Stored in place of missing audit attribution.
pub const UNKNOWN_USER: &str = "Unknown";

/// Identity of a configuration family owned by one tenant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigResource {
    pub resource_name: String,
    pub resource_namespace: String,
    pub tenant_id: String,
}

impl ConfigResource {
    pub fn new<N, S, T>(resource_name: N, resource_namespace: S, tenant_id: T) -> Self
    where
        N: Into<String>,
        S: Into<String>,
        T: Into<String>,
    {
        ConfigResource {
            resource_name: resource_name.into(),
            resource_namespace: resource_namespace.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// The key of one instance of this resource.
    pub fn context<C: Into<String>>(&self, context: C) -> ConfigResourceContext {
        ConfigResourceContext::new(self.clone(), context)
    }

    /// The key of the singleton instance of this resource.
    pub fn default_context(&self) -> ConfigResourceContext {
        ConfigResourceContext::new(self.clone(), DEFAULT_CONTEXT)
    }
}

impl fmt::Display for ConfigResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.resource_namespace, self.resource_name, self.tenant_id
        )
    }
}

/// A specific instance within a configuration resource.
///
/// An empty context is normalised to [`DEFAULT_CONTEXT`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigResourceContext {
    pub resource: ConfigResource,
    pub context: String,
}

impl ConfigResourceContext {
    pub fn new<C: Into<String>>(resource: ConfigResource, context: C) -> Self {
        let context = context.into();
        ConfigResourceContext {
            resource,
            context: if context.is_empty() {
                DEFAULT_CONTEXT.to_string()
            } else {
                context
            },
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.resource.tenant_id
    }
}

impl fmt::Display for ConfigResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.resource, self.context)
    }
}

/// One live version of a config, as returned to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigRecord {
    pub key: ConfigResourceContext,
    pub version: u64,
    pub value: Value,
    pub created_by_user_id: String,
    pub created_by_user_email: String,
    /// Epoch milliseconds, carried forward across updates.
    pub creation_timestamp: u64,
    /// Epoch milliseconds of the write that produced this version.
    pub update_timestamp: u64,
}

impl ConfigRecord {
    pub fn context(&self) -> &str {
        &self.key.context
    }
}

/// Result of a single write.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WriteResult {
    pub record: ConfigRecord,
    /// The live record the write replaced, if any.
    pub previous: Option<ConfigRecord>,
}

/// Several contexts of a resource merged into one effective value.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergedConfig {
    pub value: Value,
    pub creation_timestamp: u64,
    pub update_timestamp: u64,
}

/// Per-call information: who is calling and how long they are willing to wait.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    user_id: Option<String>,
    user_email: Option<String>,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user<I, E>(mut self, user_id: I, user_email: E) -> Self
    where
        I: Into<String>,
        E: Into<String>,
    {
        self.user_id = Some(user_id.into());
        self.user_email = Some(user_email.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(UNKNOWN_USER)
    }

    pub fn user_email(&self) -> &str {
        self.user_email.as_deref().unwrap_or(UNKNOWN_USER)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
