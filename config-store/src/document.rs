//! The persisted form of a config version.

use crate::predicate::{FieldSource, Predicate};
use crate::types::{ConfigRecord, ConfigResource, ConfigResourceContext, UNKNOWN_USER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

pub const RESOURCE_FIELD: &str = "resourceName";
pub const RESOURCE_NAMESPACE_FIELD: &str = "resourceNamespace";
pub const TENANT_ID_FIELD: &str = "tenantId";
pub const CONTEXT_FIELD: &str = "context";
pub const VERSION_FIELD: &str = "configVersion";
pub const USER_ID_FIELD: &str = "lastUpdateUserId";
pub const USER_EMAIL_FIELD: &str = "lastUpdatedUserEmail";
pub const CONFIG_FIELD: &str = "config";
pub const CREATION_TIMESTAMP_FIELD: &str = "creationTimestamp";
pub const UPDATE_TIMESTAMP_FIELD: &str = "updateTimestamp";

fn unknown_user() -> String {
    UNKNOWN_USER.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "resourceName")]
    pub resource_name: String,
    #[serde(rename = "resourceNamespace")]
    pub resource_namespace: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub context: String,
    #[serde(rename = "configVersion")]
    pub version: u64,
    #[serde(rename = "lastUpdateUserId", default = "unknown_user")]
    pub user_id: String,
    #[serde(rename = "lastUpdatedUserEmail", default = "unknown_user")]
    pub user_email: String,
    /// A null config marks a tombstone.
    #[serde(default)]
    pub config: Value,
    #[serde(rename = "creationTimestamp")]
    pub creation_timestamp: u64,
    #[serde(rename = "updateTimestamp")]
    pub update_timestamp: u64,
}

impl ConfigDocument {
    pub fn new(
        key: &ConfigResourceContext,
        version: u64,
        config: Value,
        user_id: &str,
        user_email: &str,
        creation_timestamp: u64,
        update_timestamp: u64,
    ) -> Self {
        ConfigDocument {
            resource_name: key.resource.resource_name.clone(),
            resource_namespace: key.resource.resource_namespace.clone(),
            tenant_id: key.resource.tenant_id.clone(),
            context: key.context.clone(),
            version,
            user_id: user_id.to_string(),
            user_email: user_email.to_string(),
            config,
            creation_timestamp,
            update_timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.config.is_null()
    }

    pub fn key(&self) -> ConfigResourceContext {
        ConfigResourceContext {
            resource: ConfigResource::new(
                self.resource_name.as_str(),
                self.resource_namespace.as_str(),
                self.tenant_id.as_str(),
            ),
            context: self.context.clone(),
        }
    }

    /// The record view of this document, `None` for tombstones.
    pub fn into_record(self) -> Option<ConfigRecord> {
        if self.is_tombstone() {
            return None;
        }
        Some(ConfigRecord {
            key: self.key(),
            version: self.version,
            value: self.config,
            created_by_user_id: self.user_id,
            created_by_user_email: self.user_email,
            creation_timestamp: self.creation_timestamp,
            update_timestamp: self.update_timestamp,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl FieldSource for ConfigDocument {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        match (head, rest) {
            (CONFIG_FIELD, Some(rest)) => crate::value::lookup(&self.config, rest).map(Cow::Borrowed),
            (CONFIG_FIELD, None) => Some(Cow::Borrowed(&self.config)),
            (_, Some(_)) => None,
            (RESOURCE_FIELD, None) => Some(Cow::Owned(Value::from(self.resource_name.as_str()))),
            (RESOURCE_NAMESPACE_FIELD, None) => {
                Some(Cow::Owned(Value::from(self.resource_namespace.as_str())))
            }
            (TENANT_ID_FIELD, None) => Some(Cow::Owned(Value::from(self.tenant_id.as_str()))),
            (CONTEXT_FIELD, None) => Some(Cow::Owned(Value::from(self.context.as_str()))),
            (VERSION_FIELD, None) => Some(Cow::Owned(Value::from(self.version))),
            (USER_ID_FIELD, None) => Some(Cow::Owned(Value::from(self.user_id.as_str()))),
            (USER_EMAIL_FIELD, None) => Some(Cow::Owned(Value::from(self.user_email.as_str()))),
            (CREATION_TIMESTAMP_FIELD, None) => {
                Some(Cow::Owned(Value::from(self.creation_timestamp)))
            }
            (UPDATE_TIMESTAMP_FIELD, None) => Some(Cow::Owned(Value::from(self.update_timestamp))),
            _ => None,
        }
    }
}

/// Matches every version of every context of a resource.
pub fn resource_predicate(resource: &ConfigResource) -> Predicate {
    Predicate::eq(RESOURCE_FIELD, resource.resource_name.as_str())
        .and(Predicate::eq(
            RESOURCE_NAMESPACE_FIELD,
            resource.resource_namespace.as_str(),
        ))
        .and(Predicate::eq(TENANT_ID_FIELD, resource.tenant_id.as_str()))
}

/// Matches every version of one key.
pub fn key_predicate(key: &ConfigResourceContext) -> Predicate {
    resource_predicate(&key.resource).and(Predicate::eq(CONTEXT_FIELD, key.context.as_str()))
}
