use crate::backend::Compression;
use crate::guard::{DEFAULT_MONITOR_IDLE, DEFAULT_TENANT_LOCK_STRIPES, DEFAULT_TENANT_LOCK_TIMEOUT};
use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("tenant_lock_stripes cannot be 0")]
    NoTenantLockStripes,

    #[error("{0} cannot be 0")]
    ZeroTimeout(&'static str),

    #[error("filesystem backend requires a non-empty {0}")]
    EmptyPath(&'static str),
}

fn default_compression_level() -> Option<i32> {
    Some(1)
}

#[derive(Clone, Default, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum BackendConfig {
    #[default]
    Memory,
    Filesystem {
        base_dir: String,
        filename: String,
        /// zstd level; `null` stores the snapshot uncompressed.
        #[serde(default = "default_compression_level")]
        compression_level: Option<i32>,
    },
}

impl BackendConfig {
    pub fn compression(&self) -> Compression {
        match self {
            BackendConfig::Memory => Compression::None,
            BackendConfig::Filesystem {
                compression_level, ..
            } => Compression::from_level(*compression_level),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub monitor_idle_secs: u64,
    pub tenant_lock_stripes: usize,
    pub tenant_lock_timeout_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            monitor_idle_secs: DEFAULT_MONITOR_IDLE.as_secs(),
            tenant_lock_stripes: DEFAULT_TENANT_LOCK_STRIPES,
            tenant_lock_timeout_secs: DEFAULT_TENANT_LOCK_TIMEOUT.as_secs(),
        }
    }
}

impl GuardConfig {
    pub fn monitor_idle(&self) -> Duration {
        Duration::from_secs(self.monitor_idle_secs)
    }

    pub fn tenant_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.tenant_lock_timeout_secs)
    }
}

fn default_operation_timeout_ms() -> u64 {
    5000
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    /// Applied to operations whose request carries no deadline.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: BackendConfig::default(),
            guard: GuardConfig::default(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let BackendConfig::Filesystem {
            base_dir, filename, ..
        } = &self.backend
        {
            if base_dir.is_empty() {
                return Err(ValidationError::EmptyPath("base_dir"));
            }
            if filename.is_empty() {
                return Err(ValidationError::EmptyPath("filename"));
            }
        }

        if self.guard.tenant_lock_stripes == 0 {
            return Err(ValidationError::NoTenantLockStripes);
        }
        if self.guard.monitor_idle_secs == 0 {
            return Err(ValidationError::ZeroTimeout("monitor_idle_secs"));
        }
        if self.guard.tenant_lock_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout("tenant_lock_timeout_secs"));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout("operation_timeout_ms"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: StoreConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.guard.tenant_lock_stripes, 1000);
        assert_eq!(config.guard.tenant_lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.guard.monitor_idle(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filesystem_backend() {
        let yaml = r#"
            backend:
                type: filesystem
                base_dir: /var/lib/configd
                filename: configs.zst
            guard:
                tenant_lock_stripes: 16
            operation_timeout_ms: 250
            "#;
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Filesystem {
                base_dir: "/var/lib/configd".into(),
                filename: "configs.zst".into(),
                compression_level: Some(1),
            }
        );
        assert_eq!(config.backend.compression(), Compression::Zstd(1));
        assert_eq!(config.guard.tenant_lock_stripes, 16);
        assert_eq!(config.guard.tenant_lock_timeout_secs, 5);
        assert_eq!(config.operation_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_uncompressed_snapshot() {
        let yaml = r#"
            backend:
                type: filesystem
                base_dir: /tmp
                filename: configs.json
                compression_level: null
            "#;
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend.compression(), Compression::None);
    }

    #[test]
    fn test_validation() {
        let mut config = StoreConfig::default();
        config.guard.tenant_lock_stripes = 0;
        assert_eq!(config.validate(), Err(ValidationError::NoTenantLockStripes));

        let mut config = StoreConfig::default();
        config.guard.tenant_lock_timeout_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroTimeout("tenant_lock_timeout_secs"))
        );

        let mut config = StoreConfig::default();
        config.operation_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ValidationError::ZeroTimeout(_))));

        let config = StoreConfig {
            backend: BackendConfig::Filesystem {
                base_dir: "/tmp".into(),
                filename: "".into(),
                compression_level: None,
            },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::EmptyPath("filename")));
    }
}
