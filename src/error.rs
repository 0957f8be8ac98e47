//! Error types for the vault

use std::time::Duration;

use thiserror::Error;

use crate::checksum::Fingerprint;
use crate::index::LockHolder;

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Vault errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: content changed since it was read (current fingerprint {current})")]
    Conflict { current: Fingerprint },

    #[error("Release already exists: {tag}")]
    ReleaseExists { tag: String },

    #[error("Slug already taken for {item_type}: {slug}")]
    SlugTaken { item_type: String, slug: String },

    #[error("Lock '{lock}' held by {holder}; gave up after {waited:?}")]
    Locked {
        lock: &'static str,
        holder: LockHolder,
        waited: Duration,
    },

    #[error("Store is closed")]
    Closed,

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

impl VaultError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Fingerprint precondition failures and release/slug collisions
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::ReleaseExists { .. } | Self::SlugTaken { .. }
        )
    }

    /// Conditions a caller may retry after re-fetching or backing off
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Locked { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
