//! Provider capability sets
//!
//! Consumers depend on the narrow trait they use; a provider implementation is
//! selected by name through [`ProviderKind`].

use crate::error::{Result, SkyError};
use crate::intent::IntentKind;
use crate::state::StateDocument;
use async_trait::async_trait;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Aws,
}

impl FromStr for ProviderKind {
    type Err = SkyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" | "amazon" => Ok(ProviderKind::Aws),
            _ => Err(SkyError::invalid_input(format!(
                "unsupported provider '{}'. Supported: aws",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Aws => write!(f, "aws"),
        }
    }
}

/// Existence checks used to switch a plan into adoption mode
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Returns Ok(false) for kinds the provider cannot probe.
    async fn exists(&self, kind: IntentKind, name: &str) -> Result<bool>;
}

/// Remote state persistence
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<StateDocument>;

    /// Persist `doc`, stamping `updated_at`
    async fn write(&self, key: &str, doc: &mut StateDocument) -> Result<()>;

    async fn lock(&self, key: &str) -> Result<()>;

    async fn unlock(&self, key: &str) -> Result<()>;
}
