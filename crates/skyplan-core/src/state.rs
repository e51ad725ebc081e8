//! Versioned state document persisted by a state backend

use crate::error::{Result, SkyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl StateDocument {
    /// Initial document returned when no state exists yet
    pub fn empty() -> Self {
        Self {
            version: 1,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version < 1 {
            return Err(SkyError::invalid_input(format!(
                "state version must be >= 1, got {}",
                self.version
            )));
        }
        Ok(())
    }

    /// Equality ignoring `updated_at`
    pub fn same_content(&self, other: &StateDocument) -> bool {
        self.version == other.version
            && self.resources == other.resources
            && self.outputs == other.outputs
    }
}

/// Contents of a `${key}.lock` object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub locked_at: DateTime<Utc>,
    pub locked_by: String,
}
