//! Remote state in a dedicated, versioned S3 bucket

use crate::s3::S3Service;
use crate::{system_clock, Clock};
use async_trait::async_trait;
use skyplan_config::StateConfig;
use skyplan_core::{LockInfo, Result, SkyError, StateDocument, StateStore};
use tracing::{debug, info};

/// State bucket for an app prefix and region
pub fn state_bucket_name(app_prefix: &str, region: &str) -> String {
    format!("{}-state-{}", app_prefix, region)
}

fn lock_key(key: &str) -> String {
    format!("{}.lock", key)
}

/// `user@host` of the current process
pub fn default_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", user, host)
}

#[derive(Clone)]
pub struct S3StateBackend {
    s3: S3Service,
    bucket: String,
    region: String,
    owner: String,
    clock: Clock,
}

impl S3StateBackend {
    pub fn new(s3: S3Service, app_prefix: &str, region: &str) -> Self {
        Self {
            s3,
            bucket: state_bucket_name(app_prefix, region),
            region: region.to_string(),
            owner: default_owner(),
            clock: system_clock(),
        }
    }

    pub fn from_config(s3: S3Service, config: &StateConfig, region: &str) -> Self {
        Self::new(s3, &config.app_prefix, region)
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the state bucket if needed and turn on versioning
    pub async fn init(&self) -> Result<()> {
        if !self.s3.bucket_exists(&self.bucket).await? {
            self.s3.create_bucket(&self.bucket, &self.region).await?;
        }
        self.s3.put_bucket_versioning(&self.bucket, true).await?;
        info!(bucket = %self.bucket, "State backend ready");
        Ok(())
    }

    /// Every object key in the state bucket, lock objects included
    pub async fn list_states(&self) -> Result<Vec<String>> {
        Ok(self
            .s3
            .list_objects(&self.bucket, "")
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect())
    }

    /// Current lock holder of `key`, if any
    pub async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        match self.s3.get_object(&self.bucket, &lock_key(key)).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl StateStore for S3StateBackend {
    async fn read(&self, key: &str) -> Result<StateDocument> {
        let body = match self.s3.get_object(&self.bucket, key).await {
            Ok(body) => body,
            Err(err) if err.is_not_found() => {
                debug!(bucket = %self.bucket, key = %key, "No state yet");
                let mut doc = StateDocument::empty();
                doc.updated_at = (self.clock)();
                return Ok(doc);
            }
            Err(err) => return Err(err),
        };
        let doc: StateDocument = serde_json::from_slice(&body)?;
        doc.validate()?;
        Ok(doc)
    }

    async fn write(&self, key: &str, doc: &mut StateDocument) -> Result<()> {
        doc.validate()?;
        doc.updated_at = (self.clock)();
        let body = serde_json::to_vec_pretty(doc)?;
        self.s3
            .put_object(&self.bucket, key, body, "application/json")
            .await?;
        info!(bucket = %self.bucket, key = %key, resources = doc.resources.len(), "Wrote state");
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<()> {
        if let Some(existing) = self.lock_info(key).await? {
            return Err(SkyError::StateLocked {
                key: key.to_string(),
                locked_by: existing.locked_by,
            });
        }
        let lock = LockInfo {
            locked_at: (self.clock)(),
            locked_by: self.owner.clone(),
        };
        self.s3
            .put_object(
                &self.bucket,
                &lock_key(key),
                serde_json::to_vec(&lock)?,
                "application/json",
            )
            .await?;
        debug!(key = %key, owner = %self.owner, "Locked state");
        Ok(())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        match self.s3.delete_object(&self.bucket, &lock_key(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
