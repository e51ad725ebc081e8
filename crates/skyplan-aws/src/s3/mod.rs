//! Object-store engine
//!
//! Every object-scoped call resolves the bucket's region first and signs for it.

mod bucket;
mod copy;
mod empty;
pub mod encoding;
mod object;
pub mod types;

pub use copy::{CopyProgress, CopyReport, CopyStatus};
pub use empty::EmptyReport;
pub use types::{ObjectIdentifier, ObjectMeta, ObjectSummary, ObjectVersion};

use crate::client::{ApiRequest, SigningClient};
use crate::xml;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use skyplan_config::CopyConfig;
use skyplan_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// S3 caps DeleteObjects at 1000 keys
pub const MAX_DELETE_BATCH: usize = 1000;

/// Largest object a single CopyObject may copy
pub const SINGLE_COPY_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// bucket -> region
#[derive(Debug, Default)]
pub struct RegionCache {
    entries: Mutex<HashMap<String, String>>,
}

static GLOBAL_REGIONS: Lazy<Arc<RegionCache>> = Lazy::new(|| Arc::new(RegionCache::default()));

impl RegionCache {
    /// Process-wide cache
    pub fn global() -> Arc<RegionCache> {
        GLOBAL_REGIONS.clone()
    }

    pub fn get(&self, bucket: &str) -> Option<String> {
        self.entries.lock().get(bucket).cloned()
    }

    pub fn insert(&self, bucket: &str, region: &str) {
        self.entries
            .lock()
            .insert(bucket.to_string(), region.to_string());
    }

    pub fn remove(&self, bucket: &str) {
        self.entries.lock().remove(bucket);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Debug, Clone)]
pub struct CopySettings {
    pub concurrency: usize,
    /// UploadPartCopy requests in flight per object
    pub part_concurrency: usize,
    pub part_size: u64,
    pub multipart_threshold: u64,
    pub progress_interval: Duration,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self::from(&CopyConfig::default())
    }
}

impl From<&CopyConfig> for CopySettings {
    fn from(config: &CopyConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            part_concurrency: config.part_concurrency.max(1),
            part_size: config.part_size_bytes(),
            multipart_threshold: config.multipart_threshold_bytes().min(SINGLE_COPY_LIMIT),
            progress_interval: config.progress_interval(),
        }
    }
}

#[derive(Clone)]
pub struct S3Service {
    client: SigningClient,
    regions: Arc<RegionCache>,
    settings: CopySettings,
}

impl S3Service {
    pub fn new(client: SigningClient) -> Self {
        Self {
            client,
            regions: RegionCache::global(),
            settings: CopySettings::default(),
        }
    }

    pub fn with_region_cache(mut self, regions: Arc<RegionCache>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_copy_settings(mut self, settings: CopySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn client(&self) -> &SigningClient {
        &self.client
    }

    /// Region of `bucket` via GetBucketLocation; an empty constraint means us-east-1
    pub async fn bucket_region(&self, bucket: &str) -> Result<String> {
        if let Some(region) = self.regions.get(bucket) {
            return Ok(region);
        }

        let response = self
            .client
            .request(
                ApiRequest::get("s3", format!("/{}", bucket))
                    .query("location", "")
                    .region("us-east-1"),
            )
            .await?;
        let constraint = xml::first_text(&response.body_text(), "LocationConstraint")
            .unwrap_or_default();
        let region = normalize_location(&constraint);

        debug!(bucket = %bucket, region = %region, "Resolved bucket region");
        self.regions.insert(bucket, &region);
        Ok(region)
    }

    /// Client signed for the bucket's region
    pub async fn client_for(&self, bucket: &str) -> Result<SigningClient> {
        let region = self.bucket_region(bucket).await?;
        Ok(self.client.for_region(region))
    }
}

/// Legacy constraint values map onto their modern region names
fn normalize_location(constraint: &str) -> String {
    match constraint.trim() {
        "" | "US" => "us-east-1".to_string(),
        "EU" => "eu-west-1".to_string(),
        other => other.to_string(),
    }
}
