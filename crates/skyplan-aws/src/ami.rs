//! Image alias resolution
//!
//! An alias such as `ubuntu-lts` resolves to a concrete `ami-` id through one of
//! three strategies: the public SSM parameters, a filtered `DescribeImages`, or an
//! embedded table. Results are cached per `(region, alias)` for a TTL.

use crate::client::{ApiRequest, SigningClient};
use crate::{system_clock, xml, Clock};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skyplan_config::{AmiConfig, AmiStrategy};
use skyplan_core::validation::is_image_id;
use skyplan_core::{Result, SkyError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmiSource {
    Ssm,
    Describe,
    Static,
}

impl std::fmt::Display for AmiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmiSource::Ssm => write!(f, "ssm"),
            AmiSource::Describe => write!(f, "describe"),
            AmiSource::Static => write!(f, "static"),
        }
    }
}

/// Public SSM parameter holding the latest image id for an alias
fn ssm_parameter(alias: &str) -> Option<&'static str> {
    match alias {
        "ubuntu-lts" | "ubuntu" | "ubuntu-22.04" => {
            Some("/aws/service/canonical/ubuntu/server/22.04/stable/current/amd64/hvm/ebs-gp2/ami-id")
        }
        "ubuntu-24.04" => {
            Some("/aws/service/canonical/ubuntu/server/24.04/stable/current/amd64/hvm/ebs-gp3/ami-id")
        }
        "amazon-linux" | "amazon-linux-2023" | "al2023" => {
            Some("/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64")
        }
        "amazon-linux-2" | "amzn2" => {
            Some("/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-x86_64-gp2")
        }
        "debian" | "debian-12" => Some("/aws/service/debian/release/12/latest/amd64"),
        "windows" | "windows-2022" => {
            Some("/aws/service/ami-windows-latest/Windows_Server-2022-English-Full-Base")
        }
        _ => None,
    }
}

/// `DescribeImages` filters for an alias
struct ImageFilter {
    name: &'static str,
    owner: &'static str,
    architecture: &'static str,
}

fn describe_filter(alias: &str) -> Option<ImageFilter> {
    let (name, owner) = match alias {
        "ubuntu-lts" | "ubuntu" | "ubuntu-22.04" => (
            "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*",
            "099720109477",
        ),
        "ubuntu-24.04" => (
            "ubuntu/images/hvm-ssd-gp3/ubuntu-noble-24.04-amd64-server-*",
            "099720109477",
        ),
        "amazon-linux" | "amazon-linux-2023" | "al2023" => {
            ("al2023-ami-2023.*-x86_64", "137112412989")
        }
        "amazon-linux-2" | "amzn2" => ("amzn2-ami-hvm-*-x86_64-gp2", "137112412989"),
        "debian" | "debian-12" => ("debian-12-amd64-*", "136693071363"),
        "windows" | "windows-2022" => (
            "Windows_Server-2022-English-Full-Base-*",
            "801119661308",
        ),
        _ => return None,
    };
    Some(ImageFilter {
        name,
        owner,
        architecture: "x86_64",
    })
}

const STATIC_FALLBACK_REGION: &str = "us-east-1";

/// Used when neither the alias nor the region is in the table
pub const UNIVERSAL_FALLBACK_IMAGE: &str = "ami-0c02fb55956c7d316";

fn static_table(alias: &str) -> &'static [(&'static str, &'static str)] {
    match alias {
        "ubuntu-lts" | "ubuntu" | "ubuntu-22.04" => &[
            ("us-east-1", "ami-0c7217cdde317cfec"),
            ("us-west-2", "ami-008fe2fc65df48dac"),
            ("eu-west-1", "ami-0905a3c97561e0b69"),
        ],
        "amazon-linux" | "amazon-linux-2023" | "al2023" => &[
            ("us-east-1", "ami-0230bd60aa48260c6"),
            ("us-west-2", "ami-0b20a6f09484773af"),
            ("eu-west-1", "ami-0d3a2960fcac852bc"),
        ],
        _ => &[],
    }
}

/// Embedded lookup: the region's entry, else the us-east-1 entry, else the universal fallback
pub fn static_image(alias: &str, region: &str) -> &'static str {
    let table = static_table(alias);
    table
        .iter()
        .find(|(r, _)| *r == region)
        .or_else(|| table.iter().find(|(r, _)| *r == STATIC_FALLBACK_REGION))
        .map(|(_, id)| *id)
        .unwrap_or(UNIVERSAL_FALLBACK_IMAGE)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    image_id: String,
    timestamp: DateTime<Utc>,
    source: AmiSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub ssm: usize,
    pub describe: usize,
    pub r#static: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub ttl_hours: u64,
    pub sources: SourceCounts,
    /// Entries past their TTL that have not been evicted yet
    pub expired: usize,
}

/// `(region, alias) -> image id` with a TTL
pub struct AmiCache {
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
    ttl: Duration,
    clock: Clock,
}

static GLOBAL_CACHE: OnceCell<Arc<AmiCache>> = OnceCell::new();

impl AmiCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Process-wide cache; the TTL of the first caller wins
    pub fn global(ttl: Duration) -> Arc<AmiCache> {
        GLOBAL_CACHE
            .get_or_init(|| Arc::new(AmiCache::new(ttl)))
            .clone()
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.timestamp)
            .to_std()
            .map(|age| age < self.ttl)
            // timestamp in the future
            .unwrap_or(true)
    }

    /// Fresh entry for the key; a stale one is evicted
    pub fn get(&self, region: &str, alias: &str) -> Option<(String, AmiSource)> {
        let now = (self.clock)();
        let key = (region.to_string(), alias.to_string());
        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if self.is_fresh(entry, now) {
            return Some((entry.image_id.clone(), entry.source));
        }
        entries.remove(&key);
        None
    }

    pub fn insert(&self, region: &str, alias: &str, image_id: &str, source: AmiSource) {
        let entry = CacheEntry {
            image_id: image_id.to_string(),
            timestamp: (self.clock)(),
            source,
        };
        self.entries
            .lock()
            .insert((region.to_string(), alias.to_string()), entry);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let now = (self.clock)();
        let entries = self.entries.lock();
        let mut sources = SourceCounts::default();
        let mut expired = 0;
        for entry in entries.values() {
            match entry.source {
                AmiSource::Ssm => sources.ssm += 1,
                AmiSource::Describe => sources.describe += 1,
                AmiSource::Static => sources.r#static += 1,
            }
            if !self.is_fresh(entry, now) {
                expired += 1;
            }
        }
        CacheStats {
            size: entries.len(),
            ttl_hours: self.ttl.as_secs() / 3600,
            sources,
            expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    pub image_id: String,
    pub source: AmiSource,
    pub cached: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DescribeImagesResponse {
    #[serde(rename = "imagesSet", default)]
    images_set: ImagesSet,
}

#[derive(Debug, Default, Deserialize)]
struct ImagesSet {
    #[serde(rename = "item", default)]
    items: Vec<ImageItem>,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    #[serde(rename = "imageId")]
    image_id: String,
    #[serde(rename = "creationDate", default)]
    creation_date: String,
}

/// Alias resolver bound to the client's region
#[derive(Clone)]
pub struct AmiResolver {
    client: SigningClient,
    cache: Arc<AmiCache>,
    strategy: AmiStrategy,
    cache_enabled: bool,
    fallback_to_static: bool,
}

impl AmiResolver {
    pub fn new(client: SigningClient, config: &AmiConfig) -> Self {
        Self {
            client,
            cache: AmiCache::global(config.ttl()),
            strategy: config.strategy,
            cache_enabled: config.cache_enabled,
            fallback_to_static: config.fallback_to_static,
        }
    }

    pub fn with_cache(mut self, cache: Arc<AmiCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<AmiCache> {
        &self.cache
    }

    pub async fn resolve(&self, alias: &str) -> Result<String> {
        Ok(self.lookup(alias).await?.image_id)
    }

    /// Resolve `input`, reporting which strategy produced the id
    pub async fn lookup(&self, input: &str) -> Result<ResolvedImage> {
        let input = input.trim();
        if is_image_id(input) {
            return Ok(ResolvedImage {
                image_id: input.to_string(),
                source: AmiSource::Static,
                cached: false,
            });
        }
        if input.starts_with("ami-") {
            return Err(SkyError::InvalidImageId(input.to_string()));
        }
        if input.is_empty() {
            return Err(SkyError::invalid_input("image alias must not be empty"));
        }

        let alias = input.to_lowercase();
        let region = self.client.region().to_string();

        if self.cache_enabled {
            if let Some((image_id, source)) = self.cache.get(&region, &alias) {
                debug!(alias = %alias, region = %region, image = %image_id, "AMI cache hit");
                return Ok(ResolvedImage {
                    image_id,
                    source,
                    cached: true,
                });
            }
        }

        let (image_id, source) = match self.strategy {
            AmiStrategy::Ssm => (self.from_ssm(&alias).await?, AmiSource::Ssm),
            AmiStrategy::Describe => (self.from_describe(&alias).await?, AmiSource::Describe),
            AmiStrategy::Static => (
                static_image(&alias, &region).to_string(),
                AmiSource::Static,
            ),
            AmiStrategy::Auto => self.auto(&alias, &region).await?,
        };

        info!(alias = %alias, region = %region, image = %image_id, source = %source, "Resolved image");
        if self.cache_enabled {
            self.cache.insert(&region, &alias, &image_id, source);
        }
        Ok(ResolvedImage {
            image_id,
            source,
            cached: false,
        })
    }

    async fn auto(&self, alias: &str, region: &str) -> Result<(String, AmiSource)> {
        let ssm_err = match self.from_ssm(alias).await {
            Ok(id) => return Ok((id, AmiSource::Ssm)),
            Err(e) => e,
        };
        debug!(alias = %alias, error = %ssm_err, "SSM lookup failed; trying DescribeImages");

        let describe_err = match self.from_describe(alias).await {
            Ok(id) => return Ok((id, AmiSource::Describe)),
            Err(e) => e,
        };
        debug!(alias = %alias, error = %describe_err, "DescribeImages lookup failed");

        if self.fallback_to_static {
            return Ok((static_image(alias, region).to_string(), AmiSource::Static));
        }
        Err(describe_err)
    }

    async fn from_ssm(&self, alias: &str) -> Result<String> {
        let parameter = ssm_parameter(alias).ok_or_else(|| {
            SkyError::invalid_input(format!("no SSM parameter known for image alias '{}'", alias))
        })?;
        let response = self
            .client
            .request(ApiRequest::json_target(
                "ssm",
                "AmazonSSM.GetParameter",
                &serde_json::json!({ "Name": parameter }),
            ))
            .await?;
        let image_id = parse_parameter_value(&response.body_text()).ok_or_else(|| {
            SkyError::NotFound(format!("SSM parameter {} has no value", parameter))
        })?;
        checked_image_id(image_id)
    }

    async fn from_describe(&self, alias: &str) -> Result<String> {
        let filter = describe_filter(alias).ok_or_else(|| {
            SkyError::invalid_input(format!("no image filter known for alias '{}'", alias))
        })?;
        let response = self
            .client
            .request(
                ApiRequest::action("ec2", "DescribeImages")
                    .query("Owner.1", filter.owner)
                    .query("Filter.1.Name", "name")
                    .query("Filter.1.Value.1", filter.name)
                    .query("Filter.2.Name", "architecture")
                    .query("Filter.2.Value.1", filter.architecture)
                    .query("Filter.3.Name", "state")
                    .query("Filter.3.Value.1", "available"),
            )
            .await?;
        let parsed: DescribeImagesResponse = xml::from_xml(&response.body_text())?;
        let image_id = newest_image(parsed.images_set.items)
            .ok_or_else(|| SkyError::NotFound(format!("no available image matches '{}'", alias)))?;
        checked_image_id(image_id)
    }
}

/// Upstream replies count as failures unless they hold a well-formed id
fn checked_image_id(image_id: String) -> Result<String> {
    if is_image_id(&image_id) {
        Ok(image_id)
    } else {
        Err(SkyError::InvalidImageId(image_id))
    }
}

fn newest_image(mut items: Vec<ImageItem>) -> Option<String> {
    // ISO-8601 creation dates order lexicographically
    items.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
    items.into_iter().next().map(|item| item.image_id)
}

/// `Parameter.Value` from a JSON reply, or `<Value>` from an XML one
fn parse_parameter_value(body: &str) -> Option<String> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        return json
            .pointer("/Parameter/Value")
            .and_then(|v| v.as_str())
            .map(|v| v.trim().to_string());
    }
    xml::first_text(body, "Value").map(|v| v.trim().to_string())
}
