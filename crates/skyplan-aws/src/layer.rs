//! Content-addressed layer archives
//!
//! A layer is keyed by the sha256 of its runtime's manifest files. The archive is
//! rebuilt only when it is missing or a manifest was modified after it.

use crate::sigv4::hash_hex;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use skyplan_config::LayerConfig;
use skyplan_core::validation::validate_resource_name;
use skyplan_core::{Result, SkyError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Dependency manifests of a runtime, in digest order
pub fn manifest_files(runtime: &str) -> &'static [&'static str] {
    if runtime.starts_with("python") {
        &["requirements.txt", "Pipfile.lock", "poetry.lock", "pyproject.toml"]
    } else if runtime.starts_with("nodejs") {
        &["package.json", "package-lock.json", "yarn.lock"]
    } else if runtime.starts_with("ruby") {
        &["Gemfile", "Gemfile.lock"]
    } else {
        &[]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    pub name: String,
    pub runtime: String,
    pub path: PathBuf,
    /// Manifest digest the archive is keyed by
    pub digest: String,
    pub size: u64,
    /// sha256 of the archive itself
    pub sha256: String,
    pub rebuilt: bool,
}

/// Produces a zip of a runtime's dependencies
#[async_trait]
pub trait LayerArchiveBuilder: Send + Sync {
    /// Build the archive for `src_dir` at `output` and return its path
    async fn build(&self, runtime: &str, src_dir: &Path, output: &Path) -> Result<PathBuf>;
}

/// Builds inside the runtime's SAM build image
#[derive(Debug, Clone, Default)]
pub struct DockerLayerBuilder {
    image: Option<String>,
}

impl DockerLayerBuilder {
    pub fn new(image: Option<String>) -> Self {
        Self { image }
    }

    pub fn image_for(&self, runtime: &str) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("public.ecr.aws/sam/build-{}:latest", runtime))
    }
}

/// Shell run inside the container; `/var/task` is the source, `/out` the cache dir
pub fn build_script(runtime: &str, archive: &str) -> Result<String> {
    let script = if runtime.starts_with("python") {
        format!(
            "pip install -q -r requirements.txt -t /tmp/layer/python && \
             cd /tmp/layer && zip -qr /out/{} python",
            archive
        )
    } else if runtime.starts_with("nodejs") {
        format!(
            "mkdir -p /tmp/layer/nodejs && cp package*.json /tmp/layer/nodejs/ && \
             cd /tmp/layer/nodejs && npm install --omit=dev --silent && \
             cd /tmp/layer && zip -qr /out/{} nodejs",
            archive
        )
    } else if runtime.starts_with("ruby") {
        format!(
            "bundle config set path /tmp/layer/ruby/gems && bundle install --quiet && \
             cd /tmp/layer && zip -qr /out/{} ruby",
            archive
        )
    } else {
        return Err(SkyError::invalid_input(format!(
            "layers are not supported for runtime '{}'",
            runtime
        )));
    };
    Ok(script)
}

#[async_trait]
impl LayerArchiveBuilder for DockerLayerBuilder {
    async fn build(&self, runtime: &str, src_dir: &Path, output: &Path) -> Result<PathBuf> {
        let file_name = output
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SkyError::invalid_input(format!("bad archive path {}", output.display())))?;
        let out_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let script = build_script(runtime, file_name)?;
        let image = self.image_for(runtime);

        info!(runtime = %runtime, image = %image, "Building layer in container");
        let result = Command::new("docker")
            .arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(format!("{}:/var/task:ro", src_dir.display()))
            .arg("-v")
            .arg(format!("{}:/out", out_dir.display()))
            .arg("-w")
            .arg("/var/task")
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg(&image)
            .arg("-c")
            .arg(&script)
            .output()
            .await
            .map_err(|e| SkyError::io("failed to run docker", e))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SkyError::io(
                format!("layer build in {} failed", image),
                std::io::Error::other(stderr.trim().to_string()),
            ));
        }
        Ok(output.to_path_buf())
    }
}

/// sha256 over the readable manifests of `runtime` in `src_dir`, with their paths
pub async fn manifest_digest(runtime: &str, src_dir: &Path) -> Result<(String, Vec<PathBuf>)> {
    let mut hasher = Sha256::new();
    let mut found = Vec::new();
    for name in manifest_files(runtime) {
        let path = src_dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(contents) => {
                hasher.update(&contents);
                found.push(path);
            }
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping manifest"),
        }
    }
    if found.is_empty() {
        return Err(SkyError::invalid_input(format!(
            "no {} manifest found in {} (looked for {})",
            runtime,
            src_dir.display(),
            manifest_files(runtime).join(", ")
        )));
    }
    Ok((hex::encode(hasher.finalize()), found))
}

async fn modified(path: &Path) -> Result<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map_err(|e| SkyError::io(format!("reading mtime of {}", path.display()), e))
}

/// Rebuild when the archive is missing or older than any manifest
pub async fn needs_rebuild(archive: &Path, manifests: &[PathBuf]) -> Result<bool> {
    if !tokio::fs::try_exists(archive)
        .await
        .map_err(|e| SkyError::io(format!("checking {}", archive.display()), e))?
    {
        return Ok(true);
    }
    let built = modified(archive).await?;
    for manifest in manifests {
        if modified(manifest).await? > built {
            return Ok(true);
        }
    }
    Ok(false)
}

pub struct LayerCache {
    dir: PathBuf,
    max_age: Duration,
    builder: Arc<dyn LayerArchiveBuilder>,
}

impl LayerCache {
    pub fn new(dir: impl Into<PathBuf>, builder: Arc<dyn LayerArchiveBuilder>) -> Self {
        Self {
            dir: dir.into(),
            max_age: Duration::from_secs(7 * 24 * 3600),
            builder,
        }
    }

    /// Cache under the configured directory, built with docker
    pub fn from_config(config: &LayerConfig, home: Option<&Path>) -> Self {
        Self {
            dir: config.cache_path(home),
            max_age: config.max_age(),
            builder: Arc::new(DockerLayerBuilder::new(config.builder_image.clone())),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_path(&self, name: &str, runtime: &str, digest: &str) -> PathBuf {
        let short = digest.get(..8).unwrap_or(digest);
        self.dir.join(format!("{}-{}-{}.zip", name, runtime, short))
    }

    /// Reuse or build the archive for `src_dir`
    #[instrument(skip(self, src_dir), fields(src = %src_dir.display()))]
    pub async fn build(&self, name: &str, runtime: &str, src_dir: &Path) -> Result<Layer> {
        validate_resource_name(name)?;
        let (digest, manifests) = manifest_digest(runtime, src_dir).await?;
        let path = self.archive_path(name, runtime, &digest);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SkyError::io(format!("creating {}", self.dir.display()), e))?;

        let rebuilt = needs_rebuild(&path, &manifests).await?;
        let path = if rebuilt {
            self.builder.build(runtime, src_dir, &path).await?
        } else {
            debug!(path = %path.display(), "Reusing cached layer");
            path
        };

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SkyError::io(format!("reading {}", path.display()), e))?;
        let layer = Layer {
            name: name.to_string(),
            runtime: runtime.to_string(),
            digest,
            size: bytes.len() as u64,
            sha256: hash_hex(&bytes),
            path,
            rebuilt,
        };
        info!(layer = %layer.name, path = %layer.path.display(), size = layer.size, rebuilt, "Layer ready");
        Ok(layer)
    }

    /// Remove `.zip` archives older than the max age; returns what was removed
    pub async fn clean_cache(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SkyError::io(format!("listing {}", self.dir.display()), e)),
        };

        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SkyError::io(format!("listing {}", self.dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zip") {
                continue;
            }
            if modified(&path).await? >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cached layer"),
            }
        }
        info!(dir = %self.dir.display(), removed = removed.len(), "Cleaned layer cache");
        Ok(removed)
    }
}
