//! Credential discovery, caching and refresh
//!
//! Resolution order:
//! 1. `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` (+ `AWS_SESSION_TOKEN`)
//! 2. JSON cache at `$HOME/.{app_dir}/aws.json`
//! 3. Shared credentials file at `$HOME/.aws/credentials`, section `$AWS_PROFILE`
//!
//! The resolved record is cached behind a read/write lock. A cached record past
//! its `expires_at` is re-resolved; when it came from the shared profile the JSON
//! cache is rewritten with the fresh values.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use skyplan_config::{AwsConfig, EnvSource, StdEnvSource};
use skyplan_core::{Result, SkyError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Clock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    Env,
    #[default]
    File,
    SharedProfile,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::Env => write!(f, "environment"),
            CredentialSource::File => write!(f, "config file"),
            CredentialSource::SharedProfile => write!(f, "shared profile"),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: CredentialSource,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            region: String::new(),
            expires_at: None,
            source: CredentialSource::File,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    fn check_complete(&self, origin: &str) -> Result<()> {
        if self.access_key_id.trim().is_empty() {
            return Err(SkyError::CredentialsMissing {
                reason: format!("access key id missing in {}", origin),
            });
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(SkyError::CredentialsMissing {
                reason: format!("secret access key missing in {}", origin),
            });
        }
        Ok(())
    }
}

/// Source of signing credentials
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

/// Fixed credentials, for tests and explicit configuration
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials> {
        self.0.check_complete("static credentials")?;
        Ok(self.0.clone())
    }
}

static GLOBAL: OnceCell<Arc<CredentialStore>> = OnceCell::new();

pub struct CredentialStore {
    home: Option<PathBuf>,
    app_dir: String,
    profile: String,
    default_region: String,
    env: Box<dyn EnvSource + Send + Sync>,
    clock: Clock,
    cache: RwLock<Option<Credentials>>,
}

impl CredentialStore {
    pub fn new(
        home: Option<PathBuf>,
        app_dir: impl Into<String>,
        profile: impl Into<String>,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            home,
            app_dir: app_dir.into(),
            profile: profile.into(),
            default_region: default_region.into(),
            env: Box::new(StdEnvSource),
            clock: crate::system_clock(),
            cache: RwLock::new(None),
        }
    }

    pub fn from_config(config: &AwsConfig) -> Self {
        Self::new(
            home_dir(&StdEnvSource),
            &config.app_dir,
            &config.profile,
            &config.region,
        )
    }

    /// Process-wide store, initialised from the first caller's configuration
    pub fn global(config: &AwsConfig) -> Arc<CredentialStore> {
        GLOBAL
            .get_or_init(|| Arc::new(Self::from_config(config)))
            .clone()
    }

    pub fn with_env(mut self, env: impl EnvSource + Send + Sync + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// `$HOME/.{app_dir}/aws.json`
    pub fn cache_file(&self) -> Option<PathBuf> {
        self.home
            .as_ref()
            .map(|home| home.join(format!(".{}", self.app_dir)).join("aws.json"))
    }

    /// `$AWS_SHARED_CREDENTIALS_FILE` or `$HOME/.aws/credentials`
    pub fn shared_credentials_file(&self) -> Option<PathBuf> {
        if let Some(path) = self.env.get_raw("AWS_SHARED_CREDENTIALS_FILE") {
            return Some(PathBuf::from(path));
        }
        self.home
            .as_ref()
            .map(|home| home.join(".aws").join("credentials"))
    }

    /// Drop the cached record; the next call re-resolves from the sources
    pub fn clear(&self) {
        *self.cache.write() = None;
    }

    /// Write `credentials` to the JSON cache and make them current
    pub fn save(&self, credentials: &Credentials) -> Result<PathBuf> {
        credentials.check_complete("credentials to save")?;
        let path = self.cache_file().ok_or_else(|| SkyError::CredentialsMissing {
            reason: "HOME is not set; cannot locate the credentials file".to_string(),
        })?;
        write_json_cache(&path, credentials)?;
        *self.cache.write() = Some(credentials.clone());
        Ok(path)
    }

    fn profile(&self) -> String {
        self.env
            .get_raw("AWS_PROFILE")
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.profile.clone())
    }

    fn region(&self) -> String {
        self.env
            .get_raw("AWS_REGION")
            .or_else(|| self.env.get_raw("AWS_DEFAULT_REGION"))
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.default_region.clone())
    }

    fn resolve(&self) -> Result<Credentials> {
        let now = (self.clock)();

        if let Some(creds) = self.from_env()? {
            debug!(source = %creds.source, "Resolved credentials");
            return Ok(creds);
        }

        if let Some(path) = self.cache_file().filter(|p| p.exists()) {
            let creds = read_json_cache(&path)?;
            if !creds.is_stale(now) {
                debug!(source = %creds.source, path = %path.display(), "Resolved credentials");
                return Ok(creds);
            }
            if creds.source == CredentialSource::SharedProfile {
                return self.refresh_from_profile(&path, now);
            }
            warn!(path = %path.display(), "Cached credentials expired; trying the shared profile");
        }

        if let Some(creds) = self.from_shared_profile()? {
            if creds.is_stale(now) {
                return Err(SkyError::CredentialsInvalid {
                    reason: format!("profile '{}' credentials have expired", self.profile()),
                });
            }
            debug!(source = %creds.source, "Resolved credentials");
            return Ok(creds);
        }

        Err(SkyError::CredentialsMissing {
            reason: "set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, run `skyplan configure`, \
                     or add a profile to ~/.aws/credentials"
                .to_string(),
        })
    }

    fn refresh_from_profile(&self, cache_path: &Path, now: DateTime<Utc>) -> Result<Credentials> {
        let fresh = self
            .from_shared_profile()?
            .ok_or_else(|| SkyError::CredentialsInvalid {
                reason: format!(
                    "cached credentials expired and profile '{}' is gone",
                    self.profile()
                ),
            })?;
        if fresh.is_stale(now) {
            return Err(SkyError::CredentialsInvalid {
                reason: format!("profile '{}' credentials have expired", self.profile()),
            });
        }
        write_json_cache(cache_path, &fresh)?;
        debug!(path = %cache_path.display(), "Refreshed cached credentials from shared profile");
        Ok(fresh)
    }

    fn from_env(&self) -> Result<Option<Credentials>> {
        let access = self.env.get_raw("AWS_ACCESS_KEY_ID").filter(|v| !v.is_empty());
        let secret = self
            .env
            .get_raw("AWS_SECRET_ACCESS_KEY")
            .filter(|v| !v.is_empty());

        match (access, secret) {
            (None, None) => Ok(None),
            (Some(access), Some(secret)) => Ok(Some(Credentials {
                access_key_id: access,
                secret_access_key: secret,
                session_token: self.env.get_raw("AWS_SESSION_TOKEN").filter(|v| !v.is_empty()),
                region: self.region(),
                expires_at: None,
                source: CredentialSource::Env,
            })),
            (Some(_), None) => Err(SkyError::CredentialsMissing {
                reason: "AWS_ACCESS_KEY_ID is set but AWS_SECRET_ACCESS_KEY is not".to_string(),
            }),
            (None, Some(_)) => Err(SkyError::CredentialsMissing {
                reason: "AWS_SECRET_ACCESS_KEY is set but AWS_ACCESS_KEY_ID is not".to_string(),
            }),
        }
    }

    fn from_shared_profile(&self) -> Result<Option<Credentials>> {
        let Some(path) = self.shared_credentials_file().filter(|p| p.exists()) else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SkyError::io(format!("reading {}", path.display()), e))?;
        let profile = self.profile();
        let Some(section) = parse_profile(&content, &profile) else {
            return Ok(None);
        };

        let mut creds = Credentials {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: None,
            region: self.region(),
            expires_at: None,
            source: CredentialSource::SharedProfile,
        };
        for (key, value) in section {
            if key.ends_with("access_key_id") {
                creds.access_key_id = value;
            } else if key.ends_with("secret_access_key") {
                creds.secret_access_key = value;
            } else if key.ends_with("session_token") || key.ends_with("_security_token") {
                creds.session_token = Some(value);
            } else if key.ends_with("x_security_token_expires") {
                let expires = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                    SkyError::CredentialsInvalid {
                        reason: format!("bad x_security_token_expires '{}': {}", value, e),
                    }
                })?;
                creds.expires_at = Some(expires.with_timezone(&Utc));
            }
        }
        creds.check_complete(&format!("profile '{}' of {}", profile, path.display()))?;
        Ok(Some(creds))
    }
}

impl CredentialProvider for CredentialStore {
    fn credentials(&self) -> Result<Credentials> {
        let now = (self.clock)();
        if let Some(creds) = self.cache.read().as_ref() {
            if !creds.is_stale(now) {
                return Ok(creds.clone());
            }
        }

        let mut cache = self.cache.write();
        // Another caller may have refreshed while we waited for the write lock
        if let Some(creds) = cache.as_ref() {
            if !creds.is_stale(now) {
                return Ok(creds.clone());
            }
        }
        let creds = self.resolve()?;
        *cache = Some(creds.clone());
        Ok(creds)
    }
}

pub(crate) fn home_dir<E: EnvSource + ?Sized>(env: &E) -> Option<PathBuf> {
    env.get_raw("HOME")
        .or_else(|| env.get_raw("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Key/value pairs of `[profile]` (or `[profile name]`), keys lowercased
fn parse_profile(content: &str, profile: &str) -> Option<Vec<(String, String)>> {
    let mut in_section = false;
    let mut found = false;
    let mut pairs = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let header = header.trim();
            let name = header.strip_prefix("profile ").unwrap_or(header).trim();
            in_section = name == profile;
            found |= in_section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pairs.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    found.then_some(pairs)
}

fn read_json_cache(path: &Path) -> Result<Credentials> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SkyError::io(format!("reading {}", path.display()), e))?;
    let creds: Credentials = serde_json::from_str(&content).map_err(|e| {
        SkyError::CredentialsInvalid {
            reason: format!("{} is not a valid credentials file: {}", path.display(), e),
        }
    })?;
    creds.check_complete(&path.display().to_string())?;
    Ok(creds)
}

fn write_json_cache(path: &Path, creds: &Credentials) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| SkyError::io(format!("creating {}", dir.display()), e))?;
        set_mode(dir, 0o755)?;
    }
    let json = serde_json::to_string_pretty(creds)?;
    std::fs::write(path, json)
        .map_err(|e| SkyError::io(format!("writing {}", path.display()), e))?;
    set_mode(path, 0o644)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| SkyError::io(format!("setting permissions on {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn store(home: &Path, vars: &[(&str, &str)]) -> CredentialStore {
        CredentialStore::new(Some(home.to_path_buf()), "skyplan", "default", "us-east-1")
            .with_env(env(vars))
    }

    fn fixed_clock(time: DateTime<Utc>) -> Clock {
        Arc::new(move || time)
    }

    #[test]
    fn test_env_wins() {
        let home = tempfile::tempdir().unwrap();
        let store = store(
            home.path(),
            &[
                ("AWS_ACCESS_KEY_ID", "AKIAENV"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("AWS_SESSION_TOKEN", "token"),
                ("AWS_REGION", "eu-west-1"),
            ],
        );
        let creds = store.credentials().unwrap();
        assert_eq!(creds.access_key_id, "AKIAENV");
        assert_eq!(creds.session_token.as_deref(), Some("token"));
        assert_eq!(creds.region, "eu-west-1");
        assert_eq!(creds.source, CredentialSource::Env);
    }

    #[test]
    fn test_half_configured_env_is_fatal() {
        let home = tempfile::tempdir().unwrap();
        let store = store(home.path(), &[("AWS_ACCESS_KEY_ID", "AKIAENV")]);
        assert!(matches!(
            store.credentials(),
            Err(SkyError::CredentialsMissing { .. })
        ));
    }

    #[test]
    fn test_nothing_configured() {
        let home = tempfile::tempdir().unwrap();
        let err = store(home.path(), &[]).credentials().unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_shared_profile_with_aliases() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".aws")).unwrap();
        std::fs::write(
            home.path().join(".aws/credentials"),
            "[default]\naws_access_key_id = AKIADEF\naws_secret_access_key = s1\n\n\
             [profile work]\naws_access_key_id=AKIAWORK\naws_secret_access_key=s2\n\
             aws_security_token=tok\nx_security_token_expires=2030-01-01T00:00:00Z\n",
        )
        .unwrap();

        let creds = store(home.path(), &[("AWS_PROFILE", "work")])
            .credentials()
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIAWORK");
        assert_eq!(creds.session_token.as_deref(), Some("tok"));
        assert_eq!(
            creds.expires_at,
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(creds.source, CredentialSource::SharedProfile);

        let creds = store(home.path(), &[]).credentials().unwrap();
        assert_eq!(creds.access_key_id, "AKIADEF");
    }

    #[test]
    fn test_profile_missing_secret() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".aws")).unwrap();
        std::fs::write(
            home.path().join(".aws/credentials"),
            "[default]\naws_access_key_id = AKIADEF\n",
        )
        .unwrap();
        let err = store(home.path(), &[]).credentials().unwrap_err();
        assert!(err.to_string().contains("secret access key missing"));
    }

    #[test]
    fn test_stale_shared_profile_record_is_refreshed_and_rewritten() {
        let home = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let store = store(home.path(), &[]).with_clock(fixed_clock(now));
        let mut stale = Credentials::new("AKIAOLD", "old");
        stale.source = CredentialSource::SharedProfile;
        stale.expires_at = Some(now - chrono::Duration::hours(1));
        store.save(&stale).unwrap();
        store.clear();

        std::fs::create_dir_all(home.path().join(".aws")).unwrap();
        std::fs::write(
            home.path().join(".aws/credentials"),
            "[default]\naws_access_key_id=AKIANEW\naws_secret_access_key=new\n\
             x_security_token_expires=2025-06-01T12:00:00Z\n",
        )
        .unwrap();

        let creds = store.credentials().unwrap();
        assert_eq!(creds.access_key_id, "AKIANEW");

        let cached: Credentials = serde_json::from_str(
            &std::fs::read_to_string(store.cache_file().unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(cached.access_key_id, "AKIANEW");
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_modes() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().unwrap();
        let store = store(home.path(), &[]);
        let path = store.save(&Credentials::new("AKIA", "s")).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o644);
        assert_eq!(dir_mode, 0o755);
        assert_eq!(store.credentials().unwrap().access_key_id, "AKIA");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials::new("AKIA", "very-secret").with_session_token("tok");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("tok\""));
    }
}
