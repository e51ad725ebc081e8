use super::{AmiStrategy, LogFormat, RuntimeConfig};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::str::FromStr;

pub const ENV_PREFIX: &str = "SKYPLAN_";

/// Abstraction over environment-variable lookups so tests and embedders can
/// supply their own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the SKYPLAN_ prefix
    /// Used for AWS standard variables (AWS_REGION, AWS_PROFILE, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{}{}", ENV_PREFIX, key)).ok()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed map of full variable names, for tests and embedding
impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, &format!("{}{}", ENV_PREFIX, key)).cloned()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource + ?Sized>(
    config: &mut RuntimeConfig,
    env: &E,
) -> Result<()> {
    // Region: the standard AWS variables apply first so SKYPLAN_REGION wins
    if let Some(region) = non_empty(env.get_raw("AWS_DEFAULT_REGION")) {
        config.aws.region = region;
    }
    if let Some(region) = non_empty(env.get_raw("AWS_REGION")) {
        config.aws.region = region;
    }
    if let Some(region) = non_empty(env.get("REGION")) {
        config.aws.region = region;
    }

    if let Some(endpoint) = non_empty(env.get_raw("AWS_ENDPOINT_URL")) {
        config.aws.endpoint = Some(endpoint);
    }
    if let Some(endpoint) = non_empty(env.get("ENDPOINT")) {
        config.aws.endpoint = Some(endpoint);
    }

    if let Some(profile) = non_empty(env.get_raw("AWS_PROFILE")) {
        config.aws.profile = profile;
    }
    if let Some(profile) = non_empty(env.get("PROFILE")) {
        config.aws.profile = profile;
    }
    if let Some(app_dir) = non_empty(env.get("APP_DIR")) {
        config.aws.app_dir = app_dir;
    }
    if let Some(val) = get_env_parsed::<u64, E>(env, "TIMEOUT_SECS")? {
        config.aws.timeout_secs = val;
    }

    // AMI resolution
    if let Some(strategy) = non_empty(env.get("AMI_STRATEGY")) {
        config.ami.strategy = strategy
            .parse::<AmiStrategy>()
            .context("Invalid SKYPLAN_AMI_STRATEGY value")?;
    }
    if let Some(val) = get_env_parsed::<u64, E>(env, "AMI_TTL_HOURS")? {
        config.ami.ttl_hours = val;
    }
    if let Some(val) = get_env_bool(env, "AMI_CACHE_ENABLED")? {
        config.ami.cache_enabled = val;
    }
    if let Some(val) = get_env_bool(env, "AMI_FALLBACK_TO_STATIC")? {
        config.ami.fallback_to_static = val;
    }

    // State backend
    if let Some(prefix) = non_empty(env.get("STATE_PREFIX")) {
        config.state.app_prefix = prefix;
    }
    if let Some(key) = non_empty(env.get("STATE_KEY")) {
        config.state.key = key;
    }

    // Layer cache
    if let Some(dir) = non_empty(env.get("LAYER_CACHE_DIR")) {
        config.layers.cache_dir = dir;
    }
    if let Some(val) = get_env_parsed::<u64, E>(env, "LAYER_MAX_AGE_DAYS")? {
        config.layers.max_age_days = val;
    }
    if let Some(image) = non_empty(env.get("LAYER_BUILDER_IMAGE")) {
        config.layers.builder_image = Some(image);
    }

    // Bucket copy
    if let Some(val) = get_env_parsed::<usize, E>(env, "COPY_CONCURRENCY")? {
        config.copy.concurrency = val;
    }
    if let Some(val) = get_env_parsed::<usize, E>(env, "COPY_PART_CONCURRENCY")? {
        config.copy.part_concurrency = val;
    }
    if let Some(val) = get_env_parsed::<u64, E>(env, "COPY_PART_SIZE_MIB")? {
        config.copy.part_size_mib = val;
    }

    // Logging
    if let Some(level) = non_empty(env.get("LOG_LEVEL")) {
        config.log.level = level;
    }
    if let Some(format) = non_empty(env.get("LOG_FORMAT")) {
        config.log.format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn get_env_parsed<T, E>(env: &E, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    E: EnvSource + ?Sized,
{
    match non_empty(env.get(key)) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool<E: EnvSource + ?Sized>(env: &E, key: &str) -> Result<Option<bool>> {
    match non_empty(env.get(key)) {
        Some(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(anyhow!(
                "Failed to parse {}{} (expected bool): {}",
                ENV_PREFIX,
                key,
                other
            )),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_prefixed_region_beats_aws_region() {
        let mut config = RuntimeConfig::default();
        let vars = env(&[
            ("AWS_REGION", "eu-west-1"),
            ("AWS_DEFAULT_REGION", "ap-south-1"),
        ]);
        apply_env_overrides(&mut config, &vars).unwrap();
        assert_eq!(config.aws.region, "eu-west-1");

        let vars = env(&[("AWS_REGION", "eu-west-1"), ("SKYPLAN_REGION", "us-west-2")]);
        apply_env_overrides(&mut config, &vars).unwrap();
        assert_eq!(config.aws.region, "us-west-2");
    }

    #[test]
    fn test_typed_overrides() {
        let mut config = RuntimeConfig::default();
        let vars = env(&[
            ("SKYPLAN_AMI_STRATEGY", "ssm"),
            ("SKYPLAN_AMI_CACHE_ENABLED", "false"),
            ("SKYPLAN_COPY_CONCURRENCY", "4"),
            ("SKYPLAN_COPY_PART_CONCURRENCY", "2"),
            ("SKYPLAN_LOG_FORMAT", "JSON"),
            ("AWS_ENDPOINT_URL", "http://localhost:4566"),
        ]);
        apply_env_overrides(&mut config, &vars).unwrap();
        assert_eq!(config.ami.strategy, AmiStrategy::Ssm);
        assert!(!config.ami.cache_enabled);
        assert_eq!(config.copy.concurrency, 4);
        assert_eq!(config.copy.part_concurrency, 2);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(
            config.aws.endpoint.as_deref(),
            Some("http://localhost:4566")
        );
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let mut config = RuntimeConfig::default();
        let vars = env(&[("SKYPLAN_TIMEOUT_SECS", "soon")]);
        let err = apply_env_overrides(&mut config, &vars).unwrap_err();
        assert!(err.to_string().contains("SKYPLAN_TIMEOUT_SECS"));
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let mut config = RuntimeConfig::default();
        let vars = env(&[("AWS_REGION", ""), ("SKYPLAN_PROFILE", "  ")]);
        apply_env_overrides(&mut config, &vars).unwrap();
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.aws.profile, "default");
    }
}
