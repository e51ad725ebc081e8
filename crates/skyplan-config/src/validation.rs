// Configuration validation
//
// Rejects values that would make commands misbehave; warns on suspicious ones

use crate::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_aws_config(&config.aws)?;
    validate_state_config(&config.state)?;
    validate_copy_config(&config.copy)?;
    validate_log_config(&config.log)?;

    if config.ami.ttl_hours == 0 {
        bail!("ami.ttl_hours must be greater than 0");
    }
    if config.layers.max_age_days == 0 {
        warn!("layers.max_age_days is 0; every cached layer counts as stale");
    }

    Ok(())
}

fn validate_aws_config(config: &AwsConfig) -> Result<()> {
    if config.region.trim().is_empty() {
        bail!("aws.region must not be empty");
    }
    if !config
        .region
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!("aws.region '{}' is not a valid region name", config.region);
    }
    if config.timeout_secs == 0 {
        bail!("aws.timeout_secs must be greater than 0");
    }
    if let Some(endpoint) = &config.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            bail!("aws.endpoint must start with http:// or https://");
        }
    }
    if config.app_dir.trim().is_empty() || config.app_dir.contains('/') {
        bail!("aws.app_dir must be a single directory name");
    }
    Ok(())
}

fn validate_state_config(config: &StateConfig) -> Result<()> {
    if config.app_prefix.is_empty() {
        bail!("state.app_prefix must not be empty");
    }
    if config.key.is_empty() {
        bail!("state.key must not be empty");
    }
    // Bucket names cap at 63 characters; the longest region name is 14
    if config.app_prefix.len() > 40 {
        warn!(
            app_prefix = %config.app_prefix,
            "state.app_prefix is long; the state bucket name may exceed 63 characters"
        );
    }
    Ok(())
}

fn validate_copy_config(config: &CopyConfig) -> Result<()> {
    if config.concurrency == 0 {
        bail!("copy.concurrency must be greater than 0");
    }
    if config.part_concurrency == 0 {
        bail!("copy.part_concurrency must be greater than 0");
    }
    // S3 UploadPartCopy limits: 5 MiB minimum part, 5 GiB maximum
    if config.part_size_mib < 5 || config.part_size_mib > 5 * 1024 {
        bail!("copy.part_size_mib must be between 5 and 5120");
    }
    if config.multipart_threshold_gib == 0 || config.multipart_threshold_gib > 5 {
        bail!("copy.multipart_threshold_gib must be between 1 and 5");
    }
    if config.progress_interval_ms == 0 {
        bail!("copy.progress_interval_ms must be greater than 0");
    }
    if config.concurrency > 100 {
        warn!(
            concurrency = config.concurrency,
            "copy.concurrency is very large; expect throttling"
        );
    }
    Ok(())
}

fn validate_log_config(config: &LogConfig) -> Result<()> {
    match config.level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        // EnvFilter directives such as "skyplan=debug"
        level if level.contains('=') => Ok(()),
        level => bail!("log.level '{}' is not a recognised level", level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_endpoint() {
        let mut config = RuntimeConfig::default();
        config.aws.endpoint = Some("localhost:4566".into());
        assert!(validate_config(&config).is_err());
        config.aws.endpoint = Some("http://localhost:4566".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_part_size_limits() {
        let mut config = RuntimeConfig::default();
        config.copy.part_size_mib = 4;
        assert!(validate_config(&config).is_err());
        config.copy.part_size_mib = 5;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_part_concurrency_rejected() {
        let mut config = RuntimeConfig::default();
        config.copy.part_concurrency = 0;
        assert!(validate_config(&config).is_err());
        config.copy.part_concurrency = 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = RuntimeConfig::default();
        config.ami.ttl_hours = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_log_level() {
        let mut config = RuntimeConfig::default();
        config.log.level = "verbose".into();
        assert!(validate_config(&config).is_err());
        config.log.level = "skyplan=debug".into();
        assert!(validate_config(&config).is_ok());
    }
}
