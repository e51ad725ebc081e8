// Configuration source loading.
//
// Priority order:
// 1. Environment variables (SKYPLAN_* prefix, plus AWS_REGION / AWS_PROFILE / AWS_ENDPOINT_URL)
// 2. Config file path from SKYPLAN_CONFIG
// 3. Inline config content from SKYPLAN_CONFIG_CONTENT
// 4. Default config files (./skyplan.toml, ./.skyplan.toml)
// 5. Built-in defaults

use crate::env_overrides::{self, EnvSource, StdEnvSource};
use crate::RuntimeConfig;
use anyhow::{Context, Result};
use std::path::Path;

const DEFAULT_FILES: &[&str] = &["./skyplan.toml", "./.skyplan.toml"];

/// Load configuration using the process environment and working directory.
pub fn load_config() -> Result<RuntimeConfig> {
    load_with_env(&StdEnvSource)
}

/// Load configuration with an explicit environment source.
pub(crate) fn load_with_env<E: EnvSource + ?Sized>(env: &E) -> Result<RuntimeConfig> {
    let mut config = load_from_file(env)?.unwrap_or_default();
    env_overrides::apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

fn load_from_file<E: EnvSource + ?Sized>(env: &E) -> Result<Option<RuntimeConfig>> {
    if let Some(path) = env.get("CONFIG") {
        return read_file(Path::new(&path)).map(Some);
    }

    if let Some(content) = env.get("CONFIG_CONTENT") {
        let config: RuntimeConfig = toml::from_str(&content)
            .context("Failed to parse inline config from SKYPLAN_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    for path in DEFAULT_FILES {
        let path = Path::new(path);
        if path.exists() {
            return read_file(path).map(Some);
        }
    }

    Ok(None)
}

fn read_file(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from a specific file path (for CLI --config flag).
/// Returns error if file doesn't exist or can't be parsed.
pub fn load_from_file_path(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let mut config = read_file(path.as_ref())?;
    env_overrides::apply_env_overrides(&mut config, &StdEnvSource)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with graceful fallback to defaults.
/// A broken config file is skipped with a warning instead of failing the command.
pub fn load_or_default() -> Result<RuntimeConfig> {
    let env = StdEnvSource;
    let mut config = match load_from_file(&env) {
        Ok(found) => found.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unreadable config file");
            RuntimeConfig::default()
        }
    };

    env_overrides::apply_env_overrides(&mut config, &env)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_config_path_then_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[aws]\nregion = \"eu-central-1\"\nprofile = \"work\"\n\n[copy]\nconcurrency = 3"
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert(
            "SKYPLAN_CONFIG".to_string(),
            file.path().display().to_string(),
        );
        env.insert("SKYPLAN_PROFILE".to_string(), "ci".to_string());

        let config = load_with_env(&env).unwrap();
        assert_eq!(config.aws.region, "eu-central-1");
        assert_eq!(config.aws.profile, "ci");
        assert_eq!(config.copy.concurrency, 3);
    }

    #[test]
    fn test_inline_content() {
        let mut env = HashMap::new();
        env.insert(
            "SKYPLAN_CONFIG_CONTENT".to_string(),
            "[state]\napp_prefix = \"acme\"".to_string(),
        );
        let config = load_with_env(&env).unwrap();
        assert_eq!(config.state.app_prefix, "acme");
        assert_eq!(config.state.key, "skyplan.tfstate.json");
    }

    #[test]
    fn test_missing_config_path_is_an_error() {
        let mut env = HashMap::new();
        env.insert(
            "SKYPLAN_CONFIG".to_string(),
            "/definitely/not/here.toml".to_string(),
        );
        let err = load_with_env(&env).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let mut env = HashMap::new();
        env.insert(
            "SKYPLAN_CONFIG_CONTENT".to_string(),
            "[copy]\nconcurrency = 0".to_string(),
        );
        assert!(load_with_env(&env).is_err());
    }
}
