//! Intent parsing: `bucket my-data versioning=false --region eu-west-1`

use crate::error::{Result, SkyError};
use crate::names;
use crate::validation::{validate_bucket_name, validate_resource_name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Kind of deployment the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentKind {
    Bucket,
    Network,
    Function,
    StaticSite,
    Database,
    Api,
    Webapp,
}

impl IntentKind {
    pub const ALL: [IntentKind; 7] = [
        IntentKind::Bucket,
        IntentKind::Network,
        IntentKind::Function,
        IntentKind::StaticSite,
        IntentKind::Database,
        IntentKind::Api,
        IntentKind::Webapp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Bucket => "bucket",
            IntentKind::Network => "network",
            IntentKind::Function => "function",
            IntentKind::StaticSite => "static-site",
            IntentKind::Database => "database",
            IntentKind::Api => "api",
            IntentKind::Webapp => "webapp",
        }
    }

    /// Human label used in plan titles
    pub fn display_name(&self) -> &'static str {
        match self {
            IntentKind::Bucket => "S3 Bucket",
            IntentKind::Network => "VPC Network",
            IntentKind::Function => "Lambda Function",
            IntentKind::StaticSite => "Static Website",
            IntentKind::Database => "RDS Database",
            IntentKind::Api => "HTTP API",
            IntentKind::Webapp => "Web Application",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentKind {
    type Err = SkyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bucket" | "storage" | "s3" => Ok(IntentKind::Bucket),
            "network" | "vpc" | "net" => Ok(IntentKind::Network),
            "function" | "fn" | "lambda" => Ok(IntentKind::Function),
            "static-site" | "static" | "site" | "website" => Ok(IntentKind::StaticSite),
            "database" | "db" | "rds" => Ok(IntentKind::Database),
            "api" | "apigateway" | "rest" => Ok(IntentKind::Api),
            "webapp" | "app" | "web" | "server" => Ok(IntentKind::Webapp),
            _ => Err(SkyError::invalid_input(format!(
                "unknown intent '{}'. Supported: bucket, network, function, static-site, database, api, webapp",
                s
            ))),
        }
    }
}

/// A normalized deployment goal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub name: String,
    /// Options keyed by lowercase, underscore-separated names
    pub params: BTreeMap<String, String>,
}

impl Intent {
    pub fn new(kind: IntentKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(normalize_key(key), value.into());
        self
    }

    /// Parse CLI tokens into an intent.
    ///
    /// The first token names the kind, an optional bare second token names the resource,
    /// and the rest are `key=value`, `--key value`, `--key=value` or bare `--flag` options.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let mut iter = tokens.iter().map(|t| t.as_ref()).peekable();
        let kind: IntentKind = iter
            .next()
            .ok_or_else(|| SkyError::invalid_input("missing intent (e.g. 'bucket my-data')"))?
            .parse()?;

        let mut name = None;
        if let Some(candidate) = iter.peek() {
            if !candidate.starts_with("--") && !candidate.contains('=') {
                name = Some(candidate.to_string());
                iter.next();
            }
        }

        let mut params = BTreeMap::new();
        while let Some(token) = iter.next() {
            if let Some(flag) = token.strip_prefix("--") {
                if let Some((key, value)) = flag.split_once('=') {
                    params.insert(normalize_key(key), value.to_string());
                } else {
                    let value = match iter.peek() {
                        Some(next) if !next.starts_with("--") && !next.contains('=') => {
                            let value = next.to_string();
                            iter.next();
                            value
                        }
                        _ => "true".to_string(),
                    };
                    params.insert(normalize_key(flag), value);
                }
            } else if let Some((key, value)) = token.split_once('=') {
                params.insert(normalize_key(key), value.to_string());
            } else {
                return Err(SkyError::invalid_input(format!(
                    "unexpected argument '{}'; options use key=value",
                    token
                )));
            }
        }

        let name = name.unwrap_or_else(names::generate);
        match kind {
            IntentKind::Bucket | IntentKind::StaticSite => validate_bucket_name(&name)?,
            _ => validate_resource_name(&name)?,
        }

        Ok(Self { kind, name, params })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(&normalize_key(key)).map(String::as_str)
    }

    /// Boolean option; accepts true/false, yes/no, on/off, 1/0
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.param(key) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(SkyError::invalid_input(format!(
                    "option '{}' expects a boolean, got '{}'",
                    key, value
                ))),
            },
        }
    }

    /// Numeric option with a default
    pub fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.param(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| {
                SkyError::invalid_input(format!("option '{}' expects a number, got '{}'", key, value))
            }),
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket() {
        let intent = Intent::parse(&["bucket", "my-data"]).unwrap();
        assert_eq!(intent.kind, IntentKind::Bucket);
        assert_eq!(intent.name, "my-data");
        assert!(intent.params.is_empty());
    }

    #[test]
    fn test_aliases() {
        assert_eq!("s3".parse::<IntentKind>().unwrap(), IntentKind::Bucket);
        assert_eq!("storage".parse::<IntentKind>().unwrap(), IntentKind::Bucket);
        assert_eq!("fn".parse::<IntentKind>().unwrap(), IntentKind::Function);
        assert_eq!("lambda".parse::<IntentKind>().unwrap(), IntentKind::Function);
        assert!(matches!(
            "teleporter".parse::<IntentKind>(),
            Err(SkyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parse_options() {
        let intent = Intent::parse(&[
            "function",
            "api",
            "--runtime",
            "python3.11",
            "memory=256",
            "--public-url",
            "--timeout=60",
        ])
        .unwrap();
        assert_eq!(intent.param("runtime"), Some("python3.11"));
        assert_eq!(intent.number::<u32>("memory", 128).unwrap(), 256);
        assert!(intent.flag("public_url", false).unwrap());
        assert_eq!(intent.param("public-url"), Some("true"));
        assert_eq!(intent.number::<u32>("timeout", 3).unwrap(), 60);
    }

    #[test]
    fn test_missing_name_is_generated() {
        let intent = Intent::parse(&["bucket", "versioning=false"]).unwrap();
        assert_eq!(intent.name.split('-').count(), 3);
        assert!(!intent.flag("versioning", true).unwrap());
    }

    #[test]
    fn test_rejects_bad_bucket_name() {
        let err = Intent::parse(&["bucket", "-bad-"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_bad_flag_value() {
        let intent = Intent::parse(&["bucket", "my-data", "versioning=maybe"]).unwrap();
        assert!(intent.flag("versioning", true).is_err());
    }
}
