//! Name and identifier validation

use crate::error::{Result, SkyError};

/// Validate an S3 bucket name.
///
/// Accepts exactly `^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$`.
pub fn validate_bucket_name(input: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(SkyError::InvalidBucketName {
            name: input.to_string(),
            reason: reason.to_string(),
        })
    };

    if input.is_empty() {
        return reject("bucket name cannot be empty");
    }
    if input.len() < 3 || input.len() > 63 {
        return reject("bucket name must be 3-63 characters");
    }
    if !input
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return reject("bucket name must contain only lowercase letters, numbers, '.' and '-'");
    }
    let is_edge = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let first = input.chars().next().unwrap_or('-');
    let last = input.chars().last().unwrap_or('-');
    if !is_edge(first) || !is_edge(last) {
        return reject("bucket name must start and end with a letter or number");
    }
    Ok(())
}

/// Validate a generic resource name (functions, roles, networks).
pub fn validate_resource_name(input: &str) -> Result<()> {
    if input.is_empty() || input.len() > 64 {
        return Err(SkyError::invalid_input(format!(
            "name '{}' must be 1-64 characters",
            input
        )));
    }
    if !input
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SkyError::invalid_input(format!(
            "name '{}' may only contain letters, numbers, '-' and '_'",
            input
        )));
    }
    Ok(())
}

/// True when `input` has the shape of a concrete image id: `ami-` + 17 lowercase hex digits.
pub fn is_image_id(input: &str) -> bool {
    match input.strip_prefix("ami-") {
        Some(rest) => {
            rest.len() == 17
                && rest
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bucket_names() {
        for name in ["my-data", "abc", "logs.example.com", "a1b2c3", "0-0"] {
            assert!(validate_bucket_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_rejects_edge_dashes_and_dots() {
        for name in ["-data", "data-", ".data", "data.", "-ab-"] {
            assert!(
                matches!(
                    validate_bucket_name(name),
                    Err(SkyError::InvalidBucketName { .. })
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_bad_length_and_chars() {
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
        assert!(validate_bucket_name(&"a".repeat(63)).is_ok());
        assert!(validate_bucket_name("My-Data").is_err());
        assert!(validate_bucket_name("my_data").is_err());
        assert!(validate_bucket_name("").is_err());
    }

    #[test]
    fn test_resource_names() {
        assert!(validate_resource_name("api_handler-2").is_ok());
        assert!(validate_resource_name("has space").is_err());
        assert!(validate_resource_name("").is_err());
    }

    #[test]
    fn test_image_id_shape() {
        assert!(is_image_id("ami-0123456789abcdef0"));
        assert!(!is_image_id("ami-0123456789ABCDEF0"));
        assert!(!is_image_id("ami-12345678"));
        assert!(!is_image_id("ubuntu-lts"));
    }
}
