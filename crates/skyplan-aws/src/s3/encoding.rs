//! Object key encoding: each `/`-separated segment is URI-encoded on its own

use skyplan_core::{Result, SkyError};

pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn decode_key(encoded: &str) -> Result<String> {
    urlencoding::decode(encoded)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| SkyError::invalid_input(format!("invalid encoded key '{}': {}", encoded, e)))
}

/// `/{bucket}/{encoded key}`
pub fn object_path(bucket: &str, key: &str) -> String {
    format!("/{}/{}", bucket, encode_key(key))
}

/// `x-amz-copy-source` value
pub fn copy_source(bucket: &str, key: &str) -> String {
    object_path(bucket, key)
}
