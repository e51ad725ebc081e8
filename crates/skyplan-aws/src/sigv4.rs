//! AWS Signature Version 4
//!
//! Pure functions over already-assembled request parts. The signing client
//! decides which headers exist; this module only canonicalizes and signs.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use sha2::{Digest, Sha256};
use skyplan_core::{Result, SkyError};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// hex(sha256("")), the payload hash of every bodiless request
pub const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// base64(md5(body)) for the Content-MD5 header
pub fn content_md5(body: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(body))
}

/// `YYYYMMDDTHHMMSSZ`
pub fn amz_date(time: DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%SZ").to_string()
}

/// RFC 3986 encoding: everything except `A-Z a-z 0-9 - _ . ~`
pub fn uri_encode(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

/// Encoded `k=v` pairs sorted by key, then value
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// host, every x-amz-* header, content-type and content-md5
pub fn is_signed_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "host" || name == "content-type" || name == "content-md5" || name.starts_with("x-amz-")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub text: String,
    /// `;`-joined lowercase header names
    pub signed_headers: String,
}

pub fn canonical_request(
    method: &str,
    uri: &str,
    query: &str,
    headers: &[(String, String)],
    payload_hash: &str,
) -> CanonicalRequest {
    let mut signed: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| is_signed_header(name))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    signed.sort();
    signed.dedup_by(|a, b| a.0 == b.0);

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let uri = if uri.is_empty() { "/" } else { uri };
    let text = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, uri, query, canonical_headers, signed_headers, payload_hash
    );

    CanonicalRequest {
        text,
        signed_headers,
    }
}

/// `date/region/service/aws4_request`
pub fn credential_scope(date: &str, region: &str, service: &str) -> String {
    format!("{}/{}/{}/aws4_request", date, region, service)
}

pub fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hash_hex(canonical_request.as_bytes())
    )
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SkyError::invalid_input(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// kSigning from the secret and the credential scope parts
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// Everything needed to sign one request
#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    /// `YYYYMMDDTHHMMSSZ`; must equal the X-Amz-Date header
    pub amz_date: &'a str,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub authorization: String,
    pub signature: String,
    pub signed_headers: String,
    pub canonical_request: String,
}

pub fn sign(
    params: &SigningParams<'_>,
    method: &str,
    uri: &str,
    query: &str,
    headers: &[(String, String)],
    payload_hash: &str,
) -> Result<Signature> {
    if params.amz_date.len() < 8 {
        return Err(SkyError::invalid_input(format!(
            "malformed x-amz-date '{}'",
            params.amz_date
        )));
    }
    let date = &params.amz_date[..8];
    let canonical = canonical_request(method, uri, query, headers, payload_hash);
    let scope = credential_scope(date, params.region, params.service);
    let to_sign = string_to_sign(params.amz_date, &scope, &canonical.text);
    let key = signing_key(params.secret_key, date, params.region, params.service)?;
    let signature = hex::encode(hmac(&key, to_sign.as_bytes())?);

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, params.access_key, scope, canonical.signed_headers, signature
    );

    Ok(Signature {
        authorization,
        signature,
        signed_headers: canonical.signed_headers,
        canonical_request: canonical.text,
    })
}
