//! Signing client: endpoint assembly, per-service headers, SigV4, dispatch and
//! error-envelope parsing for every AWS control-plane call.

use crate::credentials::CredentialProvider;
use crate::http::{HttpClient, HttpResponse};
use crate::sigv4::{self, SigningParams};
use crate::{xml, Clock};
use skyplan_core::{Result, SkyError};
use std::sync::Arc;
use tracing::debug;

/// Services with a single global endpoint, always signed for us-east-1
pub const GLOBAL_SERVICES: &[&str] = &[
    "iam",
    "sts",
    "cloudfront",
    "route53",
    "waf",
    "shield",
    "support",
];

pub const GLOBAL_SIGNING_REGION: &str = "us-east-1";

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

pub fn is_global(service: &str) -> bool {
    GLOBAL_SERVICES.contains(&service)
}

/// Wire protocol family of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceClass {
    /// Form-encoded `Action=...&Version=...`, XML responses
    Query,
    /// S3: REST paths, XML bodies, explicit content hash
    RestXml,
    /// Lambda: REST paths, JSON bodies
    RestJson,
    /// `X-Amz-Target` dispatch with amz-json bodies
    Json,
}

impl ServiceClass {
    pub fn of(service: &str) -> Self {
        match service {
            "ec2" | "iam" | "sts" | "rds" | "monitoring" => ServiceClass::Query,
            "s3" => ServiceClass::RestXml,
            "lambda" => ServiceClass::RestJson,
            _ => ServiceClass::Json,
        }
    }
}

/// API version sent with Query-protocol actions
pub fn api_version(service: &str) -> Option<&'static str> {
    match service {
        "ec2" => Some("2016-11-15"),
        "iam" => Some("2010-05-08"),
        "sts" => Some("2011-06-15"),
        "rds" => Some("2014-10-31"),
        "monitoring" => Some("2010-08-01"),
        _ => None,
    }
}

/// One control-plane call before signing
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: String,
    pub service: String,
    /// Overrides the client's region (ignored for global services)
    pub region: Option<String>,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub include_md5: bool,
    pub target: Option<String>,
    pub content_type: Option<String>,
}

impl ApiRequest {
    pub fn new(method: &str, service: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            service: service.to_string(),
            region: None,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            include_md5: false,
            target: None,
            content_type: None,
        }
    }

    pub fn get(service: &str, path: impl Into<String>) -> Self {
        Self::new("GET", service, path)
    }

    pub fn put(service: &str, path: impl Into<String>) -> Self {
        Self::new("PUT", service, path)
    }

    pub fn post(service: &str, path: impl Into<String>) -> Self {
        Self::new("POST", service, path)
    }

    pub fn delete(service: &str, path: impl Into<String>) -> Self {
        Self::new("DELETE", service, path)
    }

    pub fn head(service: &str, path: impl Into<String>) -> Self {
        Self::new("HEAD", service, path)
    }

    /// Query-protocol action; parameters added with [`query`](Self::query) end up in the form body
    pub fn action(service: &str, action: &str) -> Self {
        let mut request = Self::post(service, "/").query("Action", action);
        if let Some(version) = api_version(service) {
            request = request.query("Version", version);
        }
        request
    }

    /// JSON-protocol call dispatched by `X-Amz-Target`
    pub fn json_target(service: &str, target: &str, payload: &serde_json::Value) -> Self {
        let mut request = Self::post(service, "/");
        request.target = Some(target.to_string());
        request.body = payload.to_string().into_bytes();
        request
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json_body(mut self, payload: &serde_json::Value) -> Self {
        self.body = payload.to_string().into_bytes();
        self.content_type = Some("application/json".to_string());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add `Content-MD5`; required by S3 tagging, encryption and batch delete
    pub fn with_md5(mut self) -> Self {
        self.include_md5 = true;
        self
    }
}

/// Fully signed request, ready for the transport
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub signing_region: String,
}

impl PreparedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Stateless after construction; clones share the transport and credentials.
#[derive(Clone)]
pub struct SigningClient {
    http: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialProvider>,
    region: String,
    endpoint: Option<String>,
    clock: Clock,
}

impl SigningClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialProvider>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credentials,
            region: region.into(),
            endpoint: None,
            clock: crate::system_clock(),
        }
    }

    /// Send every request to `endpoint` (LocalStack, MinIO) instead of the AWS hosts
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.map(|e| e.trim_end_matches('/').to_string());
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Same transport and credentials, different default region
    pub fn for_region(&self, region: impl Into<String>) -> Self {
        let mut client = self.clone();
        client.region = region.into();
        client
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        (self.clock)()
    }

    /// Signing region for `service`: us-east-1 for global services
    pub fn signing_region<'a>(&'a self, service: &str, region: Option<&'a str>) -> &'a str {
        if is_global(service) {
            GLOBAL_SIGNING_REGION
        } else {
            region.unwrap_or(&self.region)
        }
    }

    /// `(origin, host, base path)` for a service
    fn endpoint_parts(&self, service: &str, region: &str) -> Result<(String, String, String)> {
        match &self.endpoint {
            Some(endpoint) => {
                let url = url::Url::parse(endpoint).map_err(|e| {
                    SkyError::invalid_input(format!("invalid endpoint '{}': {}", endpoint, e))
                })?;
                let host = url.host_str().ok_or_else(|| {
                    SkyError::invalid_input(format!("endpoint '{}' has no host", endpoint))
                })?;
                let host = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                let origin = format!("{}://{}", url.scheme(), host);
                let base_path = url.path().trim_end_matches('/').to_string();
                Ok((origin, host, base_path))
            }
            None => {
                let host = if is_global(service) {
                    format!("{}.amazonaws.com", service)
                } else {
                    format!("{}.{}.amazonaws.com", service, region)
                };
                Ok((format!("https://{}", host), host, String::new()))
            }
        }
    }

    /// Build URL and headers and sign. No I/O besides credential lookup.
    pub fn prepare(&self, request: ApiRequest) -> Result<PreparedRequest> {
        let credentials = self.credentials.credentials()?;
        let ApiRequest {
            method,
            service,
            region,
            path,
            mut query,
            headers: extra_headers,
            mut body,
            include_md5,
            target,
            content_type,
        } = request;

        let class = ServiceClass::of(&service);
        let region = region.unwrap_or_else(|| self.region.clone());
        let signing_region = self.signing_region(&service, Some(&region)).to_string();
        let (origin, host, base_path) = self.endpoint_parts(&service, &region)?;

        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        let uri = format!("{}{}", base_path, path);

        let mut content_type = content_type;
        if class == ServiceClass::Query && method == "POST" && !query.is_empty() {
            body = sigv4::canonical_query(&query).into_bytes();
            query.clear();
            content_type.get_or_insert_with(|| FORM_CONTENT_TYPE.to_string());
        }
        match class {
            ServiceClass::Json => {
                content_type.get_or_insert_with(|| AMZ_JSON_CONTENT_TYPE.to_string());
            }
            ServiceClass::RestJson if !body.is_empty() => {
                content_type.get_or_insert_with(|| "application/json".to_string());
            }
            ServiceClass::RestXml if !body.is_empty() => {
                content_type.get_or_insert_with(|| "application/xml".to_string());
            }
            _ => {}
        }

        let query_string = sigv4::canonical_query(&query);
        let url = if query_string.is_empty() {
            format!("{}{}", origin, uri)
        } else {
            format!("{}{}?{}", origin, uri, query_string)
        };

        let payload_hash = sigv4::hash_hex(&body);
        let amz_date = sigv4::amz_date((self.clock)());

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if class == ServiceClass::RestXml {
            headers.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
        }
        if let Some(token) = &credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type));
        }
        if include_md5 {
            headers.push(("content-md5".to_string(), sigv4::content_md5(&body)));
        }
        if let Some(target) = target {
            headers.push(("x-amz-target".to_string(), target));
        }
        headers.extend(extra_headers);

        let signature = sigv4::sign(
            &SigningParams {
                access_key: &credentials.access_key_id,
                secret_key: &credentials.secret_access_key,
                region: &signing_region,
                service: &service,
                amz_date: &amz_date,
            },
            &method,
            &uri,
            &query_string,
            &headers,
            &payload_hash,
        )?;
        headers.push(("authorization".to_string(), signature.authorization));

        let body = match method.as_str() {
            "POST" | "PUT" => Some(body),
            _ if !body.is_empty() => Some(body),
            _ => None,
        };

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
            signing_region,
        })
    }

    /// Sign and dispatch; any HTTP status is returned as a response
    pub async fn send(&self, request: ApiRequest) -> Result<HttpResponse> {
        let service = request.service.clone();
        let prepared = self.prepare(request)?;
        debug!(
            method = %prepared.method,
            service = %service,
            url = %prepared.url,
            "Sending request"
        );

        let response = self
            .http
            .request(
                &prepared.method,
                &prepared.url,
                prepared.headers,
                prepared.body,
            )
            .await
            .map_err(|e| SkyError::Transport(format!("{:#}", e)))?;

        debug!(service = %service, status = response.status, "Received response");
        Ok(response)
    }

    /// Sign and dispatch; non-2xx responses become [`SkyError::RemoteApi`]
    pub async fn request(&self, request: ApiRequest) -> Result<HttpResponse> {
        let service = request.service.clone();
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(api_error(&service, &response))
        }
    }
}

/// Parse an error envelope into [`SkyError::RemoteApi`]
pub fn api_error(service: &str, response: &HttpResponse) -> SkyError {
    let (code, message) = parse_error_body(&response.body_text(), response.header("x-amzn-errortype"));
    SkyError::remote(response.status, service, code, message)
}

/// `(code, message)` from an XML or JSON error envelope; raw body otherwise
pub fn parse_error_body(body: &str, type_header: Option<&str>) -> (String, String) {
    let trimmed = body.trim();
    let header_code = type_header
        .map(|t| t.split(':').next().unwrap_or(t).to_string())
        .unwrap_or_default();

    if trimmed.starts_with('<') {
        let code = xml::first_text(trimmed, "Code").unwrap_or_default();
        let message = xml::first_text(trimmed, "Message").unwrap_or_default();
        if !code.is_empty() || !message.is_empty() {
            return (code, message);
        }
    } else if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let pick = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
                    .map(str::to_string)
            };
            let code = pick(&["__type", "code", "Code", "errorType"])
                .map(|c| c.rsplit('#').next().unwrap_or(&c).to_string())
                .unwrap_or(header_code);
            let message = pick(&["message", "Message", "errorMessage"]).unwrap_or_default();
            return (code, message);
        }
    }

    let message = if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.to_string()
    };
    (header_code, message)
}
