//! Function deployment: role resolution, readiness wait and create with IAM-consistency retries

use crate::client::{api_error, ApiRequest, SigningClient};
use crate::iam::IamService;
use crate::retry::{backoff, check_cancelled, sleep_or_cancel};
use base64::Engine;
use serde::{Deserialize, Serialize};
use skyplan_core::{Result, SkyError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const API_PREFIX: &str = "/2015-03-31";

const CREATE_RETRIES: u32 = 3;
const CREATE_BASE_DELAY: Duration = Duration::from_secs(2);
const CREATE_MAX_DELAY: Duration = Duration::from_secs(30);

/// 400 bodies that mean the role has not propagated yet
const ROLE_NOT_READY: &[&str] = &[
    "cannot be assumed",
    "Invalid role",
    "role is not authorized",
];

fn is_role_not_ready(status: u16, body: &str) -> bool {
    status == 400 && ROLE_NOT_READY.iter().any(|needle| body.contains(needle))
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionCode {
    /// In-memory zip archive
    ZipBytes(Vec<u8>),
    /// Zip archive on local disk
    ZipFile(PathBuf),
    S3 { bucket: String, key: String },
}

impl FunctionCode {
    async fn payload(&self) -> Result<serde_json::Value> {
        let encode = |bytes: &[u8]| base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(match self {
            FunctionCode::ZipBytes(bytes) => serde_json::json!({ "ZipFile": encode(bytes) }),
            FunctionCode::ZipFile(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| SkyError::io(format!("reading {}", path.display()), e))?;
                serde_json::json!({ "ZipFile": encode(&bytes) })
            }
            FunctionCode::S3 { bucket, key } => {
                serde_json::json!({ "S3Bucket": bucket, "S3Key": key })
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct FunctionConfig {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub memory_size: u32,
    pub timeout: u32,
    /// Role name or ARN
    pub role: String,
    pub code: Option<FunctionCode>,
    pub environment: BTreeMap<String, String>,
    pub layers: Vec<String>,
    pub description: Option<String>,
}

impl FunctionConfig {
    pub fn new(
        name: impl Into<String>,
        runtime: impl Into<String>,
        handler: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            runtime: runtime.into(),
            handler: handler.into(),
            memory_size: 128,
            timeout: 3,
            role: role.into(),
            code: None,
            environment: BTreeMap::new(),
            layers: Vec::new(),
            description: None,
        }
    }

    pub fn code(mut self, code: FunctionCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn memory(mut self, memory_size: u32) -> Self {
        self.memory_size = memory_size;
        self
    }

    pub fn timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn layer(mut self, arn: impl Into<String>) -> Self {
        self.layers.push(arn.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FunctionInfo {
    pub function_name: String,
    pub function_arn: String,
    pub runtime: String,
    pub handler: String,
    pub role: String,
    pub memory_size: u32,
    pub timeout: u32,
    pub code_size: u64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LayerVersion {
    pub layer_arn: String,
    pub layer_version_arn: String,
    pub version: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct GetFunctionResponse {
    configuration: FunctionInfo,
}

#[derive(Clone)]
pub struct LambdaService {
    client: SigningClient,
    iam: IamService,
}

impl LambdaService {
    pub fn new(client: SigningClient) -> Self {
        Self {
            iam: IamService::new(client.clone()),
            client,
        }
    }

    /// Resolve and wait for the role, then CreateFunction.
    ///
    /// Only a 400 whose body says the role cannot be used yet is retried
    /// (2s, 4s, 8s); every other non-201 response is terminal.
    #[instrument(skip(self, config, token), fields(function = %config.name))]
    pub async fn create_function(
        &self,
        config: &FunctionConfig,
        token: &CancellationToken,
    ) -> Result<FunctionInfo> {
        let code = config.code.as_ref().ok_or_else(|| {
            SkyError::invalid_input(format!("function {} has no code", config.name))
        })?;
        let code = code.payload().await?;

        let role_arn = self.iam.resolve_role_arn(&config.role).await?;
        self.iam.wait_for_role_ready(&role_arn, token).await?;

        let mut payload = serde_json::json!({
            "FunctionName": config.name,
            "Runtime": config.runtime,
            "Handler": config.handler,
            "MemorySize": config.memory_size,
            "Timeout": config.timeout,
            "Role": role_arn,
            "Code": code,
        });
        if !config.environment.is_empty() {
            payload["Environment"] = serde_json::json!({ "Variables": config.environment });
        }
        if !config.layers.is_empty() {
            payload["Layers"] = serde_json::json!(config.layers);
        }
        if let Some(description) = &config.description {
            payload["Description"] = serde_json::json!(description);
        }

        let path = format!("{}/functions", API_PREFIX);
        let mut attempt = 0;
        loop {
            check_cancelled(token)?;
            let response = self
                .client
                .send(ApiRequest::post("lambda", path.as_str()).json_body(&payload))
                .await?;

            if response.status == 201 {
                let function: FunctionInfo = response.json()?;
                info!(function = %function.function_name, arn = %function.function_arn, "Created function");
                return Ok(function);
            }

            let body = response.body_text();
            if is_role_not_ready(response.status, &body) && attempt < CREATE_RETRIES {
                let delay = backoff(attempt, CREATE_BASE_DELAY, CREATE_MAX_DELAY);
                warn!(function = %config.name, ?delay, "Role not assumable yet; retrying CreateFunction");
                sleep_or_cancel(token, delay).await?;
                attempt += 1;
                continue;
            }
            return Err(api_error("lambda", &response));
        }
    }

    pub async fn get_function(&self, name: &str) -> Result<FunctionInfo> {
        let response = self
            .client
            .request(ApiRequest::get(
                "lambda",
                format!("{}/functions/{}", API_PREFIX, urlencoding::encode(name)),
            ))
            .await?;
        let parsed: GetFunctionResponse = response.json()?;
        Ok(parsed.configuration)
    }

    pub async fn delete_function(&self, name: &str) -> Result<()> {
        self.client
            .request(ApiRequest::delete(
                "lambda",
                format!("{}/functions/{}", API_PREFIX, urlencoding::encode(name)),
            ))
            .await?;
        info!(function = %name, "Deleted function");
        Ok(())
    }

    /// Upload a zipped layer as a new version
    pub async fn publish_layer_version(
        &self,
        name: &str,
        description: &str,
        zip: &[u8],
        runtimes: &[String],
    ) -> Result<LayerVersion> {
        let payload = serde_json::json!({
            "Description": description,
            "Content": { "ZipFile": base64::engine::general_purpose::STANDARD.encode(zip) },
            "CompatibleRuntimes": runtimes,
        });
        let response = self
            .client
            .request(
                ApiRequest::post(
                    "lambda",
                    format!("{}/layers/{}/versions", API_PREFIX, urlencoding::encode(name)),
                )
                .json_body(&payload),
            )
            .await?;
        let layer: LayerVersion = response.json()?;
        info!(layer = %layer.layer_version_arn, "Published layer version");
        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::testing::{fixed_client, handler_client, ok, MockHttpClient};

    const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/fn-role";

    fn role_ready() -> Vec<HttpResponse> {
        vec![
            ok("<GetRoleResponse><GetRoleResult><Role><Arn>arn:aws:iam::123456789012:role/fn-role</Arn></Role></GetRoleResult></GetRoleResponse>"),
            ok("<ListAttachedRolePoliciesResult><IsTruncated>false</IsTruncated><AttachedPolicies><member>\
                <PolicyArn>arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole</PolicyArn>\
                </member></AttachedPolicies></ListAttachedRolePoliciesResult>"),
        ]
    }

    fn created() -> HttpResponse {
        HttpResponse::new(
            201,
            r#"{"FunctionName":"api","FunctionArn":"arn:aws:lambda:us-east-1:123456789012:function:api","Runtime":"python3.11","Handler":"app.handler","MemorySize":256,"Timeout":10,"State":"Pending"}"#,
        )
    }

    fn config() -> FunctionConfig {
        FunctionConfig::new("api", "python3.11", "app.handler", ROLE_ARN)
            .code(FunctionCode::ZipBytes(b"PK\x03\x04".to_vec()))
            .memory(256)
            .timeout(10)
            .env("STAGE", "dev")
    }

    fn posts(mock: &MockHttpClient) -> usize {
        mock.requests()
            .iter()
            .filter(|r| r.method == "POST" && r.path() == "/2015-03-31/functions")
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_while_role_propagates() {
        let mut responses = role_ready();
        responses.push(HttpResponse::new(
            400,
            r#"{"Type":"User","message":"The role defined for the function cannot be assumed by Lambda."}"#,
        ));
        responses.push(created());
        let (client, mock) = fixed_client("us-east-1", responses);

        let started = tokio::time::Instant::now();
        let function = LambdaService::new(client)
            .create_function(&config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(function.function_name, "api");
        assert_eq!(function.memory_size, 256);
        assert_eq!(posts(&mock), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));

        let request = mock.requests().pop().unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["Role"], ROLE_ARN);
        assert_eq!(body["Code"]["ZipFile"], "UEsDBA==");
        assert_eq!(body["Environment"]["Variables"]["STAGE"], "dev");
        assert!(body.get("Layers").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_400_is_terminal() {
        let mut responses = role_ready();
        responses.push(
            HttpResponse::new(400, r#"{"Type":"User","message":"MemorySize value failed to satisfy constraint"}"#)
                .with_header("x-amzn-ErrorType", "ValidationException"),
        );
        let (client, mock) = fixed_client("us-east-1", responses);
        let err = LambdaService::new(client)
            .create_function(&config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some("ValidationException"));
        assert_eq!(posts(&mock), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let (client, mock) = handler_client("us-east-1", |r| match r.action().as_deref() {
            Some("GetRole") => ok("<Role><Arn>arn:aws:iam::123456789012:role/fn-role</Arn></Role>"),
            Some("ListAttachedRolePolicies") => ok("<PolicyArn>arn:aws:iam::aws:policy/x</PolicyArn>"),
            _ => HttpResponse::new(400, r#"{"message":"Invalid role arn:aws:iam::123456789012:role/fn-role"}"#),
        });
        let err = LambdaService::new(client)
            .create_function(&config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(posts(&mock), 4);
    }

    #[tokio::test]
    async fn test_missing_code_is_invalid_input() {
        let (client, mock) = fixed_client("us-east-1", vec![]);
        let config = FunctionConfig::new("api", "python3.11", "app.handler", ROLE_ARN);
        let err = LambdaService::new(client)
            .create_function(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SkyError::InvalidInput(_)));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_s3_code_and_layers() {
        let code = FunctionCode::S3 {
            bucket: "artifacts".into(),
            key: "api.zip".into(),
        };
        assert_eq!(
            code.payload().await.unwrap(),
            serde_json::json!({ "S3Bucket": "artifacts", "S3Key": "api.zip" })
        );

        let (client, mock) = fixed_client(
            "eu-west-1",
            vec![ok(r#"{"LayerArn":"arn:aws:lambda:eu-west-1:1:layer:deps","LayerVersionArn":"arn:aws:lambda:eu-west-1:1:layer:deps:3","Version":3}"#)],
        );
        let layer = LambdaService::new(client)
            .publish_layer_version("deps", "python deps", b"zip", &["python3.11".to_string()])
            .await
            .unwrap();
        assert_eq!(layer.version, 3);
        let request = &mock.requests()[0];
        assert_eq!(request.path(), "/2015-03-31/layers/deps/versions");
        assert!(request.url.starts_with("https://lambda.eu-west-1.amazonaws.com/"));
    }

    #[tokio::test]
    async fn test_get_function() {
        let (client, _) = fixed_client(
            "us-east-1",
            vec![ok(r#"{"Configuration":{"FunctionName":"api","Runtime":"nodejs20.x"},"Code":{}}"#)],
        );
        let function = LambdaService::new(client).get_function("api").await.unwrap();
        assert_eq!(function.runtime, "nodejs20.x");
    }

    #[test]
    fn test_role_not_ready_matching() {
        assert!(is_role_not_ready(400, "The role defined for the function cannot be assumed by Lambda."));
        assert!(!is_role_not_ready(403, "cannot be assumed"));
        assert!(!is_role_not_ready(400, "Function already exist"));
    }
}
