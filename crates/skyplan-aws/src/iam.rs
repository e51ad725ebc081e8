//! IAM role orchestration: create, attach with retry, wait for propagation, roll back

use crate::client::{ApiRequest, SigningClient};
use crate::retry::{backoff, check_cancelled, sleep_or_cancel};
use crate::xml;
use serde::Serialize;
use skyplan_core::{Result, SkyError};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const ROLE_ARN_PREFIX: &str = "arn:aws:iam::";

const ATTACH_RETRIES: u32 = 3;
const ATTACH_BASE_DELAY: Duration = Duration::from_secs(1);

const PROPAGATION_ATTEMPTS: u32 = 15;
const PROPAGATION_BASE_DELAY: Duration = Duration::from_secs(1);
const PROPAGATION_MAX_DELAY: Duration = Duration::from_secs(10);

const READY_ATTEMPTS: u32 = 10;
const READY_BASE_DELAY: Duration = Duration::from_secs(1);
const READY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Managed policies reachable by their human names
const POLICY_VOCABULARY: &[(&str, &str)] = &[
    (
        "basic cloudwatch logs access",
        "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
    ),
    (
        "vpc access",
        "arn:aws:iam::aws:policy/service-role/AWSLambdaVPCAccessExecutionRole",
    ),
    ("s3 full access", "arn:aws:iam::aws:policy/AmazonS3FullAccess"),
    ("s3 read access", "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess"),
    (
        "s3 read only access",
        "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess",
    ),
    (
        "dynamodb read/write access",
        "arn:aws:iam::aws:policy/AmazonDynamoDBFullAccess",
    ),
    (
        "dynamodb read access",
        "arn:aws:iam::aws:policy/AmazonDynamoDBReadOnlyAccess",
    ),
    ("sqs full access", "arn:aws:iam::aws:policy/AmazonSQSFullAccess"),
    ("sns publish access", "arn:aws:iam::aws:policy/AmazonSNSFullAccess"),
    ("xray write access", "arn:aws:iam::aws:policy/AWSXrayWriteOnlyAccess"),
];

/// Map human policy names onto managed-policy ARNs.
///
/// ARNs pass through, unknown names are dropped, duplicates keep their first position.
pub fn convert_requirements_to_arns<S: AsRef<str>>(requirements: &[S]) -> Vec<String> {
    let mut arns: Vec<String> = Vec::new();
    for requirement in requirements {
        let requirement = requirement.as_ref().trim();
        let arn = if requirement.starts_with("arn:") {
            Some(requirement.to_string())
        } else {
            let wanted = requirement.to_lowercase();
            POLICY_VOCABULARY
                .iter()
                .find(|(name, _)| *name == wanted)
                .map(|(_, arn)| arn.to_string())
        };
        match arn {
            Some(arn) if !arns.contains(&arn) => arns.push(arn),
            Some(_) => {}
            None => debug!(requirement = %requirement, "No managed policy for requirement"),
        }
    }
    arns
}

/// Role name from a role ARN, or the input unchanged
pub fn role_name(name_or_arn: &str) -> &str {
    if name_or_arn.starts_with(ROLE_ARN_PREFIX) {
        name_or_arn.rsplit('/').next().unwrap_or(name_or_arn)
    } else {
        name_or_arn
    }
}

#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub name: String,
    pub trust_policy: serde_json::Value,
    pub description: Option<String>,
    pub path: String,
    pub tags: BTreeMap<String, String>,
}

impl RoleConfig {
    /// Role assumable by `principal`, e.g. `lambda.amazonaws.com`
    pub fn for_service(name: impl Into<String>, principal: &str) -> Self {
        Self {
            name: name.into(),
            trust_policy: serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": principal },
                    "Action": "sts:AssumeRole"
                }]
            }),
            description: None,
            path: "/".to_string(),
            tags: BTreeMap::new(),
        }
    }

    pub fn lambda(name: impl Into<String>) -> Self {
        Self::for_service(name, "lambda.amazonaws.com")
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleInfo {
    pub name: String,
    pub arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_policy: Option<serde_json::Value>,
    pub attached_policies: Vec<String>,
}

#[derive(Clone)]
pub struct IamService {
    client: SigningClient,
}

impl IamService {
    pub fn new(client: SigningClient) -> Self {
        Self { client }
    }

    pub async fn create_role(&self, config: &RoleConfig) -> Result<String> {
        let mut request = ApiRequest::action("iam", "CreateRole")
            .query("RoleName", config.name.as_str())
            .query("AssumeRolePolicyDocument", config.trust_policy.to_string())
            .query("Path", config.path.as_str());
        if let Some(description) = &config.description {
            request = request.query("Description", description.as_str());
        }
        for (i, (key, value)) in config.tags.iter().enumerate() {
            request = request
                .query(format!("Tags.member.{}.Key", i + 1), key.as_str())
                .query(format!("Tags.member.{}.Value", i + 1), value.as_str());
        }

        let response = self.client.request(request).await?;
        let arn = xml::first_text(&response.body_text(), "Arn").ok_or_else(|| {
            SkyError::Serialization(format!("CreateRole response for {} has no Arn", config.name))
        })?;
        info!(role = %config.name, arn = %arn, "Created role");
        Ok(arn)
    }

    /// AttachRolePolicy, retrying throttling and transient failures (1s, 2s, 4s)
    pub async fn attach_role_policy(
        &self,
        role: &str,
        policy_arn: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            check_cancelled(token)?;
            let result = self
                .client
                .request(
                    ApiRequest::action("iam", "AttachRolePolicy")
                        .query("RoleName", role)
                        .query("PolicyArn", policy_arn),
                )
                .await;
            match result {
                Ok(_) => {
                    debug!(role = %role, policy = %policy_arn, "Attached policy");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < ATTACH_RETRIES => {
                    let delay = backoff(attempt, ATTACH_BASE_DELAY, Duration::MAX);
                    warn!(role = %role, policy = %policy_arn, error = %err, ?delay, "Retrying policy attachment");
                    sleep_or_cancel(token, delay).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.client
            .request(
                ApiRequest::action("iam", "DetachRolePolicy")
                    .query("RoleName", role)
                    .query("PolicyArn", policy_arn),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_role(&self, role: &str) -> Result<()> {
        self.client
            .request(ApiRequest::action("iam", "DeleteRole").query("RoleName", role))
            .await?;
        info!(role = %role, "Deleted role");
        Ok(())
    }

    /// GetRole plus its attached policies
    pub async fn get_role(&self, role: &str) -> Result<RoleInfo> {
        let response = self
            .client
            .request(ApiRequest::action("iam", "GetRole").query("RoleName", role))
            .await?;
        let body = response.body_text();
        let arn = xml::first_text(&body, "Arn").ok_or_else(|| {
            SkyError::Serialization(format!("GetRole response for {} has no Arn", role))
        })?;
        let trust_policy = xml::first_text(&body, "AssumeRolePolicyDocument").and_then(|doc| {
            let decoded = urlencoding::decode(&doc).ok()?;
            serde_json::from_str(&decoded).ok()
        });
        Ok(RoleInfo {
            name: xml::first_text(&body, "RoleName").unwrap_or_else(|| role.to_string()),
            arn,
            trust_policy,
            attached_policies: self.list_attached_role_policies(role).await?,
        })
    }

    async fn role_arn(&self, role: &str) -> Result<String> {
        let response = self
            .client
            .request(ApiRequest::action("iam", "GetRole").query("RoleName", role))
            .await?;
        xml::first_text(&response.body_text(), "Arn").ok_or_else(|| {
            SkyError::Serialization(format!("GetRole response for {} has no Arn", role))
        })
    }

    pub async fn list_attached_role_policies(&self, role: &str) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut request =
                ApiRequest::action("iam", "ListAttachedRolePolicies").query("RoleName", role);
            if let Some(marker) = &marker {
                request = request.query("Marker", marker.as_str());
            }
            let body = self.client.request(request).await?.body_text();
            arns.extend(xml::all_texts(&body, "PolicyArn"));

            let truncated = xml::first_text(&body, "IsTruncated").as_deref() == Some("true");
            match xml::first_text(&body, "Marker") {
                Some(next) if truncated => marker = Some(next),
                _ => break,
            }
        }
        Ok(arns)
    }

    /// Role is gettable and lists at least one policy
    async fn is_role_ready(&self, role: &str) -> bool {
        match self.role_arn(role).await {
            Ok(_) => match self.list_attached_role_policies(role).await {
                Ok(policies) => !policies.is_empty(),
                Err(err) => {
                    debug!(role = %role, error = %err, "Attached policies not visible yet");
                    false
                }
            },
            Err(err) => {
                debug!(role = %role, error = %err, "Role not visible yet");
                false
            }
        }
    }

    async fn poll_until_ready(
        &self,
        role: &str,
        attempts: u32,
        base: Duration,
        cap: Duration,
        token: &CancellationToken,
    ) -> Result<()> {
        for attempt in 0..attempts {
            check_cancelled(token)?;
            if self.is_role_ready(role).await {
                debug!(role = %role, attempt, "Role is ready");
                return Ok(());
            }
            if attempt + 1 < attempts {
                sleep_or_cancel(token, backoff(attempt, base, cap)).await?;
            }
        }
        Err(SkyError::TransientConsistency(format!(
            "role {} not visible with attached policies after {} attempts",
            role, attempts
        )))
    }

    /// Poll GetRole and ListAttachedRolePolicies (15 attempts, backoff capped at 10s)
    pub async fn wait_for_role_propagation(
        &self,
        role: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        self.poll_until_ready(
            role,
            PROPAGATION_ATTEMPTS,
            PROPAGATION_BASE_DELAY,
            PROPAGATION_MAX_DELAY,
            token,
        )
        .await
    }

    /// Pre-deployment check for an existing role (10 attempts, backoff capped at 30s)
    pub async fn wait_for_role_ready(
        &self,
        name_or_arn: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        self.poll_until_ready(
            role_name(name_or_arn),
            READY_ATTEMPTS,
            READY_BASE_DELAY,
            READY_MAX_DELAY,
            token,
        )
        .await
    }

    /// Create a role, attach `policies` and wait until it is usable.
    ///
    /// Any failure after CreateRole detaches what was attached and deletes the
    /// role (best-effort), then surfaces the original error.
    #[instrument(skip(self, config, token), fields(role = %config.name))]
    pub async fn create_role_with_policies(
        &self,
        config: &RoleConfig,
        policies: &[String],
        token: &CancellationToken,
    ) -> Result<RoleInfo> {
        if policies.is_empty() {
            return Err(SkyError::invalid_input(format!(
                "role {} needs at least one policy",
                config.name
            )));
        }

        let arn = self.create_role(config).await?;
        let mut attached: Vec<String> = Vec::new();

        let result = async {
            for policy in policies {
                self.attach_role_policy(&config.name, policy, token).await?;
                attached.push(policy.clone());
            }
            self.wait_for_role_propagation(&config.name, token).await
        }
        .await;

        if let Err(err) = result {
            warn!(role = %config.name, error = %err, attached = attached.len(), "Rolling back role");
            self.rollback(&config.name, &attached).await;
            return Err(err);
        }

        Ok(RoleInfo {
            name: config.name.clone(),
            arn,
            trust_policy: Some(config.trust_policy.clone()),
            attached_policies: attached,
        })
    }

    async fn rollback(&self, role: &str, attached: &[String]) {
        for policy in attached {
            if let Err(err) = self.detach_role_policy(role, policy).await {
                warn!(role = %role, policy = %policy, error = %err, "Rollback: detach failed");
            }
        }
        if let Err(err) = self.delete_role(role).await {
            warn!(role = %role, error = %err, "Rollback: delete role failed");
        }
    }

    /// Role ARN for an ARN or a role name
    pub async fn resolve_role_arn(&self, input: &str) -> Result<String> {
        if input.starts_with(ROLE_ARN_PREFIX) {
            return Ok(input.to_string());
        }
        match self.role_arn(input).await {
            Ok(arn) => Ok(arn),
            Err(err) if err.is_not_found() => Err(SkyError::RoleNotFound(input.to_string())),
            Err(err) => Err(err),
        }
    }
}
