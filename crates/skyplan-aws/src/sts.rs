//! Identity probe

use crate::client::{ApiRequest, SigningClient};
use crate::xml;
use serde::Serialize;
use skyplan_core::{Result, SkyError};
use tracing::info;

const REJECTED_CODES: &[&str] = &[
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "AccessDenied",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

#[derive(Clone)]
pub struct StsService {
    client: SigningClient,
}

impl StsService {
    pub fn new(client: SigningClient) -> Self {
        Self { client }
    }

    pub async fn get_caller_identity(&self) -> Result<CallerIdentity> {
        let response = self
            .client
            .request(ApiRequest::action("sts", "GetCallerIdentity"))
            .await?;
        let body = response.body_text();
        let field = |tag: &str| xml::first_text(&body, tag).unwrap_or_default();
        let identity = CallerIdentity {
            account: field("Account"),
            arn: field("Arn"),
            user_id: field("UserId"),
        };
        if identity.account.is_empty() {
            return Err(SkyError::Serialization(
                "GetCallerIdentity response has no Account".to_string(),
            ));
        }
        Ok(identity)
    }

    /// Startup probe: a rejected signature or token becomes `CredentialsInvalid`
    pub async fn validate(&self) -> Result<CallerIdentity> {
        match self.get_caller_identity().await {
            Ok(identity) => {
                info!(account = %identity.account, arn = %identity.arn, "Credentials validated");
                Ok(identity)
            }
            Err(err @ SkyError::RemoteApi { .. }) if is_rejection(&err) => {
                Err(SkyError::CredentialsInvalid {
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }
}

fn is_rejection(err: &SkyError) -> bool {
    matches!(err.status(), Some(401) | Some(403))
        || err
            .remote_code()
            .map(|code| REJECTED_CODES.contains(&code))
            .unwrap_or(false)
}
