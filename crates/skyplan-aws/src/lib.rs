// skyplan-aws - AWS provider over the raw HTTP control plane
//
// Everything goes through one signing client:
// - SigV4 request fabric and credential discovery
// - AMI resolution with a TTL cache
// - Object-store engine (emptying, deletion, cross-region copy)
// - IAM role orchestration and Lambda deployment
// - Layer archive cache and the S3 state backend

pub mod ami;
pub mod client;
pub mod credentials;
pub mod ec2;
pub mod http;
pub mod iam;
pub mod lambda;
pub mod layer;
pub mod provider;
pub mod retry;
pub mod s3;
pub mod sigv4;
pub mod state;
pub mod sts;
mod xml;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Injectable wall clock; tests pin it to a fixed instant
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub use ami::{AmiCache, AmiResolver, AmiSource, CacheStats};
pub use client::{ApiRequest, ServiceClass, SigningClient};
pub use credentials::{CredentialProvider, CredentialSource, CredentialStore, Credentials};
pub use http::{HttpClient, HttpResponse, ReqwestHttpClient};
pub use iam::{IamService, RoleConfig, RoleInfo};
pub use lambda::{FunctionCode, FunctionConfig, FunctionInfo, LambdaService};
pub use layer::{DockerLayerBuilder, Layer, LayerArchiveBuilder, LayerCache};
pub use provider::AwsProvider;
pub use s3::{CopyProgress, CopyReport, CopyStatus, EmptyReport, S3Service};
pub use state::S3StateBackend;
pub use sts::{CallerIdentity, StsService};
