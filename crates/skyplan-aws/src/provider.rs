//! One handle over every AWS service the executor drives

use crate::ami::AmiResolver;
use crate::client::SigningClient;
use crate::credentials::{home_dir, CredentialStore};
use crate::ec2::Ec2Service;
use crate::http::ReqwestHttpClient;
use crate::iam::IamService;
use crate::lambda::LambdaService;
use crate::layer::LayerCache;
use crate::s3::{CopySettings, S3Service};
use crate::state::S3StateBackend;
use crate::sts::StsService;
use async_trait::async_trait;
use skyplan_config::{RuntimeConfig, StdEnvSource};
use skyplan_core::{IntentKind, Result, ResourceProbe, SkyError};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct AwsProvider {
    client: SigningClient,
    config: RuntimeConfig,
    s3: S3Service,
}

impl AwsProvider {
    /// Reqwest transport, the process credential store and the configured endpoint
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let http = ReqwestHttpClient::new(config.aws.timeout())
            .map_err(|e| SkyError::Transport(e.to_string()))?;
        let client = SigningClient::new(
            Arc::new(http),
            CredentialStore::global(&config.aws),
            config.aws.region.as_str(),
        )
        .with_endpoint(config.aws.endpoint.clone());
        Ok(Self::new(client, config.clone()))
    }

    pub fn new(client: SigningClient, config: RuntimeConfig) -> Self {
        let s3 = S3Service::new(client.clone()).with_copy_settings(CopySettings::from(&config.copy));
        Self { client, config, s3 }
    }

    pub fn region(&self) -> &str {
        self.client.region()
    }

    pub fn client(&self) -> &SigningClient {
        &self.client
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn s3(&self) -> &S3Service {
        &self.s3
    }

    pub fn iam(&self) -> IamService {
        IamService::new(self.client.clone())
    }

    pub fn lambda(&self) -> LambdaService {
        LambdaService::new(self.client.clone())
    }

    pub fn sts(&self) -> StsService {
        StsService::new(self.client.clone())
    }

    pub fn ec2(&self) -> Ec2Service {
        Ec2Service::new(self.client.clone(), &self.config.ami)
    }

    pub fn ami(&self) -> AmiResolver {
        AmiResolver::new(self.client.clone(), &self.config.ami)
    }

    pub fn state(&self) -> S3StateBackend {
        S3StateBackend::from_config(self.s3.clone(), &self.config.state, self.region())
    }

    pub fn layers(&self) -> LayerCache {
        LayerCache::from_config(&self.config.layers, home_dir(&StdEnvSource).as_deref())
    }
}

#[async_trait]
impl ResourceProbe for AwsProvider {
    async fn exists(&self, kind: IntentKind, name: &str) -> Result<bool> {
        debug!(kind = %kind.as_str(), name = %name, "Probing for existing resource");
        match kind {
            IntentKind::Bucket | IntentKind::StaticSite => self.s3.bucket_exists(name).await,
            IntentKind::Function => match self.lambda().get_function(name).await {
                Ok(_) => Ok(true),
                Err(err) if err.is_not_found() => Ok(false),
                Err(err) => Err(err),
            },
            IntentKind::Network => Ok(self.ec2().find_vpc(name).await?.is_some()),
            IntentKind::Webapp => Ok(self.ec2().find_instance(name).await?.is_some()),
            IntentKind::Database | IntentKind::Api => Ok(false),
        }
    }
}
