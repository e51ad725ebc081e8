// Plan execution
//
// Walks plan steps in order, hands each one to a StepHandler and keeps going
// past failures where it can:
// - optional steps may fail with a warning
// - a failed required step blocks the steps that depend on it
// - cancellation stops the walk; the remaining steps are reported as skipped

use async_trait::async_trait;
use serde_json::{json, Value};
use skyplan_aws::ec2::{subnet_cidrs, InstanceConfig};
use skyplan_aws::iam::convert_requirements_to_arns;
use skyplan_aws::{AwsProvider, FunctionCode, FunctionConfig, LayerCache, RoleConfig};
use skyplan_core::{Intent, IntentKind, Plan, Result, SkyError, StateStore, Step};
use skyplan_planner::templates::{parse_tags, DEFAULT_CIDR, DEFAULT_RUNTIME};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub id: String,
    pub status: StepStatus,
    pub detail: Option<String>,
}

/// What a deploy run produced so far
#[derive(Debug)]
pub struct StepContext {
    pub intent: Intent,
    /// Values later steps consume (`vpc_id`, `role_arn`, ...)
    pub outputs: BTreeMap<String, String>,
    /// State entries keyed `kind/name`
    pub resources: BTreeMap<String, Value>,
}

impl StepContext {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            outputs: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    fn output(&self, key: &str) -> Result<&str> {
        self.outputs.get(key).map(String::as_str).ok_or_else(|| {
            SkyError::invalid_input(format!("no '{}' from an earlier step", key))
        })
    }

    fn record(&mut self, kind: IntentKind, name: &str, entry: Value) {
        self.resources
            .insert(format!("{}/{}", kind.as_str(), name), entry);
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, step: &Step, ctx: &mut StepContext, token: &CancellationToken) -> Result<()>;
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub outcomes: Vec<StepOutcome>,
    pub outputs: BTreeMap<String, String>,
    pub resources: BTreeMap<String, Value>,
    error: Option<SkyError>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn outcome(&self, id: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// The first required-step failure, if any
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

pub async fn execute(
    plan: &Plan,
    intent: &Intent,
    handler: &dyn StepHandler,
    token: &CancellationToken,
) -> Result<ExecutionReport> {
    plan.validate()?;
    let mut ctx = StepContext::new(intent.clone());
    let mut outcomes = Vec::with_capacity(plan.steps.len());
    let mut blocked: HashSet<&str> = HashSet::new();
    let mut first_error: Option<SkyError> = None;
    let mut cancelled = false;

    for step in &plan.steps {
        if cancelled || token.is_cancelled() {
            cancelled = true;
            outcomes.push(StepOutcome {
                id: step.id.clone(),
                status: StepStatus::Skipped,
                detail: Some("cancelled".to_string()),
            });
            continue;
        }
        if let Some(dep) = step.depends_on.iter().find(|d| blocked.contains(d.as_str())) {
            warn!(step = %step.id, dependency = %dep, "Skipping step after failed dependency");
            blocked.insert(&step.id);
            outcomes.push(StepOutcome {
                id: step.id.clone(),
                status: StepStatus::Skipped,
                detail: Some(format!("'{}' failed", dep)),
            });
            continue;
        }

        info!(step = %step.id, action = %step.action, "Running step");
        match handler.run(step, &mut ctx, token).await {
            Ok(()) => outcomes.push(StepOutcome {
                id: step.id.clone(),
                status: StepStatus::Succeeded,
                detail: None,
            }),
            Err(SkyError::Cancelled) => {
                cancelled = true;
                outcomes.push(StepOutcome {
                    id: step.id.clone(),
                    status: StepStatus::Skipped,
                    detail: Some("cancelled".to_string()),
                });
            }
            Err(err) if step.optional => {
                warn!(step = %step.id, error = %err, "Optional step failed");
                outcomes.push(StepOutcome {
                    id: step.id.clone(),
                    status: StepStatus::Failed,
                    detail: Some(err.to_string()),
                });
            }
            Err(err) => {
                error!(step = %step.id, error = %err, "Step failed");
                blocked.insert(&step.id);
                outcomes.push(StepOutcome {
                    id: step.id.clone(),
                    status: StepStatus::Failed,
                    detail: Some(err.to_string()),
                });
                first_error.get_or_insert(err);
            }
        }
    }

    if cancelled {
        first_error = Some(SkyError::Cancelled);
    }
    Ok(ExecutionReport {
        plan_id: plan.id.clone(),
        outcomes,
        outputs: ctx.outputs,
        resources: ctx.resources,
        error: first_error,
    })
}

/// Merge the run's resources and outputs into the state document under a lock
pub async fn persist(store: &dyn StateStore, key: &str, report: &ExecutionReport) -> Result<()> {
    if report.resources.is_empty() && report.outputs.is_empty() {
        return Ok(());
    }
    store.lock(key).await?;
    let result = async {
        let mut doc = store.read(key).await?;
        doc.resources
            .extend(report.resources.iter().map(|(k, v)| (k.clone(), v.clone())));
        doc.outputs
            .extend(report.outputs.iter().map(|(k, v)| (k.clone(), json!(v))));
        store.write(key, &mut doc).await
    }
    .await;
    if let Err(err) = store.unlock(key).await {
        warn!(key = %key, error = %err, "Failed to release state lock");
    }
    result
}

const DEFAULT_POLICY: &str = "basic cloudwatch logs access";

/// Runs plan steps against AWS
pub struct AwsSteps {
    aws: AwsProvider,
    layers: LayerCache,
}

impl AwsSteps {
    pub fn new(aws: AwsProvider) -> Self {
        let layers = aws.layers();
        Self { aws, layers }
    }

    pub fn with_layers(mut self, layers: LayerCache) -> Self {
        self.layers = layers;
        self
    }

    fn bucket_entry(&self, name: &str) -> Value {
        json!({ "arn": format!("arn:aws:s3:::{}", name), "region": self.aws.region() })
    }

    async fn analyze(&self, ctx: &mut StepContext) -> Result<()> {
        let name = ctx.intent.name.clone();
        let details = match ctx.intent.kind {
            IntentKind::Bucket | IntentKind::StaticSite => {
                let region = self.aws.s3().bucket_region(&name).await?;
                json!({ "arn": format!("arn:aws:s3:::{}", name), "region": region })
            }
            IntentKind::Function | IntentKind::Api => {
                let function = self.aws.lambda().get_function(&name).await?;
                json!({ "arn": function.function_arn, "runtime": function.runtime })
            }
            IntentKind::Network => {
                let vpc = self.aws.ec2().find_vpc(&name).await?;
                json!({ "vpc_id": vpc.ok_or_else(|| SkyError::NotFound(format!("VPC {}", name)))? })
            }
            IntentKind::Webapp => {
                let instance = self.aws.ec2().find_instance(&name).await?;
                json!({ "instance_id": instance.ok_or_else(|| SkyError::NotFound(format!("instance {}", name)))? })
            }
            IntentKind::Database => {
                return Err(SkyError::invalid_input("database adoption is not supported"));
            }
        };
        ctx.outputs.insert("adopted".to_string(), details.to_string());
        Ok(())
    }

    async fn create_role(&self, step: &Step, ctx: &mut StepContext, token: &CancellationToken) -> Result<()> {
        let requirements: Vec<&str> = ctx
            .intent
            .param("policies")
            .unwrap_or(DEFAULT_POLICY)
            .split(',')
            .collect();
        let policies = convert_requirements_to_arns(&requirements);
        let config = RoleConfig::lambda(step.resource.as_str())
            .description(format!("Execution role for {}", ctx.intent.name))
            .tag("managed-by", "skyplan");
        let role = self
            .aws
            .iam()
            .create_role_with_policies(&config, &policies, token)
            .await?;
        ctx.outputs.insert("role_arn".to_string(), role.arn.clone());
        ctx.resources.insert(
            format!("role/{}", role.name),
            json!({ "arn": role.arn, "policies": role.attached_policies }),
        );
        Ok(())
    }

    async fn publish_layer(&self, step: &Step, ctx: &mut StepContext) -> Result<()> {
        let runtime = ctx.intent.param("runtime").unwrap_or(DEFAULT_RUNTIME).to_string();
        let src = PathBuf::from(ctx.output_or_param("layer")?);
        let layer = self.layers.build(&step.resource, &runtime, &src).await?;
        let zip = tokio::fs::read(&layer.path)
            .await
            .map_err(|e| SkyError::io(format!("reading {}", layer.path.display()), e))?;
        let version = self
            .aws
            .lambda()
            .publish_layer_version(
                &step.resource,
                &format!("{} dependencies ({})", runtime, &layer.digest[..layer.digest.len().min(8)]),
                &zip,
                &[runtime],
            )
            .await?;
        ctx.outputs
            .insert("layer_arn".to_string(), version.layer_version_arn.clone());
        Ok(())
    }

    async fn create_function(&self, ctx: &mut StepContext, token: &CancellationToken) -> Result<()> {
        let intent = &ctx.intent;
        let runtime = intent.param("runtime").unwrap_or(DEFAULT_RUNTIME);
        let handler = intent
            .param("handler")
            .unwrap_or(if runtime.starts_with("python") { "app.handler" } else { "index.handler" });
        let code = intent.param("code").ok_or_else(|| {
            SkyError::invalid_input(format!("function {} needs code=<path to zip>", intent.name))
        })?;

        let mut config = FunctionConfig::new(&intent.name, runtime, handler, ctx.output("role_arn")?)
            .code(FunctionCode::ZipFile(PathBuf::from(code)))
            .memory(intent.number("memory", 128)?)
            .timeout(intent.number("timeout", 3)?);
        if let Some(layer) = ctx.outputs.get("layer_arn") {
            config = config.layer(layer.as_str());
        }

        let function = self.aws.lambda().create_function(&config, token).await?;
        let name = intent.name.clone();
        let kind = intent.kind;
        ctx.outputs
            .insert("function_arn".to_string(), function.function_arn.clone());
        ctx.record(
            kind,
            &name,
            json!({ "arn": function.function_arn, "runtime": function.runtime }),
        );
        Ok(())
    }

    async fn create_security_group(&self, step: &Step, ctx: &mut StepContext) -> Result<()> {
        let ports: &[u16] = match ctx.intent.kind {
            IntentKind::Database => match ctx.intent.param("engine") {
                Some(engine) if engine.contains("mysql") || engine.contains("maria") => &[3306],
                _ => &[5432],
            },
            _ => &[80, 443],
        };
        let vpc = ctx.intent.param("vpc").map(str::to_string);
        let group = self
            .aws
            .ec2()
            .create_security_group(&step.resource, vpc.as_deref(), ports)
            .await?;
        ctx.outputs.insert("security_group_id".to_string(), group);
        Ok(())
    }

    async fn run_instance(&self, ctx: &mut StepContext) -> Result<()> {
        let intent = &ctx.intent;
        let mut config = InstanceConfig::new(&intent.name, intent.param("image").unwrap_or("ubuntu-lts"))
            .instance_type(intent.param("instance_type").unwrap_or("t3.micro"));
        if let Some(subnet) = intent.param("subnet") {
            config = config.subnet(subnet);
        }
        config.key_name = intent.param("key").map(str::to_string);
        config.security_group_ids = ctx.outputs.get("security_group_id").cloned().into_iter().collect();

        let instance = self.aws.ec2().run_instance(&config).await?;
        let name = intent.name.clone();
        let kind = intent.kind;
        ctx.outputs
            .insert("instance_id".to_string(), instance.instance_id.clone());
        ctx.record(
            kind,
            &name,
            json!({ "instance_id": instance.instance_id, "image_id": instance.image_id }),
        );
        Ok(())
    }
}

impl StepContext {
    /// Earlier output, falling back to the intent option of the same name
    fn output_or_param(&self, key: &str) -> Result<String> {
        if let Some(value) = self.outputs.get(key) {
            return Ok(value.clone());
        }
        self.intent
            .param(key)
            .map(str::to_string)
            .ok_or_else(|| SkyError::invalid_input(format!("missing option '{}'", key)))
    }
}

#[async_trait]
impl StepHandler for AwsSteps {
    async fn run(&self, step: &Step, ctx: &mut StepContext, token: &CancellationToken) -> Result<()> {
        let s3 = self.aws.s3();
        let name = ctx.intent.name.clone();
        let kind = ctx.intent.kind;
        match step.action.as_str() {
            "s3:CreateBucket" => {
                s3.create_bucket(&name, self.aws.region()).await?;
                ctx.outputs.insert("bucket".to_string(), name.clone());
                ctx.record(kind, &name, self.bucket_entry(&name));
            }
            "s3:PutBucketVersioning" => s3.put_bucket_versioning(&name, true).await?,
            "s3:PutBucketEncryption" => s3.put_bucket_encryption(&name).await?,
            "s3:PutBucketPublicAccessBlock" => s3.put_public_access_block(&name).await?,
            "s3:PutBucketTagging" => {
                let tags: BTreeMap<String, String> = parse_tags(&ctx.intent)?.into_iter().collect();
                s3.put_bucket_tagging(&name, &tags).await?;
            }
            "s3:PutBucketWebsite" => {
                s3.put_bucket_website(&name, "index.html", "error.html").await?;
                ctx.outputs.insert(
                    "website_url".to_string(),
                    format!("http://{}.s3-website-{}.amazonaws.com", name, self.aws.region()),
                );
            }
            "s3:PutBucketPolicy" => {
                let policy = json!({
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Sid": "PublicReadGetObject",
                        "Effect": "Allow",
                        "Principal": "*",
                        "Action": "s3:GetObject",
                        "Resource": format!("arn:aws:s3:::{}/*", name),
                    }]
                });
                s3.put_bucket_policy(&name, &policy).await?;
            }
            "iam:CreateRole" => self.create_role(step, ctx, token).await?,
            "lambda:PublishLayerVersion" => self.publish_layer(step, ctx).await?,
            "lambda:CreateFunction" => self.create_function(ctx, token).await?,
            "ec2:CreateVpc" => {
                let cidr = ctx.intent.param("cidr").unwrap_or(DEFAULT_CIDR).to_string();
                let vpc_id = self.aws.ec2().create_vpc(&name, &cidr).await?;
                ctx.outputs.insert("vpc_id".to_string(), vpc_id.clone());
                ctx.record(kind, &name, json!({ "vpc_id": vpc_id, "cidr": cidr }));
            }
            "ec2:CreateSubnet" => {
                let vpc_id = ctx.output("vpc_id")?.to_string();
                let cidr = ctx.intent.param("cidr").unwrap_or(DEFAULT_CIDR);
                let mut subnets = Vec::new();
                for subnet_cidr in subnet_cidrs(cidr)? {
                    subnets.push(self.aws.ec2().create_subnet(&vpc_id, &subnet_cidr, None).await?);
                }
                ctx.outputs.insert("subnet_ids".to_string(), subnets.join(","));
            }
            "ec2:CreateInternetGateway" => {
                let vpc_id = ctx.output("vpc_id")?.to_string();
                let gateway = self.aws.ec2().create_internet_gateway(&vpc_id).await?;
                ctx.outputs.insert("internet_gateway_id".to_string(), gateway);
            }
            "ec2:CreateSecurityGroup" => self.create_security_group(step, ctx).await?,
            "ec2:RunInstances" => self.run_instance(ctx).await?,
            skyplan_planner::adoption::ANALYZE => self.analyze(ctx).await?,
            skyplan_planner::adoption::IMPORT => {
                let details = ctx.output("adopted")?;
                let mut entry: Value = serde_json::from_str(details)?;
                entry["adopted"] = json!(true);
                ctx.record(kind, &name, entry);
            }
            skyplan_planner::adoption::APPLY_BEST_PRACTICES if kind == IntentKind::Bucket => {
                s3.put_bucket_versioning(&name, true).await?;
                s3.put_bucket_encryption(&name).await?;
                s3.put_public_access_block(&name).await?;
            }
            other => {
                return Err(SkyError::invalid_input(format!(
                    "no executor for action '{}' (step '{}')",
                    other, step.id
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use skyplan_aws::credentials::StaticCredentials;
    use skyplan_aws::{Credentials, HttpClient, HttpResponse, SigningClient};
    use skyplan_config::RuntimeConfig;
    use skyplan_core::StateDocument;
    use std::sync::Arc;

    /// Records (method, url) and answers from a closure
    struct FakeHttp {
        seen: Mutex<Vec<(String, String)>>,
        respond: Box<dyn Fn(&str, &str) -> HttpResponse + Send + Sync>,
    }

    #[async_trait]
    impl HttpClient for FakeHttp {
        async fn request(
            &self,
            method: &str,
            url: &str,
            _headers: Vec<(String, String)>,
            _body: Option<Vec<u8>>,
        ) -> anyhow::Result<HttpResponse> {
            self.seen.lock().push((method.to_string(), url.to_string()));
            Ok((self.respond)(method, url))
        }
    }

    fn aws_over(
        respond: impl Fn(&str, &str) -> HttpResponse + Send + Sync + 'static,
    ) -> (AwsProvider, Arc<FakeHttp>) {
        let http = Arc::new(FakeHttp {
            seen: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        });
        let client = SigningClient::new(
            http.clone(),
            Arc::new(StaticCredentials(Credentials::new("AKIDEXAMPLE", "SECRET"))),
            "us-east-1",
        );
        (AwsProvider::new(client, RuntimeConfig::default()), http)
    }

    fn bucket_plan(name: &str) -> (Plan, Intent) {
        let intent = Intent::parse(&["bucket", name]).unwrap();
        (skyplan_planner::plan(&intent).unwrap(), intent)
    }

    #[tokio::test]
    async fn test_bucket_plan_runs_every_step() {
        let (aws, http) = aws_over(|_, _| HttpResponse::new(200, ""));
        let (plan, intent) = bucket_plan("exec-all-steps");
        let report = execute(&plan, &intent, &AwsSteps::new(aws), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.status == StepStatus::Succeeded));
        assert_eq!(report.resources["bucket/exec-all-steps"]["region"], "us-east-1");

        let seen = http.seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(method, _)| method == "PUT"));
        assert!(seen[1].1.contains("versioning"));
        assert!(seen[3].1.contains("publicAccessBlock"));
    }

    #[tokio::test]
    async fn test_failed_required_step_is_reported() {
        let (aws, _) = aws_over(|_, url| {
            if url.contains("encryption") {
                HttpResponse::new(
                    403,
                    "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
                )
            } else {
                HttpResponse::new(200, "")
            }
        });
        let (plan, intent) = bucket_plan("exec-partial");
        let report = execute(&plan, &intent, &AwsSteps::new(aws), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.outcome("enable-encryption").unwrap().status, StepStatus::Failed);
        assert_eq!(
            report.outcome("block-public-access").unwrap().status,
            StepStatus::Succeeded
        );
        let err = report.into_result().unwrap_err();
        assert_eq!(err.remote_code(), Some("AccessDenied"));
    }

    /// Fails the steps whose ids are listed
    struct Scripted(Vec<&'static str>);

    #[async_trait]
    impl StepHandler for Scripted {
        async fn run(&self, step: &Step, ctx: &mut StepContext, _token: &CancellationToken) -> Result<()> {
            if self.0.iter().any(|id| *id == step.id) {
                return Err(SkyError::invalid_input(format!("{} broke", step.id)));
            }
            ctx.outputs.insert(step.id.clone(), "done".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dependents_of_failed_step_are_skipped() {
        let intent = Intent::parse(&["function", "worker", "layer=./deps"]).unwrap();
        let plan = skyplan_planner::plan(&intent).unwrap();
        let report = execute(&plan, &intent, &Scripted(vec!["build-layer"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome("create-role").unwrap().status, StepStatus::Succeeded);
        assert_eq!(report.outcome("build-layer").unwrap().status, StepStatus::Failed);
        let skipped = report.outcome("create-function").unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.detail.as_deref(), Some("'build-layer' failed"));
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_fail_the_run() {
        let intent = Intent::parse(&["static-site", "docs-site"]).unwrap();
        let plan = skyplan_planner::plan(&intent).unwrap();
        let report = execute(
            &plan,
            &intent,
            &Scripted(vec!["create-distribution"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.outcome("create-distribution").unwrap().status,
            StepStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let (plan, intent) = bucket_plan("exec-cancelled");
        let token = CancellationToken::new();
        token.cancel();
        let report = execute(&plan, &intent, &Scripted(vec![]), &token).await.unwrap();
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.status == StepStatus::Skipped));
        assert!(matches!(report.into_result(), Err(SkyError::Cancelled)));
    }

    #[derive(Default)]
    struct MemoryStore {
        doc: Mutex<Option<StateDocument>>,
        locked: Mutex<bool>,
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn read(&self, _key: &str) -> Result<StateDocument> {
            Ok(self.doc.lock().clone().unwrap_or_else(StateDocument::empty))
        }

        async fn write(&self, _key: &str, doc: &mut StateDocument) -> Result<()> {
            *self.doc.lock() = Some(doc.clone());
            Ok(())
        }

        async fn lock(&self, key: &str) -> Result<()> {
            let mut locked = self.locked.lock();
            if *locked {
                return Err(SkyError::StateLocked {
                    key: key.to_string(),
                    locked_by: "someone".to_string(),
                });
            }
            *locked = true;
            Ok(())
        }

        async fn unlock(&self, _key: &str) -> Result<()> {
            *self.locked.lock() = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persist_merges_and_unlocks() {
        let store = MemoryStore::default();
        let (plan, intent) = bucket_plan("exec-persist");
        let report = execute(&plan, &intent, &Scripted(vec![]), &CancellationToken::new())
            .await
            .unwrap();
        persist(&store, "skyplan.tfstate.json", &report).await.unwrap();

        let doc = store.doc.lock().clone().unwrap();
        assert_eq!(doc.outputs["create-bucket"], json!("done"));
        assert!(!*store.locked.lock());
    }
}
