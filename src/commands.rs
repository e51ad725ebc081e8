// Verb implementations
//
// Every command returns anyhow::Result; library errors keep their SkyError inside
// the chain so main can map them to exit codes.

use crate::cli::{AmiCommand, BucketCommand, Command, LayerCommand, OutputFormat, StateCommand};
use crate::execute::{self, AwsSteps, StepStatus};
use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Password};
use skyplan_aws::{AwsProvider, CopyProgress, CopyStatus, CredentialStore, Credentials};
use skyplan_config::RuntimeConfig;
use skyplan_core::{Intent, ProviderKind, StateStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub async fn run(
    command: Command,
    provider: ProviderKind,
    config: RuntimeConfig,
    token: CancellationToken,
) -> Result<()> {
    match provider {
        ProviderKind::Aws => debug!(region = %config.aws.region, "Using the AWS provider"),
    }
    match command {
        Command::Plan {
            output,
            check_existing,
            intent,
        } => plan(&config, &intent, output, check_existing).await,
        Command::Deploy { yes, intent } => deploy(&config, &intent, yes, &token).await,
        Command::Bucket { action } => bucket(&config, action, &token).await,
        Command::Ami { action } => ami(&config, action).await,
        Command::Layer { action } => layer(&config, action).await,
        Command::State { action } => state(&config, action).await,
        Command::Configure {
            access_key_id,
            secret_access_key,
            session_token,
        } => configure(&config, access_key_id, secret_access_key, session_token),
        Command::Whoami => whoami(&config).await,
    }
}

fn provider(config: &RuntimeConfig) -> Result<AwsProvider> {
    AwsProvider::from_config(config).context("Failed to set up the AWS client")
}

async fn plan(
    config: &RuntimeConfig,
    tokens: &[String],
    output: OutputFormat,
    check_existing: bool,
) -> Result<()> {
    let intent = Intent::parse(tokens)?;
    let plan = if check_existing {
        skyplan_planner::plan_with_probe(&intent, &provider(config)?).await?
    } else {
        skyplan_planner::plan(&intent)?
    };

    match output {
        OutputFormat::Text => print!("{}", skyplan_planner::render(&plan)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
    }
    Ok(())
}

async fn deploy(
    config: &RuntimeConfig,
    tokens: &[String],
    yes: bool,
    token: &CancellationToken,
) -> Result<()> {
    let intent = Intent::parse(tokens)?;
    let aws = provider(config)?;
    let plan = skyplan_planner::plan_with_probe(&intent, &aws).await?;
    print!("{}", skyplan_planner::render(&plan));
    println!();

    if !yes {
        let proceed = Confirm::new()
            .with_prompt("Deploy this plan?")
            .default(false)
            .interact()?;
        if !proceed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let state = aws.state();
    state.init().await.context("Failed to prepare the state bucket")?;

    let report = execute::execute(&plan, &intent, &AwsSteps::new(aws), token).await?;
    execute::persist(&state, &config.state.key, &report)
        .await
        .context("Failed to record deployment state")?;

    println!();
    for outcome in &report.outcomes {
        let mark = match outcome.status {
            StepStatus::Succeeded => "ok  ",
            StepStatus::Failed => "FAIL",
            StepStatus::Skipped => "skip",
        };
        match &outcome.detail {
            Some(detail) => println!("  [{}] {} ({})", mark, outcome.id, detail),
            None => println!("  [{}] {}", mark, outcome.id),
        }
    }
    for (key, value) in &report.outputs {
        println!("  {} = {}", key, value);
    }

    let report = report.into_result()?;
    info!(plan = %report.plan_id, "Deployment complete");
    Ok(())
}

async fn bucket(config: &RuntimeConfig, action: BucketCommand, token: &CancellationToken) -> Result<()> {
    let aws = provider(config)?;
    let s3 = aws.s3();
    match action {
        BucketCommand::Empty { bucket, force } => {
            let report = s3.empty_bucket(&bucket, force, token).await?;
            println!(
                "Emptied {}: {} objects, {} versions and delete markers",
                bucket, report.objects_deleted, report.versions_deleted
            );
        }
        BucketCommand::Delete { bucket } => {
            s3.delete_bucket(&bucket, token).await?;
            println!("Deleted {}", bucket);
        }
        BucketCommand::Copy {
            source,
            destination,
            destination_region,
        } => {
            let region = destination_region.unwrap_or_else(|| aws.region().to_string());
            let (tx, mut rx) = mpsc::channel::<CopyProgress>(16);
            let printer = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    match progress.status {
                        CopyStatus::Copying => eprintln!(
                            "  {:>5.1}%  {}/{} objects  {:.1} MiB/s",
                            progress.percent,
                            progress.copied_objects,
                            progress.total_objects,
                            progress.bytes_per_second / (1024.0 * 1024.0)
                        ),
                        status => eprintln!("  {}", status),
                    }
                }
            });
            let result = s3
                .copy_bucket(&source, &destination, &region, Some(tx), token)
                .await;
            let _ = printer.await;
            let report = result?;
            println!(
                "Copied {} objects ({} bytes) to {} in {:.1}s",
                report.copied_objects,
                report.copied_bytes,
                destination,
                report.elapsed.as_secs_f64()
            );
        }
    }
    Ok(())
}

async fn ami(config: &RuntimeConfig, action: AmiCommand) -> Result<()> {
    let resolver = provider(config)?.ami();
    match action {
        AmiCommand::Resolve { alias } => {
            let image = resolver.lookup(&alias).await?;
            let cached = if image.cached { ", cached" } else { "" };
            println!("{} ({}{})", image.image_id, image.source, cached);
        }
        AmiCommand::Cache { clear } => {
            if clear {
                resolver.cache().clear();
            }
            println!("{}", serde_json::to_string_pretty(&resolver.cache().stats())?);
        }
    }
    Ok(())
}

async fn layer(config: &RuntimeConfig, action: LayerCommand) -> Result<()> {
    let aws = provider(config)?;
    let cache = aws.layers();
    match action {
        LayerCommand::Build {
            name,
            runtime,
            src,
            publish,
        } => {
            let layer = cache.build(&name, &runtime, &src).await?;
            let verb = if layer.rebuilt { "Built" } else { "Reused" };
            println!(
                "{} {} ({} bytes, sha256 {})",
                verb,
                layer.path.display(),
                layer.size,
                layer.sha256
            );
            if publish {
                let zip = tokio::fs::read(&layer.path)
                    .await
                    .with_context(|| format!("Failed to read {}", layer.path.display()))?;
                let version = aws
                    .lambda()
                    .publish_layer_version(&name, &format!("{} dependencies", runtime), &zip, &[runtime])
                    .await?;
                println!("Published {}", version.layer_version_arn);
            }
        }
        LayerCommand::Clean => {
            let removed = cache.clean_cache().await?;
            for path in &removed {
                println!("Removed {}", path.display());
            }
            println!("{} archive(s) removed from {}", removed.len(), cache.dir().display());
        }
    }
    Ok(())
}

async fn state(config: &RuntimeConfig, action: StateCommand) -> Result<()> {
    let backend = provider(config)?.state();
    let default_key = || config.state.key.clone();
    match action {
        StateCommand::Init => {
            backend.init().await?;
            println!("State bucket {} ready", backend.bucket());
        }
        StateCommand::Show { key } => {
            let doc = backend.read(&key.unwrap_or_else(default_key)).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        StateCommand::List => {
            for key in backend.list_states().await? {
                println!("{}", key);
            }
        }
        StateCommand::Lock { key } => {
            let key = key.unwrap_or_else(default_key);
            backend.lock(&key).await?;
            println!("Locked {}", key);
        }
        StateCommand::Unlock { key } => {
            let key = key.unwrap_or_else(default_key);
            backend.unlock(&key).await?;
            println!("Unlocked {}", key);
        }
    }
    Ok(())
}

fn configure(
    config: &RuntimeConfig,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
) -> Result<()> {
    let access_key_id = match access_key_id {
        Some(key) => key,
        None => Input::new().with_prompt("Access key id").interact_text()?,
    };
    let secret_access_key = match secret_access_key {
        Some(secret) => secret,
        None => Password::new().with_prompt("Secret access key").interact()?,
    };

    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Some(token) = session_token {
        credentials = credentials.with_session_token(token);
    }
    credentials.region = config.aws.region.clone();

    let store = CredentialStore::from_config(&config.aws);
    let path = store.save(&credentials)?;
    println!("Saved credentials to {}", path.display());
    Ok(())
}

async fn whoami(config: &RuntimeConfig) -> Result<()> {
    let identity = provider(config)?.sts().validate().await?;
    println!("Account: {}", identity.account);
    println!("ARN:     {}", identity.arn);
    println!("User:    {}", identity.user_id);
    Ok(())
}
