// Command-line surface

use clap::{Parser, Subcommand, ValueEnum};
use skyplan_core::ProviderKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "skyplan",
    version,
    about = "Turn short intents like 'bucket my-data' into reviewed plans and provisioned AWS resources",
    long_about = None
)]
pub struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// AWS region (overrides config and environment)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Cloud provider
    #[arg(long, global = true, default_value = "aws")]
    pub provider: ProviderKind,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the plan for an intent without changing anything
    Plan {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,

        /// Probe AWS and plan an adoption when the resource already exists
        #[arg(long)]
        check_existing: bool,

        /// Intent, e.g. `bucket my-data versioning=false`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        intent: Vec<String>,
    },

    /// Plan, confirm and provision an intent
    Deploy {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Intent, e.g. `function api --runtime python3.11 code=build/api.zip`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        intent: Vec<String>,
    },

    /// Bucket maintenance
    Bucket {
        #[command(subcommand)]
        action: BucketCommand,
    },

    /// Image alias resolution
    Ami {
        #[command(subcommand)]
        action: AmiCommand,
    },

    /// Lambda dependency layers
    Layer {
        #[command(subcommand)]
        action: LayerCommand,
    },

    /// Remote state
    State {
        #[command(subcommand)]
        action: StateCommand,
    },

    /// Save credentials for later runs
    Configure {
        #[arg(long)]
        access_key_id: Option<String>,

        #[arg(long)]
        secret_access_key: Option<String>,

        #[arg(long)]
        session_token: Option<String>,
    },

    /// Show the identity behind the current credentials
    Whoami,
}

#[derive(Subcommand)]
pub enum BucketCommand {
    /// Delete every object in a bucket
    Empty {
        bucket: String,

        /// Also delete noncurrent versions and delete markers
        #[arg(long)]
        force: bool,
    },

    /// Delete a bucket, emptying it first if needed
    Delete { bucket: String },

    /// Copy every object into another bucket, possibly in another region
    Copy {
        source: String,
        destination: String,

        /// Region of the destination bucket (defaults to the configured region)
        #[arg(long)]
        destination_region: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AmiCommand {
    /// Resolve an alias such as ubuntu-lts or amazon-linux to an image id
    Resolve { alias: String },

    /// Show cache statistics
    Cache {
        /// Drop every cached entry
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
pub enum LayerCommand {
    /// Build (or reuse) the dependency archive for a source directory
    Build {
        name: String,

        #[arg(long, default_value = "python3.11")]
        runtime: String,

        /// Directory holding the dependency manifest
        #[arg(long, default_value = ".")]
        src: PathBuf,

        /// Publish the archive as a new layer version
        #[arg(long)]
        publish: bool,
    },

    /// Remove archives older than the configured max age
    Clean,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// Create the versioned state bucket
    Init,

    /// Print a state document
    Show {
        #[arg(long)]
        key: Option<String>,
    },

    /// List objects in the state bucket
    List,

    /// Take the lock for a state key
    Lock { key: Option<String> },

    /// Release the lock for a state key
    Unlock { key: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_intent_keeps_its_flags() {
        let cli = Cli::try_parse_from([
            "skyplan",
            "--region",
            "eu-west-1",
            "plan",
            "--output",
            "json",
            "function",
            "api",
            "--runtime",
            "nodejs20.x",
        ])
        .unwrap();
        assert_eq!(cli.region.as_deref(), Some("eu-west-1"));
        assert_eq!(cli.provider, ProviderKind::Aws);
        match cli.command {
            Command::Plan { output, intent, .. } => {
                assert_eq!(output, OutputFormat::Json);
                assert_eq!(intent, vec!["function", "api", "--runtime", "nodejs20.x"]);
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(Cli::try_parse_from(["skyplan", "--provider", "gcp", "whoami"]).is_err());
    }

    #[test]
    fn test_bucket_copy_args() {
        let cli = Cli::try_parse_from([
            "skyplan",
            "bucket",
            "copy",
            "src-bucket",
            "dst-bucket",
            "--destination-region",
            "eu-west-1",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Bucket {
                action: BucketCommand::Copy { .. }
            }
        ));
    }
}
