//! Adoption plans for resources that already exist

use crate::cost;
use crate::templates::action_seconds;
use skyplan_core::{Intent, IntentKind, Plan, PlanBuilder, Result, Step};

pub const ANALYZE: &str = "analyze";
pub const IMPORT: &str = "import";
pub const APPLY_BEST_PRACTICES: &str = "apply-best-practices";

/// Read-only calls the analyze step makes
fn inspect_actions(kind: IntentKind) -> &'static [&'static str] {
    match kind {
        IntentKind::Bucket | IntentKind::StaticSite => &[
            "s3:GetBucketLocation",
            "s3:GetBucketVersioning",
            "s3:GetEncryptionConfiguration",
            "s3:GetBucketPublicAccessBlock",
        ],
        IntentKind::Network => &["ec2:DescribeVpcs", "ec2:DescribeSubnets"],
        IntentKind::Function | IntentKind::Api => &["lambda:GetFunction", "iam:GetRole"],
        IntentKind::Database => &["rds:DescribeDBInstances"],
        IntentKind::Webapp => &["ec2:DescribeInstances", "ec2:DescribeSecurityGroups"],
    }
}

fn hardening_actions(kind: IntentKind) -> &'static [&'static str] {
    match kind {
        IntentKind::Bucket => &[
            "s3:PutBucketVersioning",
            "s3:PutBucketEncryption",
            "s3:PutBucketPublicAccessBlock",
        ],
        IntentKind::StaticSite => &["s3:PutBucketEncryption"],
        IntentKind::Network => &["ec2:CreateFlowLogs"],
        IntentKind::Function | IntentKind::Api => &["lambda:PutFunctionConcurrency"],
        IntentKind::Database => &["rds:ModifyDBInstance"],
        IntentKind::Webapp => &["ec2:ModifyInstanceMetadataOptions"],
    }
}

/// Analyze, import into state, then (optionally) harden the existing resource
pub fn plan(intent: &Intent) -> Result<Plan> {
    let title = format!("Adopt {} '{}'", intent.kind.display_name(), intent.name);
    let mut builder = PlanBuilder::new(intent.kind, &intent.name, title).adoption();
    builder
        .push(
            Step::new(
                ANALYZE,
                ANALYZE,
                &intent.name,
                format!("Inspect the existing {}", intent.kind.display_name()),
            )
            .iam(inspect_actions(intent.kind)),
        )?
        .push(
            Step::new(IMPORT, IMPORT, &intent.name, "Record the resource in state")
                .reason("Later deploys manage it instead of recreating it")
                .iam(&["s3:GetObject", "s3:PutObject"])
                .after(&[ANALYZE]),
        )?
        .push(
            Step::new(
                APPLY_BEST_PRACTICES,
                APPLY_BEST_PRACTICES,
                &intent.name,
                "Apply recommended settings the resource is missing",
            )
            .iam(hardening_actions(intent.kind))
            .after(&[IMPORT])
            .optional(),
        )?;

    let duration = 3 * action_seconds(ANALYZE);
    Ok(builder.build(cost::estimate(intent)?, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adoption_steps() {
        let intent = Intent::new(IntentKind::Bucket, "existing-data");
        let plan = plan(&intent).unwrap();
        assert!(plan.adoption);
        assert_eq!(plan.title, "Adopt S3 Bucket 'existing-data'");
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["analyze", "import", "apply-best-practices"]);
        assert!(plan.step(APPLY_BEST_PRACTICES).unwrap().optional);
        assert!(!plan.step(IMPORT).unwrap().optional);
        assert_eq!(plan.permissions.actions[0], "s3:GetBucketLocation");
        plan.validate().unwrap();
    }
}
