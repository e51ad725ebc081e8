//! Per-kind step templates
//!
//! Each template appends its steps in dependency order. Parameter-conditional steps
//! (versioning, CDN, DNS, autoscaling...) are added or left out from the intent's options.

use skyplan_core::{Intent, IntentKind, PlanBuilder, Result, SkyError, Step};

pub const DEFAULT_RUNTIME: &str = "python3.11";
pub const DEFAULT_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_INSTANCE_TYPE: &str = "t3.micro";
pub const DEFAULT_DB_ENGINE: &str = "postgres";
pub const DEFAULT_DB_CLASS: &str = "db.t3.micro";

pub fn add_steps(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    match intent.kind {
        IntentKind::Bucket => bucket(intent, plan),
        IntentKind::Network => network(intent, plan),
        IntentKind::Function => function(intent, plan),
        IntentKind::StaticSite => static_site(intent, plan),
        IntentKind::Database => database(intent, plan),
        IntentKind::Api => api(intent, plan),
        IntentKind::Webapp => webapp(intent, plan),
    }
}

/// Rough seconds an action takes to settle
pub fn action_seconds(action: &str) -> u64 {
    match action {
        "rds:CreateDBInstance" => 600,
        "cloudfront:CreateDistribution" => 900,
        "acm:RequestCertificate" => 120,
        "lambda:PublishLayerVersion" => 120,
        "ec2:RunInstances" | "autoscaling:CreateAutoScalingGroup" => 60,
        "ec2:CreateNatGateway" => 90,
        "lambda:CreateFunction" => 30,
        "iam:CreateRole" => 15,
        "s3:CreateBucket" => 5,
        _ => 3,
    }
}

fn bucket_arn(name: &str) -> String {
    format!("arn:aws:s3:::{}", name)
}

fn bucket(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let arn = bucket_arn(&intent.name);
    plan.push(
        Step::new(
            "create-bucket",
            "s3:CreateBucket",
            &arn,
            format!("Create bucket {}", intent.name),
        )
        .iam(&["s3:CreateBucket"]),
    )?;

    if intent.flag("versioning", true)? {
        plan.push(
            Step::new("enable-versioning", "s3:PutBucketVersioning", &arn, "Enable object versioning")
                .reason("Keeps prior versions recoverable after overwrite or delete")
                .iam(&["s3:PutBucketVersioning"])
                .after(&["create-bucket"]),
        )?;
    }
    if intent.flag("encryption", true)? {
        plan.push(
            Step::new(
                "enable-encryption",
                "s3:PutBucketEncryption",
                &arn,
                "Enable default AES256 encryption",
            )
            .reason("Objects are encrypted at rest without client changes")
            .iam(&["s3:PutBucketEncryption"])
            .after(&["create-bucket"]),
        )?;
    }
    if !intent.flag("public", false)? {
        plan.push(
            Step::new(
                "block-public-access",
                "s3:PutBucketPublicAccessBlock",
                &arn,
                "Block all public access",
            )
            .reason("Prevents accidental exposure through ACLs or policies")
            .iam(&["s3:PutBucketPublicAccessBlock"])
            .after(&["create-bucket"]),
        )?;
    }
    if intent.param("tags").is_some() {
        parse_tags(intent)?;
        plan.push(
            Step::new("tag-bucket", "s3:PutBucketTagging", &arn, "Apply bucket tags")
                .iam(&["s3:PutBucketTagging"])
                .after(&["create-bucket"]),
        )?;
    }
    Ok(())
}

/// `tags=team:data,env:prod`
pub fn parse_tags(intent: &Intent) -> Result<Vec<(String, String)>> {
    let Some(raw) = intent.param("tags") else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            pair.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| {
                    SkyError::invalid_input(format!("tag '{}' must look like key:value", pair))
                })
        })
        .collect()
}

fn network(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let cidr = intent.param("cidr").unwrap_or(DEFAULT_CIDR);
    plan.push(
        Step::new("create-vpc", "ec2:CreateVpc", &intent.name, format!("Create VPC {}", cidr))
            .iam(&["ec2:CreateVpc", "ec2:CreateTags"]),
    )?
    .push(
        Step::new(
            "create-subnets",
            "ec2:CreateSubnet",
            &intent.name,
            "Create two /24 subnets",
        )
        .iam(&["ec2:CreateSubnet"])
        .after(&["create-vpc"]),
    )?
    .push(
        Step::new(
            "create-internet-gateway",
            "ec2:CreateInternetGateway",
            &intent.name,
            "Create and attach an internet gateway",
        )
        .iam(&["ec2:CreateInternetGateway", "ec2:AttachInternetGateway"])
        .after(&["create-vpc"]),
    )?;

    if intent.flag("nat", false)? {
        plan.push(
            Step::new(
                "create-nat-gateway",
                "ec2:CreateNatGateway",
                &intent.name,
                "Create a NAT gateway for private subnets",
            )
            .reason("Private subnets reach the internet without public addresses")
            .iam(&["ec2:AllocateAddress", "ec2:CreateNatGateway"])
            .after(&["create-subnets", "create-internet-gateway"])
            .optional(),
        )?;
    }
    Ok(())
}

fn function(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let runtime = intent.param("runtime").unwrap_or(DEFAULT_RUNTIME);
    let role = format!("{}-role", intent.name);
    function_steps(intent, plan, runtime, &role)?;

    if intent.flag("url", false)? {
        plan.push(
            Step::new(
                "create-function-url",
                "lambda:CreateFunctionUrlConfig",
                &intent.name,
                "Expose an HTTPS function URL",
            )
            .iam(&["lambda:CreateFunctionUrlConfig"])
            .after(&["create-function"])
            .optional(),
        )?;
    }
    Ok(())
}

/// Role, optional dependency layer, then the function itself
fn function_steps(intent: &Intent, plan: &mut PlanBuilder, runtime: &str, role: &str) -> Result<()> {
    plan.push(
        Step::new("create-role", "iam:CreateRole", role, "Create execution role")
            .reason("Lambda assumes this role to write logs and reach other services")
            .iam(&["iam:CreateRole", "iam:AttachRolePolicy", "iam:GetRole"]),
    )?;

    let mut function_deps = vec!["create-role"];
    if intent.param("layer").is_some() {
        plan.push(
            Step::new(
                "build-layer",
                "lambda:PublishLayerVersion",
                format!("{}-deps", intent.name),
                format!("Build and publish the {} dependency layer", runtime),
            )
            .reason("Dependencies are cached by manifest digest and shared across deploys")
            .iam(&["lambda:PublishLayerVersion"]),
        )?;
        function_deps.push("build-layer");
    }

    plan.push(
        Step::new(
            "create-function",
            "lambda:CreateFunction",
            &intent.name,
            format!("Create {} function", runtime),
        )
        .iam(&["lambda:CreateFunction", "iam:PassRole"])
        .after(&function_deps),
    )?;
    Ok(())
}

fn static_site(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let arn = bucket_arn(&intent.name);
    plan.push(
        Step::new(
            "create-bucket",
            "s3:CreateBucket",
            &arn,
            format!("Create bucket {}", intent.name),
        )
        .iam(&["s3:CreateBucket"]),
    )?
    .push(
        Step::new(
            "configure-website",
            "s3:PutBucketWebsite",
            &arn,
            "Serve index.html and error.html",
        )
        .iam(&["s3:PutBucketWebsite"])
        .after(&["create-bucket"]),
    )?
    .push(
        Step::new(
            "allow-public-read",
            "s3:PutBucketPolicy",
            &arn,
            "Allow public reads of site objects",
        )
        .iam(&["s3:PutBucketPolicy"])
        .after(&["configure-website"]),
    )?;

    let domain = intent.param("domain");
    if domain.is_some() && intent.flag("https", true)? {
        plan.push(
            Step::new(
                "request-certificate",
                "acm:RequestCertificate",
                domain.unwrap_or_default(),
                "Request a TLS certificate",
            )
            .iam(&["acm:RequestCertificate"])
            .optional(),
        )?;
    }
    if intent.flag("cdn", true)? {
        let mut step = Step::new(
            "create-distribution",
            "cloudfront:CreateDistribution",
            &intent.name,
            "Put a CDN in front of the bucket",
        )
        .reason("Caches content at the edge and terminates HTTPS")
        .iam(&["cloudfront:CreateDistribution"])
        .after(&["allow-public-read"])
        .optional();
        if plan.contains("request-certificate") {
            step = step.after(&["request-certificate"]);
        }
        plan.push(step)?;
    }
    if let Some(domain) = domain {
        let mut step = Step::new(
            "configure-dns",
            "route53:ChangeResourceRecordSets",
            domain,
            format!("Point {} at the site", domain),
        )
        .iam(&["route53:ChangeResourceRecordSets"])
        .optional();
        if plan.contains("create-distribution") {
            step = step.after(&["create-distribution"]);
        }
        plan.push(step)?;
    }
    Ok(())
}

fn database(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let engine = intent.param("engine").unwrap_or(DEFAULT_DB_ENGINE);
    let class = intent.param("instance_class").unwrap_or(DEFAULT_DB_CLASS);
    plan.push(
        Step::new(
            "create-subnet-group",
            "rds:CreateDBSubnetGroup",
            format!("{}-subnets", intent.name),
            "Create a DB subnet group",
        )
        .iam(&["rds:CreateDBSubnetGroup"]),
    )?
    .push(
        Step::new(
            "create-security-group",
            "ec2:CreateSecurityGroup",
            format!("{}-db", intent.name),
            "Create a security group for database traffic",
        )
        .iam(&["ec2:CreateSecurityGroup", "ec2:AuthorizeSecurityGroupIngress"]),
    )?
    .push(
        Step::new(
            "create-db-instance",
            "rds:CreateDBInstance",
            &intent.name,
            format!("Create {} instance ({})", engine, class),
        )
        .iam(&["rds:CreateDBInstance"])
        .after(&["create-subnet-group", "create-security-group"]),
    )?;

    let retention: u32 = intent.number("backup_days", 7)?;
    if retention > 0 {
        plan.push(
            Step::new(
                "enable-backups",
                "rds:ModifyDBInstance",
                &intent.name,
                format!("Keep automated backups for {} days", retention),
            )
            .reason("Point-in-time recovery within the retention window")
            .iam(&["rds:ModifyDBInstance"])
            .after(&["create-db-instance"])
            .optional(),
        )?;
    }
    Ok(())
}

fn api(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let runtime = intent.param("runtime").unwrap_or(DEFAULT_RUNTIME);
    let role = format!("{}-role", intent.name);
    function_steps(intent, plan, runtime, &role)?;

    plan.push(
        Step::new("create-api", "apigateway:CreateApi", &intent.name, "Create an HTTP API")
            .iam(&["apigateway:POST"])
            .after(&["create-function"]),
    )?
    .push(
        Step::new(
            "create-integration",
            "apigateway:CreateIntegration",
            &intent.name,
            "Route all paths to the function",
        )
        .iam(&["apigateway:POST", "lambda:AddPermission"])
        .after(&["create-api"]),
    )?;

    if let Some(domain) = intent.param("domain") {
        plan.push(
            Step::new(
                "create-domain",
                "apigateway:CreateDomainName",
                domain,
                format!("Serve the API at {}", domain),
            )
            .iam(&["apigateway:POST", "acm:RequestCertificate"])
            .after(&["create-integration"])
            .optional(),
        )?;
    }
    Ok(())
}

fn webapp(intent: &Intent, plan: &mut PlanBuilder) -> Result<()> {
    let instance_type = intent.param("instance_type").unwrap_or(DEFAULT_INSTANCE_TYPE);
    let image = intent.param("image").unwrap_or("ubuntu-lts");
    plan.push(
        Step::new(
            "create-security-group",
            "ec2:CreateSecurityGroup",
            format!("{}-web", intent.name),
            "Allow HTTP and HTTPS",
        )
        .iam(&["ec2:CreateSecurityGroup", "ec2:AuthorizeSecurityGroupIngress"]),
    )?
    .push(
        Step::new(
            "launch-instance",
            "ec2:RunInstances",
            &intent.name,
            format!("Launch {} from {}", instance_type, image),
        )
        .reason("The image alias is resolved to the newest regional image at deploy time")
        .iam(&["ec2:RunInstances", "ec2:DescribeImages", "ssm:GetParameter", "ec2:CreateTags"])
        .after(&["create-security-group"]),
    )?;

    if intent.flag("autoscaling", false)? {
        plan.push(
            Step::new(
                "create-launch-template",
                "ec2:CreateLaunchTemplate",
                &intent.name,
                "Capture the instance configuration",
            )
            .iam(&["ec2:CreateLaunchTemplate"])
            .after(&["launch-instance"])
            .optional(),
        )?
        .push(
            Step::new(
                "create-autoscaling-group",
                "autoscaling:CreateAutoScalingGroup",
                &intent.name,
                format!(
                    "Scale between {} and {} instances",
                    intent.number::<u32>("min", 1)?,
                    intent.number::<u32>("max", 3)?
                ),
            )
            .iam(&["autoscaling:CreateAutoScalingGroup"])
            .after(&["create-launch-template"])
            .optional(),
        )?;
    }
    if intent.flag("https", false)? || intent.param("domain").is_some() {
        plan.push(
            Step::new(
                "create-load-balancer",
                "elasticloadbalancing:CreateLoadBalancer",
                &intent.name,
                "Terminate HTTPS on an application load balancer",
            )
            .iam(&[
                "elasticloadbalancing:CreateLoadBalancer",
                "acm:RequestCertificate",
            ])
            .after(&["launch-instance"])
            .optional(),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(intent: &Intent) -> Vec<String> {
        let mut plan = PlanBuilder::new(intent.kind, &intent.name, "t");
        add_steps(intent, &mut plan).unwrap();
        plan.build(
            skyplan_core::CostEstimate {
                currency: "USD".into(),
                monthly: 0.0,
                breakdown: vec![],
            },
            0,
        )
        .steps
        .into_iter()
        .map(|s| s.id)
        .collect()
    }

    #[test]
    fn test_bucket_conditionals() {
        let intent = Intent::parse(&["bucket", "logs", "versioning=false", "--public"]).unwrap();
        assert_eq!(ids(&intent), vec!["create-bucket", "enable-encryption"]);

        let intent = Intent::parse(&["bucket", "logs", "tags=team:data,env:prod"]).unwrap();
        assert!(ids(&intent).contains(&"tag-bucket".to_string()));
        assert_eq!(
            parse_tags(&intent).unwrap(),
            vec![
                ("team".to_string(), "data".to_string()),
                ("env".to_string(), "prod".to_string())
            ]
        );
    }

    #[test]
    fn test_bad_tags_rejected() {
        let intent = Intent::parse(&["bucket", "logs", "tags=oops"]).unwrap();
        let mut plan = PlanBuilder::new(intent.kind, &intent.name, "t");
        assert!(add_steps(&intent, &mut plan).is_err());
    }

    #[test]
    fn test_function_layer_precedes_function() {
        let intent =
            Intent::parse(&["function", "api", "--runtime", "nodejs20.x", "layer=./deps"]).unwrap();
        assert_eq!(ids(&intent), vec!["create-role", "build-layer", "create-function"]);
    }

    #[test]
    fn test_static_site_dns_chain() {
        let intent = Intent::parse(&["static-site", "docs-site", "domain=docs.example.com"]).unwrap();
        assert_eq!(
            ids(&intent),
            vec![
                "create-bucket",
                "configure-website",
                "allow-public-read",
                "request-certificate",
                "create-distribution",
                "configure-dns"
            ]
        );

        let intent = Intent::parse(&["static-site", "docs-site", "cdn=false"]).unwrap();
        assert_eq!(ids(&intent).len(), 3);
    }

    #[test]
    fn test_webapp_autoscaling() {
        let intent = Intent::parse(&["webapp", "shop", "--autoscaling", "max=5"]).unwrap();
        let ids = ids(&intent);
        assert_eq!(ids[1], "launch-instance");
        assert!(ids.contains(&"create-autoscaling-group".to_string()));
        assert!(!ids.contains(&"create-load-balancer".to_string()));
    }

    #[test]
    fn test_database_without_backups() {
        let intent = Intent::parse(&["database", "orders", "backup_days=0"]).unwrap();
        assert_eq!(
            ids(&intent),
            vec!["create-subnet-group", "create-security-group", "create-db-instance"]
        );
    }

    #[test]
    fn test_invalid_flag_value() {
        let intent = Intent::parse(&["network", "core", "nat=maybe"]).unwrap();
        let mut plan = PlanBuilder::new(intent.kind, &intent.name, "t");
        assert!(add_steps(&intent, &mut plan).is_err());
    }
}
