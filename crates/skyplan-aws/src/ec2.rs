//! Compute and network create paths

use crate::ami::AmiResolver;
use crate::client::{ApiRequest, SigningClient};
use crate::xml;
use base64::Engine;
use serde::Serialize;
use skyplan_config::AmiConfig;
use skyplan_core::{Result, SkyError};
use tracing::info;

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    /// Image alias (`ubuntu-lts`) or explicit `ami-` id
    pub image: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub user_data: Option<String>,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            instance_type: "t3.micro".to_string(),
            subnet_id: None,
            key_name: None,
            security_group_ids: Vec::new(),
            user_data: None,
        }
    }

    pub fn instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    pub fn subnet(mut self, subnet_id: impl Into<String>) -> Self {
        self.subnet_id = Some(subnet_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub instance_id: String,
    pub image_id: String,
    pub instance_type: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub internet_gateway_id: String,
}

fn name_tag(request: ApiRequest, resource_type: &str, name: &str) -> ApiRequest {
    request
        .query("TagSpecification.1.ResourceType", resource_type)
        .query("TagSpecification.1.Tag.1.Key", "Name")
        .query("TagSpecification.1.Tag.1.Value", name)
}

fn required(body: &str, tag: &str, action: &str) -> Result<String> {
    xml::first_text(body, tag)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SkyError::Serialization(format!("{} response has no {}", action, tag)))
}

#[derive(Clone)]
pub struct Ec2Service {
    client: SigningClient,
    images: AmiResolver,
}

impl Ec2Service {
    pub fn new(client: SigningClient, ami: &AmiConfig) -> Self {
        Self {
            images: AmiResolver::new(client.clone(), ami),
            client,
        }
    }

    pub fn with_resolver(mut self, images: AmiResolver) -> Self {
        self.images = images;
        self
    }

    pub fn images(&self) -> &AmiResolver {
        &self.images
    }

    /// Resolve the image alias, then RunInstances for a single tagged instance
    pub async fn run_instance(&self, config: &InstanceConfig) -> Result<Instance> {
        let image_id = self.images.resolve(&config.image).await?;

        let mut request = ApiRequest::action("ec2", "RunInstances")
            .query("ImageId", image_id.as_str())
            .query("InstanceType", config.instance_type.as_str())
            .query("MinCount", "1")
            .query("MaxCount", "1");
        if let Some(subnet) = &config.subnet_id {
            request = request.query("SubnetId", subnet.as_str());
        }
        if let Some(key) = &config.key_name {
            request = request.query("KeyName", key.as_str());
        }
        for (i, group) in config.security_group_ids.iter().enumerate() {
            request = request.query(format!("SecurityGroupId.{}", i + 1), group.as_str());
        }
        if let Some(user_data) = &config.user_data {
            request = request.query(
                "UserData",
                base64::engine::general_purpose::STANDARD.encode(user_data),
            );
        }
        let request = name_tag(request, "instance", &config.name);

        let body = self.client.request(request).await?.body_text();
        let instance = Instance {
            instance_id: required(&body, "instanceId", "RunInstances")?,
            image_id,
            instance_type: config.instance_type.clone(),
            state: xml::first_text(&body, "name").unwrap_or_else(|| "pending".to_string()),
        };
        info!(instance = %instance.instance_id, image = %instance.image_id, "Launched instance");
        Ok(instance)
    }

    pub async fn create_vpc(&self, name: &str, cidr: &str) -> Result<String> {
        let request = name_tag(
            ApiRequest::action("ec2", "CreateVpc").query("CidrBlock", cidr),
            "vpc",
            name,
        );
        let body = self.client.request(request).await?.body_text();
        let vpc_id = required(&body, "vpcId", "CreateVpc")?;
        info!(vpc = %vpc_id, cidr = %cidr, "Created VPC");
        Ok(vpc_id)
    }

    pub async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: Option<&str>,
    ) -> Result<String> {
        let mut request = ApiRequest::action("ec2", "CreateSubnet")
            .query("VpcId", vpc_id)
            .query("CidrBlock", cidr);
        if let Some(zone) = availability_zone {
            request = request.query("AvailabilityZone", zone);
        }
        let body = self.client.request(request).await?.body_text();
        required(&body, "subnetId", "CreateSubnet")
    }

    /// Create an internet gateway and attach it to `vpc_id`
    pub async fn create_internet_gateway(&self, vpc_id: &str) -> Result<String> {
        let body = self
            .client
            .request(ApiRequest::action("ec2", "CreateInternetGateway"))
            .await?
            .body_text();
        let gateway_id = required(&body, "internetGatewayId", "CreateInternetGateway")?;
        self.client
            .request(
                ApiRequest::action("ec2", "AttachInternetGateway")
                    .query("InternetGatewayId", gateway_id.as_str())
                    .query("VpcId", vpc_id),
            )
            .await?;
        Ok(gateway_id)
    }

    /// VPC, two subnets and an attached internet gateway
    pub async fn create_network(&self, name: &str, cidr: &str) -> Result<Network> {
        let vpc_id = self.create_vpc(name, cidr).await?;
        let mut subnet_ids = Vec::new();
        for subnet_cidr in subnet_cidrs(cidr)? {
            subnet_ids.push(self.create_subnet(&vpc_id, &subnet_cidr, None).await?);
        }
        let internet_gateway_id = self.create_internet_gateway(&vpc_id).await?;
        Ok(Network {
            vpc_id,
            subnet_ids,
            internet_gateway_id,
        })
    }

    /// Security group open to the world on `ports` (tcp)
    pub async fn create_security_group(
        &self,
        name: &str,
        vpc_id: Option<&str>,
        ports: &[u16],
    ) -> Result<String> {
        let mut request = ApiRequest::action("ec2", "CreateSecurityGroup")
            .query("GroupName", name)
            .query("GroupDescription", format!("skyplan {}", name));
        if let Some(vpc_id) = vpc_id {
            request = request.query("VpcId", vpc_id);
        }
        let body = self.client.request(request).await?.body_text();
        let group_id = required(&body, "groupId", "CreateSecurityGroup")?;

        if !ports.is_empty() {
            let mut ingress = ApiRequest::action("ec2", "AuthorizeSecurityGroupIngress")
                .query("GroupId", group_id.as_str());
            for (i, port) in ports.iter().enumerate() {
                let prefix = format!("IpPermissions.{}", i + 1);
                ingress = ingress
                    .query(format!("{}.IpProtocol", prefix), "tcp")
                    .query(format!("{}.FromPort", prefix), port.to_string())
                    .query(format!("{}.ToPort", prefix), port.to_string())
                    .query(format!("{}.IpRanges.1.CidrIp", prefix), "0.0.0.0/0");
            }
            self.client.request(ingress).await?;
        }
        info!(group = %group_id, ?ports, "Created security group");
        Ok(group_id)
    }

    /// Id of the VPC tagged `Name=name`
    pub async fn find_vpc(&self, name: &str) -> Result<Option<String>> {
        let body = self
            .client
            .request(
                ApiRequest::action("ec2", "DescribeVpcs")
                    .query("Filter.1.Name", "tag:Name")
                    .query("Filter.1.Value.1", name),
            )
            .await?
            .body_text();
        Ok(xml::first_text(&body, "vpcId"))
    }

    /// Id of a live instance tagged `Name=name`
    pub async fn find_instance(&self, name: &str) -> Result<Option<String>> {
        let body = self
            .client
            .request(
                ApiRequest::action("ec2", "DescribeInstances")
                    .query("Filter.1.Name", "tag:Name")
                    .query("Filter.1.Value.1", name)
                    .query("Filter.2.Name", "instance-state-name")
                    .query("Filter.2.Value.1", "pending")
                    .query("Filter.2.Value.2", "running"),
            )
            .await?
            .body_text();
        Ok(xml::first_text(&body, "instanceId"))
    }
}

/// Two `/24` subnets at the start of a `/16` block (`10.0.0.0/16` gives `10.0.1.0/24`, `10.0.2.0/24`)
pub fn subnet_cidrs(cidr: &str) -> Result<Vec<String>> {
    let invalid = || SkyError::invalid_input(format!("expected an a.b.0.0/16 CIDR block, got '{}'", cidr));
    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    if prefix != "16" {
        return Err(invalid());
    }
    let octets: Vec<u8> = address
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;
    if octets.len() != 4 {
        return Err(invalid());
    }
    Ok((1..=2)
        .map(|i| format!("{}.{}.{}.0/24", octets[0], octets[1], i))
        .collect())
}
