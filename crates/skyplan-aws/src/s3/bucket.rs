use super::S3Service;
use crate::client::{api_error, ApiRequest};
use crate::xml::{self, escape};
use skyplan_core::validation::validate_bucket_name;
use skyplan_core::{Result, SkyError};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

impl S3Service {
    /// CreateBucket in `region`, with a LocationConstraint outside us-east-1
    pub async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        validate_bucket_name(bucket)?;
        let mut request = ApiRequest::put("s3", format!("/{}", bucket)).region(region);
        if region != "us-east-1" {
            request = request.body(format!(
                "<CreateBucketConfiguration xmlns=\"{}\"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                S3_XMLNS,
                escape(region)
            ));
        }
        self.client.request(request).await?;
        self.regions.insert(bucket, region);
        info!(bucket = %bucket, region = %region, "Created bucket");
        Ok(())
    }

    /// HEAD the bucket; 403 and region redirects still mean it exists
    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let response = self
            .client
            .send(ApiRequest::head("s3", format!("/{}", bucket)))
            .await?;
        match response.status {
            200..=299 => Ok(true),
            404 => Ok(false),
            301 | 400 | 403 => {
                if let Some(region) = response.header("x-amz-bucket-region") {
                    self.regions.insert(bucket, region);
                }
                Ok(true)
            }
            _ => Err(api_error("s3", &response)),
        }
    }

    pub async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> Result<()> {
        let status = if enabled { "Enabled" } else { "Suspended" };
        self.put_subresource(
            bucket,
            "versioning",
            format!(
                "<VersioningConfiguration xmlns=\"{}\"><Status>{}</Status></VersioningConfiguration>",
                S3_XMLNS, status
            ),
            false,
        )
        .await
    }

    /// Default SSE-S3 (AES256) encryption
    pub async fn put_bucket_encryption(&self, bucket: &str) -> Result<()> {
        self.put_subresource(
            bucket,
            "encryption",
            format!(
                "<ServerSideEncryptionConfiguration xmlns=\"{}\"><Rule><ApplyServerSideEncryptionByDefault>\
                 <SSEAlgorithm>AES256</SSEAlgorithm></ApplyServerSideEncryptionByDefault>\
                 <BucketKeyEnabled>true</BucketKeyEnabled></Rule></ServerSideEncryptionConfiguration>",
                S3_XMLNS
            ),
            true,
        )
        .await
    }

    /// Block every form of public access
    pub async fn put_public_access_block(&self, bucket: &str) -> Result<()> {
        self.put_subresource(
            bucket,
            "publicAccessBlock",
            format!(
                "<PublicAccessBlockConfiguration xmlns=\"{}\">\
                 <BlockPublicAcls>true</BlockPublicAcls><IgnorePublicAcls>true</IgnorePublicAcls>\
                 <BlockPublicPolicy>true</BlockPublicPolicy><RestrictPublicBuckets>true</RestrictPublicBuckets>\
                 </PublicAccessBlockConfiguration>",
                S3_XMLNS
            ),
            true,
        )
        .await
    }

    pub async fn put_bucket_tagging(
        &self,
        bucket: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let tag_set: String = tags
            .iter()
            .map(|(k, v)| format!("<Tag><Key>{}</Key><Value>{}</Value></Tag>", escape(k), escape(v)))
            .collect();
        self.put_subresource(
            bucket,
            "tagging",
            format!("<Tagging xmlns=\"{}\"><TagSet>{}</TagSet></Tagging>", S3_XMLNS, tag_set),
            true,
        )
        .await
    }

    pub async fn put_bucket_website(
        &self,
        bucket: &str,
        index_document: &str,
        error_document: &str,
    ) -> Result<()> {
        self.put_subresource(
            bucket,
            "website",
            format!(
                "<WebsiteConfiguration xmlns=\"{}\"><IndexDocument><Suffix>{}</Suffix></IndexDocument>\
                 <ErrorDocument><Key>{}</Key></ErrorDocument></WebsiteConfiguration>",
                S3_XMLNS,
                escape(index_document),
                escape(error_document)
            ),
            false,
        )
        .await
    }

    pub async fn put_bucket_policy(&self, bucket: &str, policy: &serde_json::Value) -> Result<()> {
        let client = self.client_for(bucket).await?;
        client
            .request(
                ApiRequest::put("s3", format!("/{}", bucket))
                    .query("policy", "")
                    .body(policy.to_string())
                    .content_type("application/json"),
            )
            .await?;
        Ok(())
    }

    async fn put_subresource(
        &self,
        bucket: &str,
        subresource: &str,
        body: String,
        include_md5: bool,
    ) -> Result<()> {
        let client = self.client_for(bucket).await?;
        let mut request = ApiRequest::put("s3", format!("/{}", bucket))
            .query(subresource, "")
            .body(body);
        if include_md5 {
            request = request.with_md5();
        }
        client.request(request).await?;
        Ok(())
    }

    /// Names of buckets owned by the caller
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self.client.request(ApiRequest::get("s3", "/")).await?;
        Ok(xml::all_texts(&response.body_text(), "Name"))
    }

    /// DeleteBucket; a BucketNotEmpty conflict empties the bucket (all versions) and retries once
    #[instrument(skip(self, token))]
    pub async fn delete_bucket(&self, bucket: &str, token: &CancellationToken) -> Result<()> {
        let client = self.client_for(bucket).await?;
        let request = ApiRequest::delete("s3", format!("/{}", bucket));

        let response = client.send(request.clone()).await?;
        if response.is_success() {
            self.regions.remove(bucket);
            info!(bucket = %bucket, "Deleted bucket");
            return Ok(());
        }

        let err = api_error("s3", &response);
        if response.status != 409 || err.remote_code() != Some("BucketNotEmpty") {
            return Err(err);
        }

        info!(bucket = %bucket, "Bucket not empty; emptying before retry");
        self.empty_bucket(bucket, true, token).await?;

        let response = client.send(request).await?;
        if !response.is_success() {
            return Err(api_error("s3", &response));
        }
        self.regions.remove(bucket);
        info!(bucket = %bucket, "Deleted bucket");
        Ok(())
    }

    /// Create `bucket` unless it is already there and ours
    pub(crate) async fn ensure_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        match self.create_bucket(bucket, region).await {
            Ok(()) => Ok(()),
            Err(SkyError::RemoteApi { code, .. })
                if code == "BucketAlreadyOwnedByYou" || code == "BucketAlreadyExists" =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
