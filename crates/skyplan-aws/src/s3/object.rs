use super::encoding::{encode_key, object_path};
use super::types::{ListBucketResult, ListVersionsResult, ObjectMeta, ObjectSummary};
use super::S3Service;
use crate::client::{api_error, ApiRequest};
use crate::xml;
use skyplan_core::Result;

impl S3Service {
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let client = self.client_for(bucket).await?;
        client
            .request(
                ApiRequest::put("s3", object_path(bucket, key))
                    .body(body)
                    .content_type(content_type),
            )
            .await?;
        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let client = self.client_for(bucket).await?;
        let response = client
            .request(ApiRequest::get("s3", object_path(bucket, key)))
            .await?;
        Ok(response.body)
    }

    /// `None` when the object does not exist
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let client = self.client_for(bucket).await?;
        let response = client
            .send(ApiRequest::head("s3", object_path(bucket, key)))
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(api_error("s3", &response));
        }
        Ok(Some(ObjectMeta {
            size: response
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            etag: response.header("etag").map(str::to_string),
            content_type: response.header("content-type").map(str::to_string),
        }))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let client = self.client_for(bucket).await?;
        client
            .request(ApiRequest::delete("s3", object_path(bucket, key)))
            .await?;
        Ok(())
    }

    /// One ListObjectsV2 page
    pub async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> Result<ListBucketResult> {
        let client = self.client_for(bucket).await?;
        let mut request = ApiRequest::get("s3", format!("/{}", bucket))
            .query("list-type", "2")
            .query("max-keys", max_keys.to_string());
        if !prefix.is_empty() {
            request = request.query("prefix", prefix);
        }
        if let Some(token) = continuation {
            request = request.query("continuation-token", token);
        }
        let response = client.request(request).await?;
        xml::from_xml(&response.body_text())
    }

    /// Every object under `prefix`, following continuation tokens
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .list_objects_page(bucket, prefix, continuation.as_deref(), 1000)
                .await?;
            objects.extend(page.contents);
            match page.next_continuation_token {
                Some(token) if page.is_truncated => continuation = Some(token),
                _ => break,
            }
        }
        Ok(objects)
    }

    /// One ListObjectVersions page starting after `(key_marker, version_marker)`
    pub async fn list_object_versions_page(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: Option<&str>,
        version_marker: Option<&str>,
    ) -> Result<ListVersionsResult> {
        let client = self.client_for(bucket).await?;
        let mut request = ApiRequest::get("s3", format!("/{}", bucket))
            .query("versions", "")
            .query("max-keys", "1000");
        if !prefix.is_empty() {
            request = request.query("prefix", prefix);
        }
        if let Some(marker) = key_marker {
            request = request.query("key-marker", marker);
        }
        if let Some(marker) = version_marker {
            request = request.query("version-id-marker", marker);
        }
        let response = client.request(request).await?;
        xml::from_xml(&response.body_text())
    }

    /// All versions and delete markers under `prefix`
    pub async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<ListVersionsResult> {
        let mut all = ListVersionsResult::default();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let page = self
                .list_object_versions_page(
                    bucket,
                    prefix,
                    key_marker.as_deref(),
                    version_marker.as_deref(),
                )
                .await?;
            let next = page.next_markers()?;
            all.versions.extend(page.versions);
            all.delete_markers.extend(page.delete_markers);
            match next {
                Some((key, version)) => {
                    key_marker = key;
                    version_marker = version;
                }
                None => break,
            }
        }
        Ok(all)
    }

    /// Object URL for display
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("s3://{}/{}", bucket, encode_key(key))
    }
}
