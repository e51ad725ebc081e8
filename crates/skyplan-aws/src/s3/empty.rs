use super::types::{DeleteResult, ObjectIdentifier};
use super::{S3Service, MAX_DELETE_BATCH};
use crate::client::ApiRequest;
use crate::retry::check_cancelled;
use crate::xml::{self, escape};
use skyplan_core::{Result, SkyError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyReport {
    pub objects_deleted: usize,
    /// Noncurrent versions and delete markers
    pub versions_deleted: usize,
}

impl S3Service {
    /// Delete every current object; with `force_delete` also every version and delete marker.
    #[instrument(skip(self, token))]
    pub async fn empty_bucket(
        &self,
        bucket: &str,
        force_delete: bool,
        token: &CancellationToken,
    ) -> Result<EmptyReport> {
        let mut report = EmptyReport::default();

        let mut continuation: Option<String> = None;
        loop {
            check_cancelled(token)?;
            let page = self
                .list_objects_page(bucket, "", continuation.as_deref(), MAX_DELETE_BATCH)
                .await?;
            let items: Vec<ObjectIdentifier> = page
                .contents
                .into_iter()
                .map(|o| ObjectIdentifier::current(o.key))
                .collect();
            if !items.is_empty() {
                report.objects_deleted += self.delete_objects(bucket, &items).await?;
            }
            match page.next_continuation_token {
                Some(next) if page.is_truncated => continuation = Some(next),
                _ => break,
            }
        }

        if force_delete {
            let mut key_marker: Option<String> = None;
            let mut version_marker: Option<String> = None;
            loop {
                check_cancelled(token)?;
                let page = self
                    .list_object_versions_page(
                        bucket,
                        "",
                        key_marker.as_deref(),
                        version_marker.as_deref(),
                    )
                    .await?;
                let next = page.next_markers()?;
                let items: Vec<ObjectIdentifier> = page
                    .versions
                    .into_iter()
                    .map(|v| ObjectIdentifier::version(v.key, v.version_id))
                    .chain(
                        page.delete_markers
                            .into_iter()
                            .map(|m| ObjectIdentifier::version(m.key, m.version_id)),
                    )
                    .collect();
                if !items.is_empty() {
                    report.versions_deleted += self.delete_objects(bucket, &items).await?;
                }
                match next {
                    Some((key, version)) => {
                        key_marker = key;
                        version_marker = version;
                    }
                    None => break,
                }
            }
        }

        info!(
            bucket = %bucket,
            objects = report.objects_deleted,
            versions = report.versions_deleted,
            "Emptied bucket"
        );
        Ok(report)
    }

    /// DeleteObjects in batches of at most 1000, each signed with its MD5.
    ///
    /// Returns the number of items deleted. Per-item failures are collected into
    /// [`SkyError::PartialBatchFailure`] and not retried.
    pub async fn delete_objects(&self, bucket: &str, items: &[ObjectIdentifier]) -> Result<usize> {
        let client = self.client_for(bucket).await?;
        let mut failed = Vec::new();
        let mut deleted = 0;

        for batch in items.chunks(MAX_DELETE_BATCH) {
            let response = client
                .request(
                    ApiRequest::post("s3", format!("/{}", bucket))
                        .query("delete", "")
                        .body(delete_request_body(batch))
                        .with_md5(),
                )
                .await?;

            let result: DeleteResult = if response.body.is_empty() {
                DeleteResult::default()
            } else {
                xml::from_xml(&response.body_text())?
            };
            debug!(bucket = %bucket, batch = batch.len(), errors = result.errors.len(), "DeleteObjects");
            deleted += batch.len() - result.errors.len().min(batch.len());
            failed.extend(result.errors.into_iter().map(|e| {
                let item = ObjectIdentifier {
                    key: e.key,
                    version_id: e.version_id,
                };
                format!("{}: {}", item, e.code)
            }));
        }

        if failed.is_empty() {
            Ok(deleted)
        } else {
            Err(SkyError::PartialBatchFailure {
                operation: "DeleteObjects".to_string(),
                failed,
            })
        }
    }
}

fn delete_request_body(items: &[ObjectIdentifier]) -> String {
    let mut body = String::from("<Delete><Quiet>true</Quiet>");
    for item in items {
        body.push_str("<Object><Key>");
        body.push_str(&escape(&item.key));
        body.push_str("</Key>");
        if let Some(version) = &item.version_id {
            body.push_str("<VersionId>");
            body.push_str(&escape(version));
            body.push_str("</VersionId>");
        }
        body.push_str("</Object>");
    }
    body.push_str("</Delete>");
    body
}

#[cfg(test)]
mod tests {
    use super::super::RegionCache;
    use super::*;
    use crate::sigv4::content_md5;
    use crate::http::HttpResponse;
    use crate::testing::{fixed_client, handler_client, ok, RecordedRequest};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::ops::Bound;
    use std::sync::Arc;

    fn regions() -> Arc<RegionCache> {
        let regions = Arc::new(RegionCache::default());
        regions.insert("data", "us-east-1");
        regions
    }

    #[tokio::test]
    async fn test_empty_with_one_version_page() {
        let (client, mock) = fixed_client(
            "us-east-1",
            vec![
                ok("<ListBucketResult><IsTruncated>false</IsTruncated>\
                    <Contents><Key>a</Key></Contents><Contents><Key>b</Key></Contents></ListBucketResult>"),
                ok("<DeleteResult/>"),
                ok("<ListVersionsResult><IsTruncated>false</IsTruncated>\
                    <Version><Key>a</Key><VersionId>v1</VersionId></Version>\
                    <Version><Key>a</Key><VersionId>v2</VersionId></Version>\
                    <DeleteMarker><Key>a</Key><VersionId>vM</VersionId></DeleteMarker></ListVersionsResult>"),
                ok("<DeleteResult/>"),
            ],
        );
        let s3 = S3Service::new(client).with_region_cache(regions());

        let report = s3
            .empty_bucket("data", true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.objects_deleted, 2);
        assert_eq!(report.versions_deleted, 3);

        let deletes: Vec<_> = mock
            .requests()
            .into_iter()
            .filter(|r| r.method == "POST" && r.has_query("delete"))
            .collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].body_text().matches("<Object>").count(), 2);
        assert_eq!(deletes[1].body_text().matches("<Object>").count(), 3);
        for request in &deletes {
            assert_eq!(request.header("content-md5"), Some(content_md5(&request.body).as_str()));
            assert!(request.body_text().contains("<Quiet>true</Quiet>"));
        }
        assert!(deletes[1].body_text().contains("<VersionId>vM</VersionId>"));
    }

    /// Versioned bucket: current keys plus `(key, version)` pairs, delete markers prefixed `dm-`
    #[derive(Default)]
    struct Store {
        objects: BTreeSet<String>,
        versions: BTreeSet<(String, String)>,
    }

    /// Serves ListObjectsV2, ListObjectVersions (two entries per page) and DeleteObjects from `store`
    fn versioned_bucket(
        store: Arc<Mutex<Store>>,
    ) -> impl Fn(&RecordedRequest) -> HttpResponse + Send + Sync + 'static {
        move |r: &RecordedRequest| {
            let mut store = store.lock();
            if r.method == "POST" && r.has_query("delete") {
                for chunk in r.body_text().split("<Object>").skip(1) {
                    let fields = chunk.split("</Object>").next().unwrap_or_default();
                    let key = xml::first_text(fields, "Key").unwrap_or_default();
                    match xml::first_text(fields, "VersionId") {
                        Some(version) => {
                            store.versions.remove(&(key, version));
                        }
                        None => {
                            if store.objects.remove(&key) {
                                let marker = format!("dm-{}", key);
                                store.versions.insert((key, marker));
                            }
                        }
                    }
                }
                return ok("<DeleteResult/>");
            }
            if r.has_query("versions") {
                let start = match (r.param("key-marker"), r.param("version-id-marker")) {
                    (Some(key), Some(version)) => Bound::Excluded((key, version)),
                    _ => Bound::Unbounded,
                };
                let remaining: Vec<(String, String)> = store
                    .versions
                    .range::<(String, String), _>((start, Bound::Unbounded))
                    .cloned()
                    .collect();
                let page = &remaining[..remaining.len().min(2)];
                let mut body = String::from("<ListVersionsResult>");
                if remaining.len() > page.len() {
                    if let Some((key, version)) = page.last() {
                        body.push_str(&format!(
                            "<IsTruncated>true</IsTruncated><NextKeyMarker>{}</NextKeyMarker>\
                             <NextVersionIdMarker>{}</NextVersionIdMarker>",
                            key, version
                        ));
                    }
                } else {
                    body.push_str("<IsTruncated>false</IsTruncated>");
                }
                for (key, version) in page {
                    let tag = if version.starts_with("dm-") { "DeleteMarker" } else { "Version" };
                    body.push_str(&format!(
                        "<{tag}><Key>{key}</Key><VersionId>{version}</VersionId></{tag}>"
                    ));
                }
                body.push_str("</ListVersionsResult>");
                return ok(&body);
            }
            let mut body = String::from("<ListBucketResult><IsTruncated>false</IsTruncated>");
            for key in &store.objects {
                body.push_str(&format!("<Contents><Key>{}</Key></Contents>", key));
            }
            body.push_str("</ListBucketResult>");
            ok(&body)
        }
    }

    #[tokio::test]
    async fn test_force_empty_leaves_nothing_listed() {
        let store = Arc::new(Mutex::new(Store::default()));
        {
            let mut store = store.lock();
            for key in ["a", "b", "c"] {
                store.objects.insert(key.to_string());
                store.versions.insert((key.to_string(), "v1".to_string()));
                store.versions.insert((key.to_string(), "v2".to_string()));
            }
        }
        let (client, mock) = handler_client("us-east-1", versioned_bucket(store.clone()));
        let s3 = S3Service::new(client).with_region_cache(regions());

        let report = s3
            .empty_bucket("data", true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.objects_deleted, 3);
        // two versions per key plus the marker left by deleting the current object
        assert_eq!(report.versions_deleted, 9);

        assert!(s3.list_objects("data", "").await.unwrap().is_empty());
        let left = s3.list_object_versions("data", "").await.unwrap();
        assert!(left.versions.is_empty());
        assert!(left.delete_markers.is_empty());

        let paged = mock
            .requests()
            .iter()
            .filter(|r| r.has_query("versions") && r.param("key-marker").is_some())
            .count();
        assert!(paged >= 2);
    }

    #[tokio::test]
    async fn test_force_empty_stops_on_truncated_page_without_markers() {
        let (client, mock) = handler_client("us-east-1", |r| {
            if r.has_query("versions") {
                ok("<ListVersionsResult><IsTruncated>true</IsTruncated>\
                    <Version><Key>a</Key><VersionId>v1</VersionId></Version></ListVersionsResult>")
            } else {
                ok("<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>")
            }
        });
        let s3 = S3Service::new(client).with_region_cache(regions());

        let err = s3
            .empty_bucket("data", true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SkyError::Serialization(_)));
        let listings = mock.requests().iter().filter(|r| r.has_query("versions")).count();
        assert_eq!(listings, 1);
    }

    #[tokio::test]
    async fn test_batches_never_exceed_limit() {
        let (client, mock) = handler_client("us-east-1", |_| ok("<DeleteResult/>"));
        let s3 = S3Service::new(client).with_region_cache(regions());

        let items: Vec<ObjectIdentifier> = (0..2500)
            .map(|i| ObjectIdentifier::current(format!("k{}", i)))
            .collect();
        assert_eq!(s3.delete_objects("data", &items).await.unwrap(), 2500);

        let sizes: Vec<usize> = mock
            .requests()
            .iter()
            .map(|r| r.body_text().matches("<Object>").count())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported() {
        let (client, _) = fixed_client(
            "us-east-1",
            vec![ok("<DeleteResult><Deleted><Key>a</Key></Deleted>\
                 <Error><Key>b</Key><VersionId>v2</VersionId><Code>AccessDenied</Code><Message>no</Message></Error>\
                 </DeleteResult>")],
        );
        let s3 = S3Service::new(client).with_region_cache(regions());
        let err = s3
            .delete_objects(
                "data",
                &[ObjectIdentifier::current("a"), ObjectIdentifier::version("b", "v2")],
            )
            .await
            .unwrap_err();
        match err {
            SkyError::PartialBatchFailure { operation, failed } => {
                assert_eq!(operation, "DeleteObjects");
                assert_eq!(failed, vec!["b (v2): AccessDenied"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_listing() {
        let (client, mock) = fixed_client("us-east-1", vec![]);
        let s3 = S3Service::new(client).with_region_cache(regions());
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            s3.empty_bucket("data", true, &token).await,
            Err(SkyError::Cancelled)
        ));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_delete_bucket_not_empty_empties_then_retries() {
        let (client, mock) = fixed_client(
            "us-east-1",
            vec![
                HttpResponse::new(
                    409,
                    "<Error><Code>BucketNotEmpty</Code><Message>The bucket you tried to delete is not empty</Message></Error>",
                ),
                ok("<ListBucketResult><IsTruncated>false</IsTruncated><Contents><Key>a</Key></Contents></ListBucketResult>"),
                ok("<DeleteResult/>"),
                ok("<ListVersionsResult><IsTruncated>false</IsTruncated></ListVersionsResult>"),
                HttpResponse::new(204, ""),
            ],
        );
        let s3 = S3Service::new(client).with_region_cache(regions());
        s3.delete_bucket("data", &CancellationToken::new())
            .await
            .unwrap();

        let methods: Vec<String> = mock.requests().iter().map(|r| r.method.clone()).collect();
        assert_eq!(methods, vec!["DELETE", "GET", "POST", "GET", "DELETE"]);
    }
}
