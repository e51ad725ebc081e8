use super::encoding::{copy_source, object_path};
use super::types::{CopyPartResult, InitiateMultipartUploadResult};
use super::S3Service;
use crate::client::{ApiRequest, SigningClient};
use crate::xml::{self, escape};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use skyplan_core::{Result, SkyError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Preparing,
    Copying,
    Complete,
    Failed,
}

impl std::fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyStatus::Preparing => write!(f, "preparing"),
            CopyStatus::Copying => write!(f, "copying"),
            CopyStatus::Complete => write!(f, "complete"),
            CopyStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyProgress {
    pub total_objects: usize,
    pub copied_objects: usize,
    pub failed_objects: usize,
    pub total_bytes: u64,
    pub copied_bytes: u64,
    pub current_key: Option<String>,
    pub bytes_per_second: f64,
    pub percent: f64,
    pub status: CopyStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyReport {
    pub copied_objects: usize,
    pub copied_bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    copied_objects: usize,
    copied_bytes: u64,
    failed_objects: usize,
    failed_keys: Vec<String>,
    current_key: Option<String>,
}

/// `(partNumber, first byte, last byte)` covering `[0, size)` contiguously
pub fn part_ranges(size: u64, part_size: u64) -> Vec<(u32, u64, u64)> {
    if size == 0 || part_size == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut start = 0u64;
    let mut number = 1u32;
    while start < size {
        let end = (start + part_size).min(size) - 1;
        ranges.push((number, start, end));
        start = end + 1;
        number += 1;
    }
    ranges
}

fn embedded_error(body: &str) -> Option<SkyError> {
    if !body.contains("<Error>") {
        return None;
    }
    let code = xml::first_text(body, "Code").unwrap_or_default();
    let message = xml::first_text(body, "Message").unwrap_or_default();
    Some(SkyError::remote(200, "s3", code, message))
}

impl S3Service {
    /// Copy one object across buckets (and regions); multipart above the single-copy limit.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        size: u64,
    ) -> Result<()> {
        let dst = self.client_for(dst_bucket).await?;
        if size > self.settings.multipart_threshold {
            return self
                .multipart_copy(&dst, src_bucket, src_key, dst_bucket, dst_key, size)
                .await;
        }

        let response = dst
            .request(
                ApiRequest::put("s3", object_path(dst_bucket, dst_key))
                    .header("x-amz-copy-source", copy_source(src_bucket, src_key)),
            )
            .await?;
        match embedded_error(&response.body_text()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn multipart_copy(
        &self,
        dst: &SigningClient,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        size: u64,
    ) -> Result<()> {
        let path = object_path(dst_bucket, dst_key);
        let response = dst
            .request(ApiRequest::post("s3", path.clone()).query("uploads", ""))
            .await?;
        let init: InitiateMultipartUploadResult = xml::from_xml(&response.body_text())?;
        let upload_id = init.upload_id;
        debug!(key = %dst_key, upload_id = %upload_id, size, "Started multipart copy");

        let result = self
            .copy_parts_and_complete(dst, &path, &copy_source(src_bucket, src_key), &upload_id, size)
            .await;

        if let Err(err) = result {
            let abort = ApiRequest::delete("s3", path).query("uploadId", upload_id.as_str());
            if let Err(abort_err) = dst.request(abort).await {
                warn!(upload_id = %upload_id, error = %abort_err, "Failed to abort multipart upload");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn copy_parts_and_complete(
        &self,
        dst: &SigningClient,
        path: &str,
        source: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<()> {
        let results: Vec<Result<(u32, String)>> =
            stream::iter(part_ranges(size, self.settings.part_size))
                .map(|(number, start, end)| async move {
                    let response = dst
                        .request(
                            ApiRequest::put("s3", path)
                                .query("partNumber", number.to_string())
                                .query("uploadId", upload_id)
                                .header("x-amz-copy-source", source)
                                .header("x-amz-copy-source-range", format!("bytes={}-{}", start, end)),
                        )
                        .await?;
                    let body = response.body_text();
                    if let Some(err) = embedded_error(&body) {
                        return Err(err);
                    }
                    let part: CopyPartResult = xml::from_xml(&body)?;
                    Ok((number, part.etag))
                })
                .buffer_unordered(self.settings.part_concurrency)
                .collect()
                .await;

        let mut parts = results.into_iter().collect::<Result<Vec<_>>>()?;
        parts.sort_by_key(|(number, _)| *number);

        let mut body = String::from("<CompleteMultipartUpload>");
        for (number, etag) in &parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                number,
                escape(etag)
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let response = dst
            .request(
                ApiRequest::post("s3", path)
                    .query("uploadId", upload_id)
                    .body(body),
            )
            .await?;
        match embedded_error(&response.body_text()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copy every object of `src_bucket` into `dst_bucket` (created in `dst_region` if needed).
    ///
    /// Progress snapshots go to `progress`; the sender is dropped when this returns.
    /// When some objects fail the final status is still `complete` as long as at
    /// least one object was copied, and the failed keys are returned as
    /// [`SkyError::PartialBatchFailure`].
    #[instrument(skip(self, progress, token))]
    pub async fn copy_bucket(
        &self,
        src_bucket: &str,
        dst_bucket: &str,
        dst_region: &str,
        progress: Option<mpsc::Sender<CopyProgress>>,
        token: &CancellationToken,
    ) -> Result<CopyReport> {
        let started = Instant::now();
        let counters = Arc::new(Mutex::new(Counters::default()));
        let reporter = Reporter {
            tx: progress,
            started,
        };

        reporter
            .send(&counters, 0, 0, CopyStatus::Preparing)
            .await;

        let prepared = async {
            let objects = self.list_objects(src_bucket, "").await?;
            self.ensure_bucket(dst_bucket, dst_region).await?;
            Ok::<_, SkyError>(objects)
        }
        .await;
        let objects = match prepared {
            Ok(objects) => objects,
            Err(err) => {
                reporter.send(&counters, 0, 0, CopyStatus::Failed).await;
                return Err(err);
            }
        };

        let total_objects = objects.len();
        let total_bytes: u64 = objects.iter().map(|o| o.size).sum();
        info!(
            src = %src_bucket,
            dst = %dst_bucket,
            objects = total_objects,
            bytes = total_bytes,
            "Copying bucket"
        );
        reporter
            .send(&counters, total_objects, total_bytes, CopyStatus::Copying)
            .await;

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        for object in objects {
            let s3 = self.clone();
            let semaphore = semaphore.clone();
            let counters = counters.clone();
            let token = token.clone();
            let src_bucket = src_bucket.to_string();
            let dst_bucket = dst_bucket.to_string();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if token.is_cancelled() {
                    return;
                }
                counters.lock().current_key = Some(object.key.clone());

                let result = s3
                    .copy_object(&src_bucket, &object.key, &dst_bucket, &object.key, object.size)
                    .await;

                let mut counters = counters.lock();
                match result {
                    Ok(()) => {
                        counters.copied_objects += 1;
                        counters.copied_bytes += object.size;
                    }
                    Err(err) => {
                        counters.failed_objects += 1;
                        counters.failed_keys.push(format!("{}: {}", object.key, err));
                    }
                }
            });
        }

        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(join_err)) => {
                        let mut counters = counters.lock();
                        counters.failed_objects += 1;
                        counters.failed_keys.push(format!("copy task aborted: {}", join_err));
                    }
                },
                _ = ticker.tick() => {
                    reporter.tick(&counters, total_objects, total_bytes);
                }
            }
        }

        if token.is_cancelled() {
            reporter
                .send(&counters, total_objects, total_bytes, CopyStatus::Failed)
                .await;
            return Err(SkyError::Cancelled);
        }

        let (copied_objects, copied_bytes, failed_keys) = {
            let counters = counters.lock();
            (
                counters.copied_objects,
                counters.copied_bytes,
                counters.failed_keys.clone(),
            )
        };
        let status = if !failed_keys.is_empty() && copied_objects == 0 {
            CopyStatus::Failed
        } else {
            CopyStatus::Complete
        };
        reporter
            .send(&counters, total_objects, total_bytes, status)
            .await;

        if !failed_keys.is_empty() {
            return Err(SkyError::PartialBatchFailure {
                operation: "CopyBucket".to_string(),
                failed: failed_keys,
            });
        }
        Ok(CopyReport {
            copied_objects,
            copied_bytes,
            elapsed: started.elapsed(),
        })
    }
}

/// Single writer of the progress channel
struct Reporter {
    tx: Option<mpsc::Sender<CopyProgress>>,
    started: Instant,
}

impl Reporter {
    fn snapshot(
        &self,
        counters: &Mutex<Counters>,
        total_objects: usize,
        total_bytes: u64,
        status: CopyStatus,
    ) -> CopyProgress {
        let counters = counters.lock();
        let elapsed = self.started.elapsed().as_secs_f64();
        let done = counters.copied_objects + counters.failed_objects;
        CopyProgress {
            total_objects,
            copied_objects: counters.copied_objects,
            failed_objects: counters.failed_objects,
            total_bytes,
            copied_bytes: counters.copied_bytes,
            current_key: counters.current_key.clone(),
            bytes_per_second: if elapsed > 0.0 {
                counters.copied_bytes as f64 / elapsed
            } else {
                0.0
            },
            percent: if total_objects == 0 {
                if status == CopyStatus::Complete {
                    100.0
                } else {
                    0.0
                }
            } else {
                done as f64 * 100.0 / total_objects as f64
            },
            status,
        }
    }

    /// Status transitions are always delivered
    async fn send(
        &self,
        counters: &Mutex<Counters>,
        total_objects: usize,
        total_bytes: u64,
        status: CopyStatus,
    ) {
        if let Some(tx) = &self.tx {
            let snapshot = self.snapshot(counters, total_objects, total_bytes, status);
            if tx.send(snapshot).await.is_err() {
                debug!("Progress receiver closed");
            }
        }
    }

    /// Periodic updates are dropped when the consumer lags
    fn tick(&self, counters: &Mutex<Counters>, total_objects: usize, total_bytes: u64) {
        if let Some(tx) = &self.tx {
            let snapshot = self.snapshot(counters, total_objects, total_bytes, CopyStatus::Copying);
            // Full or closed channel: skip this tick
            if let Err(err) = tx.try_send(snapshot) {
                debug!(error = %err, "Progress update dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CopySettings, RegionCache};
    use super::*;
    use crate::http::HttpResponse;
    use crate::testing::{handler_client, ok};

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_part_ranges_cover_object() {
        let size = 250 * MIB + 7;
        let ranges = part_ranges(size, 100 * MIB);
        assert_eq!(ranges.len() as u64, size.div_ceil(100 * MIB));
        assert_eq!(ranges[0], (1, 0, 100 * MIB - 1));
        let mut expected_start = 0;
        for (i, (number, start, end)) in ranges.iter().enumerate() {
            assert_eq!(*number as usize, i + 1);
            assert_eq!(*start, expected_start);
            assert!(end >= start);
            expected_start = end + 1;
        }
        assert_eq!(expected_start, size);
        assert!(part_ranges(0, 100 * MIB).is_empty());
    }

    fn small_parts() -> CopySettings {
        CopySettings {
            concurrency: 10,
            part_concurrency: 4,
            part_size: 100 * MIB,
            multipart_threshold: 100 * MIB,
            progress_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_single_part_in_flight_copies_in_order() {
        let (client, mock) = handler_client("us-east-1", |r| {
            if r.method == "POST" && r.has_query("uploads") {
                ok("<InitiateMultipartUploadResult><UploadId>up-1</UploadId></InitiateMultipartUploadResult>")
            } else if r.method == "PUT" {
                ok("<CopyPartResult><ETag>e</ETag></CopyPartResult>")
            } else {
                ok("<CompleteMultipartUploadResult><ETag>x</ETag></CompleteMultipartUploadResult>")
            }
        });
        let settings = CopySettings {
            part_concurrency: 1,
            ..small_parts()
        };
        let s3 = S3Service::new(client)
            .with_region_cache(regions())
            .with_copy_settings(settings);

        s3.copy_object("src", "big.bin", "dst", "big.bin", 250 * MIB)
            .await
            .unwrap();

        let numbers: Vec<String> = mock
            .requests()
            .iter()
            .filter(|r| r.method == "PUT")
            .filter_map(|r| r.param("partNumber"))
            .collect();
        assert_eq!(numbers, vec!["1", "2", "3"]);
    }

    fn regions() -> Arc<RegionCache> {
        let regions = Arc::new(RegionCache::default());
        regions.insert("src", "us-east-1");
        regions.insert("dst", "eu-west-1");
        regions
    }

    #[tokio::test]
    async fn test_multipart_copy_sorted_completion() {
        let (client, mock) = handler_client("us-east-1", |r| {
            if r.method == "POST" && r.has_query("uploads") {
                ok("<InitiateMultipartUploadResult><UploadId>up-1</UploadId></InitiateMultipartUploadResult>")
            } else if r.method == "PUT" {
                let n = r.param("partNumber").unwrap_or_default();
                ok(&format!("<CopyPartResult><ETag>&quot;etag-{}&quot;</ETag></CopyPartResult>", n))
            } else {
                ok("<CompleteMultipartUploadResult><ETag>x</ETag></CompleteMultipartUploadResult>")
            }
        });
        let s3 = S3Service::new(client)
            .with_region_cache(regions())
            .with_copy_settings(small_parts());

        s3.copy_object("src", "big.bin", "dst", "big.bin", 250 * MIB)
            .await
            .unwrap();

        let requests = mock.requests();
        let parts: Vec<_> = requests.iter().filter(|r| r.method == "PUT").collect();
        assert_eq!(parts.len(), 3);
        let mut ranges: Vec<String> = parts
            .iter()
            .map(|r| r.header("x-amz-copy-source-range").unwrap().to_string())
            .collect();
        ranges.sort();
        assert_eq!(
            ranges,
            vec![
                format!("bytes=0-{}", 100 * MIB - 1),
                format!("bytes={}-{}", 100 * MIB, 200 * MIB - 1),
                format!("bytes={}-{}", 200 * MIB, 250 * MIB - 1),
            ]
        );
        assert!(parts
            .iter()
            .all(|r| r.header("x-amz-copy-source") == Some("/src/big.bin")));

        let complete = requests.last().unwrap();
        assert_eq!(complete.param("uploadId").as_deref(), Some("up-1"));
        let body = complete.body_text();
        let p1 = body.find("<PartNumber>1</PartNumber>").unwrap();
        let p2 = body.find("<PartNumber>2</PartNumber>").unwrap();
        let p3 = body.find("<PartNumber>3</PartNumber>").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert!(body.contains("<ETag>&quot;etag-2&quot;</ETag>"));
        assert!(complete.url.starts_with("https://s3.eu-west-1.amazonaws.com/dst/big.bin"));
    }

    #[tokio::test]
    async fn test_multipart_failure_aborts() {
        let (client, mock) = handler_client("us-east-1", |r| {
            if r.method == "POST" && r.has_query("uploads") {
                ok("<InitiateMultipartUploadResult><UploadId>up-2</UploadId></InitiateMultipartUploadResult>")
            } else if r.method == "PUT" && r.param("partNumber").as_deref() == Some("2") {
                HttpResponse::new(500, "<Error><Code>InternalError</Code><Message>boom</Message></Error>")
            } else if r.method == "PUT" {
                ok("<CopyPartResult><ETag>e</ETag></CopyPartResult>")
            } else {
                HttpResponse::new(204, "")
            }
        });
        let s3 = S3Service::new(client)
            .with_region_cache(regions())
            .with_copy_settings(small_parts());

        let err = s3
            .copy_object("src", "big.bin", "dst", "big.bin", 250 * MIB)
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some("InternalError"));

        let requests = mock.requests();
        let abort = requests.last().unwrap();
        assert_eq!(abort.method, "DELETE");
        assert_eq!(abort.param("uploadId").as_deref(), Some("up-2"));
        assert!(!requests
            .iter()
            .any(|r| r.method == "POST" && r.has_query("uploadId")));
    }

    #[tokio::test]
    async fn test_copy_bucket_partial_success() {
        let (client, _) = handler_client("us-east-1", |r| {
            let path = r.path();
            if r.method == "GET" && path == "/src" {
                ok("<ListBucketResult><IsTruncated>false</IsTruncated>\
                    <Contents><Key>a</Key><Size>10</Size></Contents>\
                    <Contents><Key>b</Key><Size>20</Size></Contents>\
                    <Contents><Key>broken</Key><Size>5</Size></Contents></ListBucketResult>")
            } else if r.method == "PUT" && path == "/dst" {
                HttpResponse::new(
                    409,
                    "<Error><Code>BucketAlreadyOwnedByYou</Code><Message>yours</Message></Error>",
                )
            } else if path == "/dst/broken" {
                HttpResponse::new(403, "<Error><Code>AccessDenied</Code><Message>no</Message></Error>")
            } else {
                ok("<CopyObjectResult><ETag>e</ETag></CopyObjectResult>")
            }
        });
        let s3 = S3Service::new(client)
            .with_region_cache(regions())
            .with_copy_settings(small_parts());

        let (tx, mut rx) = mpsc::channel(64);
        let err = s3
            .copy_bucket("src", "dst", "eu-west-1", Some(tx), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SkyError::PartialBatchFailure { operation, failed } => {
                assert_eq!(operation, "CopyBucket");
                assert_eq!(failed.len(), 1);
                assert!(failed[0].starts_with("broken: AccessDenied"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        assert_eq!(updates.first().unwrap().status, CopyStatus::Preparing);
        let last = updates.last().unwrap();
        assert_eq!(last.status, CopyStatus::Complete);
        assert_eq!(last.copied_objects, 2);
        assert_eq!(last.failed_objects, 1);
        assert_eq!(last.copied_bytes, 30);
        assert_eq!(last.percent, 100.0);
    }

    #[tokio::test]
    async fn test_copy_bucket_survives_closed_progress_receiver() {
        let (client, _) = handler_client("us-east-1", |r| {
            if r.method == "GET" {
                ok("<ListBucketResult><IsTruncated>false</IsTruncated>\
                    <Contents><Key>a</Key><Size>3</Size></Contents>\
                    <Contents><Key>b</Key><Size>4</Size></Contents></ListBucketResult>")
            } else if r.path() == "/dst" {
                ok("")
            } else {
                ok("<CopyObjectResult><ETag>e</ETag></CopyObjectResult>")
            }
        });
        let s3 = S3Service::new(client)
            .with_region_cache(regions())
            .with_copy_settings(small_parts());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let report = s3
            .copy_bucket("src", "dst", "eu-west-1", Some(tx), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.copied_objects, 2);
        assert_eq!(report.copied_bytes, 7);
    }

    #[tokio::test]
    async fn test_copy_bucket_all_failed() {
        let (client, _) = handler_client("us-east-1", |r| {
            if r.method == "GET" {
                ok("<ListBucketResult><IsTruncated>false</IsTruncated>\
                    <Contents><Key>a</Key><Size>1</Size></Contents></ListBucketResult>")
            } else if r.path() == "/dst" {
                ok("")
            } else {
                HttpResponse::new(500, "")
            }
        });
        let s3 = S3Service::new(client)
            .with_region_cache(regions())
            .with_copy_settings(small_parts());

        let (tx, mut rx) = mpsc::channel(64);
        assert!(s3
            .copy_bucket("src", "dst", "eu-west-1", Some(tx), &CancellationToken::new())
            .await
            .is_err());
        let mut last = None;
        while let Some(update) = rx.recv().await {
            last = Some(update);
        }
        assert_eq!(last.unwrap().status, CopyStatus::Failed);
    }
}
