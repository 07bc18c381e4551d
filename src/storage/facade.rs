//! Storage facade / 存储门面
//!
//! One bucket, five operations. Every remote call made here is bounded by the request
//! timeout and raced against the caller's cancellation token; idempotent calls are retried
//! on `Transient` failures.

use bytes::BytesMut;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use super::multipart::{read_chunk, MultipartJob};
use super::retry::{with_deadline, RetryPolicy};
use super::{
    DeleteResult, ObjectBackend, ObjectContent, ObjectKey, ObjectListing, PendingUpload,
    ProgressCallback, RemoteObject, SignedUrlGrant, UploadProgress, UploadResult, MAX_KEY_LEN,
};
use crate::config::{StorageEndpointConfig, TransferConfig, TuningConfig};
use crate::drivers::s3::S3Driver;
use crate::error::StorageError;

/// Longest lifetime SigV4 allows for a presigned URL / 预签名URL最长有效期
pub const MAX_SIGNED_URL_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Upper bound on buffer preallocation trusted from a Content-Length header
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Object storage facade bound to one bucket / 对象存储门面
pub struct StorageFacade {
    backend: Arc<dyn ObjectBackend>,
    transfer: TransferConfig,
    retry: RetryPolicy,
}

impl StorageFacade {
    pub fn new(backend: Arc<dyn ObjectBackend>, tuning: &TuningConfig) -> Self {
        Self {
            backend,
            transfer: tuning.transfer.clone(),
            retry: RetryPolicy::from_config(&tuning.retry),
        }
    }

    /// Facade over the S3 driver / 连接S3
    pub fn connect(
        endpoint: &StorageEndpointConfig,
        tuning: &TuningConfig,
    ) -> Result<Self, StorageError> {
        let driver = S3Driver::new(endpoint, tuning.transfer.list_page_size)?;
        Ok(Self::new(Arc::new(driver), tuning))
    }

    /// Bound bucket / 存储桶名称
    pub fn bucket(&self) -> &str {
        self.backend.bucket()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn timeout(&self) -> Duration {
        self.transfer.request_timeout()
    }

    /// List every object under `prefix` / 列出全部对象
    ///
    /// Follows continuation tokens to the end; an empty prefix lists the whole bucket.
    pub async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectListing, StorageError> {
        self.collect_listing(prefix, None, cancel).await
    }

    /// List at most `limit` objects under `prefix` / 列出前limit个对象
    pub async fn list_with_limit(
        &self,
        prefix: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ObjectListing, StorageError> {
        self.collect_listing(prefix, Some(limit), cancel).await
    }

    async fn collect_listing(
        &self,
        prefix: &str,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<ObjectListing, StorageError> {
        if prefix.len() > MAX_KEY_LEN {
            return Err(StorageError::invalid(format!(
                "prefix is {} bytes, limit is {}",
                prefix.len(),
                MAX_KEY_LEN
            )));
        }

        let mut listing = ObjectListing::default();
        if limit == Some(0) {
            return Ok(listing);
        }

        let page_size = self.transfer.list_page_size;
        let timeout = self.timeout();
        let mut token: Option<String> = None;

        loop {
            let max_keys = match limit {
                Some(limit) => (limit - listing.len()).min(page_size),
                None => page_size,
            };
            let page = self
                .retry
                .run("list objects", cancel, |_| {
                    with_deadline(
                        "list objects",
                        timeout,
                        cancel,
                        self.backend.list_page(prefix, token.as_deref(), max_keys),
                    )
                })
                .await?;

            listing.pages += 1;
            tracing::debug!(
                "List page {}: prefix={:?}, entries={}, truncated={}",
                listing.pages,
                prefix,
                page.objects.len(),
                page.is_truncated
            );
            listing.objects.extend(page.objects);

            if let Some(limit) = limit {
                if listing.len() >= limit {
                    listing.objects.truncate(limit);
                    break;
                }
            }
            if !page.is_truncated {
                break;
            }
            match page.next_continuation_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                Some(_) => {
                    return Err(StorageError::invalid(
                        "listing continuation token did not advance",
                    ))
                }
                None => {
                    return Err(StorageError::invalid(
                        "truncated listing page without a continuation token",
                    ))
                }
            }
        }

        tracing::info!(
            "Listed {} objects under {:?} in {} pages",
            listing.len(),
            prefix,
            listing.pages
        );
        Ok(listing)
    }

    /// Upload a stream to `key` / 上传对象
    ///
    /// Streams shorter than the multipart threshold go up in one request, which is never
    /// retried. Longer streams are split into parts; a failed or cancelled multipart upload
    /// is aborted server-side before the error is returned.
    pub async fn upload<R>(
        &self,
        key: &str,
        mut source: R,
        size_hint: Option<u64>,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = ObjectKey::new(key)?;
        let threshold = self.transfer.multipart_threshold;
        let capacity = size_hint.map_or(threshold, |hint| hint.min(threshold as u64) as usize);

        let head = read_chunk(&mut source, threshold, capacity, cancel).await?;
        if head.is_empty() {
            return Err(StorageError::invalid(format!(
                "refusing to upload an empty stream to {}",
                key
            )));
        }

        if head.len() < threshold {
            let bytes_written = head.len() as u64;
            tracing::debug!("Uploading {} in a single request: size={}", key, bytes_written);
            let etag = with_deadline(
                "put object",
                self.timeout(),
                cancel,
                self.backend.put_object(key.as_str(), head),
            )
            .await?;
            if let Some(progress) = &progress {
                progress(UploadProgress {
                    bytes_completed: bytes_written,
                    total_bytes: size_hint,
                    parts_completed: 0,
                });
            }
            tracing::info!("Uploaded {} ({} bytes)", key, bytes_written);
            return Ok(UploadResult {
                key,
                etag,
                bytes_written,
                parts: 0,
            });
        }

        let job = MultipartJob {
            backend: Arc::clone(&self.backend),
            key,
            part_size: self.transfer.part_size,
            concurrency: self.transfer.concurrency.max(1),
            timeout: self.timeout(),
            retry: self.retry.clone(),
            size_hint,
            progress,
        };
        let result = job.run(head, &mut source, cancel).await?;
        tracing::info!(
            "Uploaded {} ({} bytes in {} parts)",
            result.key,
            result.bytes_written,
            result.parts
        );
        Ok(result)
    }

    /// Fetch an object into memory / 下载对象
    ///
    /// An interrupted body restarts the whole fetch; partial reads are not resumed.
    pub async fn fetch(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectContent, StorageError> {
        let key = ObjectKey::new(key)?;
        let content = self
            .retry
            .run("fetch object", cancel, |attempt| self.fetch_once(&key, attempt, cancel))
            .await?;
        tracing::info!("Fetched {} ({} bytes)", key, content.len());
        Ok(content)
    }

    async fn fetch_once(
        &self,
        key: &ObjectKey,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<ObjectContent, StorageError> {
        tracing::debug!("Fetching {}: attempt={}", key, attempt);
        let timeout = self.timeout();
        let remote = with_deadline(
            "get object",
            timeout,
            cancel,
            self.backend.get_object(key.as_str()),
        )
        .await?;

        if !(200..300).contains(&remote.status) {
            return Err(StorageError::invalid(format!(
                "unexpected response status {} for {}",
                remote.status, key
            ))
            .with_status(remote.status));
        }

        let RemoteObject {
            content_length,
            content_type,
            mut body,
            ..
        } = remote;

        let mut buf = BytesMut::with_capacity(content_length.unwrap_or(0).min(MAX_PREALLOC) as usize);
        loop {
            let next = with_deadline("read object body", timeout, cancel, async {
                Ok(body.next().await)
            })
            .await?;
            match next {
                Some(chunk) => buf.extend_from_slice(&chunk?),
                None => break,
            }
        }

        if let Some(expected) = content_length {
            if buf.len() as u64 != expected {
                return Err(StorageError::transient(format!(
                    "body of {} ended after {} of {} bytes",
                    key,
                    buf.len(),
                    expected
                )));
            }
        }

        Ok(ObjectContent {
            key: key.clone(),
            data: buf.freeze(),
            content_type,
        })
    }

    /// Presign a GET URL valid for `ttl` / 生成限时访问URL
    ///
    /// `ttl` must be positive and at most seven days. No network round trip.
    pub async fn sign_access_url(
        &self,
        key: &str,
        ttl: chrono::Duration,
    ) -> Result<SignedUrlGrant, StorageError> {
        let key = ObjectKey::new(key)?;
        let ttl_secs = ttl.num_seconds();
        if ttl_secs < 1 || ttl_secs > MAX_SIGNED_URL_TTL_SECS {
            return Err(StorageError::invalid(format!(
                "signed URL ttl must be between 1 and {} seconds, got {}s",
                MAX_SIGNED_URL_TTL_SECS, ttl_secs
            )));
        }

        let issued_at = chrono::Utc::now();
        let url = self
            .backend
            .presign_get(key.as_str(), Duration::from_secs(ttl_secs as u64))
            .await?;
        tracing::info!("Signed access URL for {} (ttl {}s)", key, ttl_secs);

        Ok(SignedUrlGrant {
            url,
            ttl_secs: ttl_secs as u64,
            expires_at: issued_at + chrono::Duration::seconds(ttl_secs),
        })
    }

    /// Delete `key`; deleting an absent key succeeds / 删除对象
    pub async fn delete(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<DeleteResult, StorageError> {
        let key = ObjectKey::new(key)?;
        let timeout = self.timeout();
        let existed = self
            .retry
            .run("delete object", cancel, |_| {
                with_deadline(
                    "delete object",
                    timeout,
                    cancel,
                    self.backend.delete_object(key.as_str()),
                )
            })
            .await?;

        if existed {
            tracing::info!("Deleted {}", key);
        } else {
            tracing::info!("Delete of {}: object was already absent", key);
        }
        Ok(DeleteResult { key, existed })
    }

    /// Open multipart uploads under `prefix` / 未完成的分片上传
    pub async fn list_pending_uploads(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<PendingUpload>, StorageError> {
        let timeout = self.timeout();
        self.retry
            .run("list multipart uploads", cancel, |_| {
                with_deadline(
                    "list multipart uploads",
                    timeout,
                    cancel,
                    self.backend.list_multipart_uploads(prefix),
                )
            })
            .await
    }

    /// Release the backend / 关闭
    pub async fn shutdown(self) {
        self.backend.close().await;
        tracing::info!("Storage facade for bucket {} shut down", self.backend.bucket());
    }
}
