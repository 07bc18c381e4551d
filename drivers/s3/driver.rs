//! S3驱动核心实现
//!
//! 只提供原语，重试、超时与分片编排由门面负责。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::serde_types::Part;
use s3::Region;
use serde::Deserialize;
use std::time::Duration;

use super::error::map_s3_error;
use crate::config::{AddressingStyle, StorageEndpointConfig, MAX_LIST_PAGE_SIZE};
use crate::error::{ErrorKind, StorageError};
use crate::storage::{
    CompletedPart, ListPage, ObjectBackend, ObjectSummary, PendingUpload, RemoteObject,
};

const CONTENT_TYPE: &str = "application/octet-stream";

/// Body of a CompleteMultipartUpload response / 完成分片上传响应
#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
}

/// S3驱动
pub struct S3Driver {
    bucket: Box<Bucket>,
    bucket_name: String,
    page_size: usize,
}

impl S3Driver {
    /// 创建新的S3驱动实例
    pub fn new(config: &StorageEndpointConfig, page_size: usize) -> Result<Self, StorageError> {
        let bucket = Self::create_bucket(config)?;
        tracing::debug!(
            "S3 driver created: endpoint={}, bucket={}, addressing={:?}",
            config.resolved_endpoint(),
            config.bucket,
            config.addressing
        );
        Ok(Self {
            bucket,
            bucket_name: config.bucket.clone(),
            page_size: page_size.clamp(1, MAX_LIST_PAGE_SIZE),
        })
    }

    /// 创建S3 Bucket客户端
    fn create_bucket(config: &StorageEndpointConfig) -> Result<Box<Bucket>, StorageError> {
        let credentials = Credentials::new(
            Some(&config.access_key_id),
            Some(&config.secret_access_key),
            config.session_token.as_deref(),
            None,
            None,
        )
        .map_err(|e| StorageError::invalid(format!("invalid S3 credentials: {}", e)))?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.resolved_endpoint(),
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::invalid(format!("failed to create S3 bucket client: {}", e)))?;

        let bucket = match config.addressing {
            AddressingStyle::Path => bucket.with_path_style(),
            AddressingStyle::VirtualHost => bucket,
        };

        Ok(bucket)
    }

    /// A failed list without an HTTP status may hide a missing bucket / 探测存储桶是否存在
    async fn explain_list_failure(&self, err: StorageError) -> StorageError {
        if err.status().is_some() || err.kind() != ErrorKind::Transient {
            return err;
        }
        match self.bucket.exists().await {
            Ok(false) => StorageError::not_found(format!("bucket {} does not exist", self.bucket_name))
                .with_code("NoSuchBucket"),
            _ => err,
        }
    }
}

fn trim_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Read the ETag out of a CompleteMultipartUpload body / 解析完成响应
///
/// S3 may answer 200 with an `<Error>` document when completion fails late.
fn parse_complete_response(status: u16, body: &str) -> Result<Option<String>, StorageError> {
    if body.contains("<Error>") {
        return Err(StorageError::from_remote(status, body));
    }
    if body.trim().is_empty() {
        return Ok(None);
    }
    let parsed: CompleteMultipartUploadResult = quick_xml::de::from_str(body).map_err(|e| {
        StorageError::invalid(format!("malformed CompleteMultipartUpload response: {}", e))
            .with_status(status)
    })?;
    Ok(parsed.etag.map(|e| trim_etag(&e)))
}

#[async_trait]
impl ObjectBackend for S3Driver {
    fn name(&self) -> &str {
        "s3"
    }

    fn bucket(&self) -> &str {
        &self.bucket_name
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage, StorageError> {
        tracing::debug!(
            "S3 ListObjectsV2: prefix={:?}, continuation={}, max_keys={}",
            prefix,
            continuation_token.is_some(),
            max_keys
        );
        let result = self
            .bucket
            .list_page(
                prefix.to_string(),
                None,
                continuation_token.map(str::to_string),
                None,
                Some(max_keys.clamp(1, self.page_size)),
            )
            .await;

        let (result, _) = match result {
            Ok(page) => page,
            Err(e) => return Err(self.explain_list_failure(map_s3_error(e)).await),
        };

        let objects = result
            .contents
            .into_iter()
            .map(|obj| ObjectSummary {
                last_modified: parse_last_modified(&obj.last_modified),
                etag: obj.e_tag.as_deref().map(trim_etag),
                size: obj.size,
                key: obj.key,
            })
            .collect();

        Ok(ListPage {
            objects,
            next_continuation_token: result.next_continuation_token,
            is_truncated: result.is_truncated,
        })
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<Option<String>, StorageError> {
        tracing::debug!("S3 PutObject: key={}, size={}", key, data.len());
        let response = self
            .bucket
            .put_object(key, &data)
            .await
            .map_err(map_s3_error)?;
        let headers = response.headers();
        Ok(headers
            .get("etag")
            .or_else(|| headers.get("ETag"))
            .map(|e| trim_etag(e)))
    }

    async fn get_object(&self, key: &str) -> Result<RemoteObject, StorageError> {
        tracing::debug!("S3 GetObject: key={}", key);
        let response = self
            .bucket
            .get_object_stream(key)
            .await
            .map_err(map_s3_error)?;

        Ok(RemoteObject {
            status: response.status_code,
            content_length: None,
            content_type: None,
            body: response.bytes.map(|chunk| chunk.map_err(map_s3_error)).boxed(),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<bool, StorageError> {
        // DELETE answers 204 either way; HEAD tells whether there was anything to remove
        let head = self
            .bucket
            .head_object(key)
            .await
            .map(|(_, status)| status)
            .map_err(map_s3_error);
        let existed = existed_before_delete(key, head);
        tracing::debug!("S3 DeleteObject: key={}, existed={}", key, existed);
        self.bucket
            .delete_object(key)
            .await
            .map_err(map_s3_error)?;
        Ok(existed)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        let response = self
            .bucket
            .initiate_multipart_upload(key, CONTENT_TYPE)
            .await
            .map_err(map_s3_error)?;
        tracing::debug!("S3 CreateMultipartUpload: key={}, upload_id={}", key, response.upload_id);
        Ok(response.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        let part = self
            .bucket
            .put_multipart_chunk(data.to_vec(), key, part_number, upload_id, CONTENT_TYPE)
            .await
            .map_err(map_s3_error)?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StorageError> {
        let parts: Vec<Part> = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        tracing::debug!(
            "S3 CompleteMultipartUpload: key={}, upload_id={}, parts={}",
            key,
            upload_id,
            parts.len()
        );
        let response = self
            .bucket
            .complete_multipart_upload(key, upload_id, parts)
            .await
            .map_err(map_s3_error)?;
        let body = String::from_utf8_lossy(response.bytes());
        parse_complete_response(response.status_code(), &body)
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        tracing::debug!("S3 AbortMultipartUpload: key={}, upload_id={}", key, upload_id);
        self.bucket
            .abort_upload(key, upload_id)
            .await
            .map_err(map_s3_error)
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<PendingUpload>, StorageError> {
        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        let results = self
            .bucket
            .list_multiparts_uploads(prefix, None)
            .await
            .map_err(map_s3_error)?;

        Ok(results
            .into_iter()
            .flat_map(|r| r.uploads)
            .map(|u| PendingUpload {
                key: u.key,
                upload_id: u.id,
            })
            .collect())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let secs = u32::try_from(expires_in.as_secs())
            .map_err(|_| StorageError::invalid("presign expiry out of range"))?;
        self.bucket
            .presign_get(key, secs, None)
            .await
            .map_err(map_s3_error)
    }

    async fn close(&self) {
        tracing::debug!("S3 driver for bucket {} closed", self.bucket_name);
    }
}

/// Interpret the HEAD sent ahead of a delete / 删除前HEAD结果
///
/// Without `s3:ListBucket` S3 answers 403 rather than 404 for an absent key, so a failed
/// HEAD only means "unknown". The DELETE alone decides whether the call succeeds.
fn existed_before_delete(key: &str, head: Result<u16, StorageError>) -> bool {
    match head {
        Ok(status) => (200..300).contains(&status),
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::debug!("S3 HeadObject before delete failed: key={}, error={}", key, e);
            false
        }
    }
}
