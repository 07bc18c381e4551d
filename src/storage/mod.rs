//! Storage core / 存储核心
//!
//! The facade only calls the primitive operations of [`ObjectBackend`]; drivers provide
//! them. Retry, timeouts, cancellation and multipart orchestration live on the facade
//! side so every backend gets them for free.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;

pub mod facade;
pub mod memory;
pub mod multipart;
pub mod retry;

pub use facade::StorageFacade;
pub use memory::{FaultOp, MemoryBackend, PageFault};
pub use retry::RetryPolicy;

/// Longest key S3 accepts, in bytes / 对象键最大长度
pub const MAX_KEY_LEN: usize = 1024;
/// Most parts one multipart upload may have / 最大分片数
pub const MAX_PARTS: u32 = 10_000;

/// 进度回调类型 / Progress callback type
///
/// Advisory only; invoked from the task driving the upload, never affects control flow.
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Validated object key / 对象键
///
/// Non-empty and at most [`MAX_KEY_LEN`] bytes. Slashes are kept verbatim, so `a//b` and
/// `a/b` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        if key.is_empty() {
            return Err(StorageError::invalid("object key must not be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::invalid(format!(
                "object key is {} bytes, limit is {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectKey {
    type Error = StorageError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// One listed object / 对象条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Full listing in remote order / 完整列表
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObjectListing {
    pub objects: Vec<ObjectSummary>,
    /// Remote pages fetched to build the listing / 请求页数
    pub pages: usize,
}

impl ObjectListing {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|o| o.key.as_str())
    }
}

/// One page of a remote listing / 单页列表结果
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// Fetched object body, owned by the caller / 对象内容
#[derive(Debug, Clone)]
pub struct ObjectContent {
    pub key: ObjectKey,
    pub data: Bytes,
    pub content_type: Option<String>,
}

impl ObjectContent {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Streamed GET response as the backend saw it / 远端对象响应
pub struct RemoteObject {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, StorageError>>,
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Time-limited retrieval URL / 预签名URL
#[derive(Debug, Clone, Serialize)]
pub struct SignedUrlGrant {
    pub url: String,
    pub ttl_secs: u64,
    pub expires_at: DateTime<Utc>,
}

/// Upload outcome / 上传结果
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub key: ObjectKey,
    pub etag: Option<String>,
    pub bytes_written: u64,
    /// 0 for a single-request upload / 单次上传为0
    pub parts: u32,
}

/// Delete outcome / 删除结果
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub key: ObjectKey,
    /// false when the key was already absent / 对象原本不存在时为false
    pub existed: bool,
}

/// Upload progress snapshot / 上传进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub bytes_completed: u64,
    /// From the caller's size hint / 来自调用方的大小提示
    pub total_bytes: Option<u64>,
    pub parts_completed: u32,
}

/// Uploaded part awaiting completion / 已上传分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Open multipart upload on the remote / 未完成的分片上传
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingUpload {
    pub key: String,
    pub upload_id: String,
}

/// Object storage backend (primitive operations only) / 对象存储后端接口
///
/// Every error returned is already classified into a [`crate::error::ErrorKind`].
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Backend name / 后端名称
    fn name(&self) -> &str;

    /// Bucket this backend is bound to / 绑定的存储桶
    fn bucket(&self) -> &str;

    /// List one page of keys starting with `prefix` / 列出一页对象
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage, StorageError>;

    /// Single-request upload, returns the ETag if the remote sent one / 单次上传
    async fn put_object(&self, key: &str, data: Bytes) -> Result<Option<String>, StorageError>;

    /// Open an object as a stream / 打开对象流
    async fn get_object(&self, key: &str) -> Result<RemoteObject, StorageError>;

    /// Delete an object; `Ok(false)` when it was already absent / 删除对象
    async fn delete_object(&self, key: &str) -> Result<bool, StorageError>;

    /// Start a multipart upload, returns the upload id / 初始化分片上传
    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart, StorageError>;

    /// Commit parts (ascending part numbers) / 完成分片上传
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StorageError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    /// Open multipart uploads whose key starts with `prefix` / 列出未完成的分片上传
    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<PendingUpload>, StorageError>;

    /// Query-string authenticated GET URL, no network round trip / 生成预签名URL
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;

    /// Release connections / 释放连接
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_object_key_validation() {
        assert_eq!(ObjectKey::new("").unwrap_err().kind(), ErrorKind::Invalid);
        assert_eq!(
            ObjectKey::new("a".repeat(MAX_KEY_LEN + 1)).unwrap_err().kind(),
            ErrorKind::Invalid
        );
        assert!(ObjectKey::new("a".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn test_object_key_keeps_duplicate_slashes() {
        let key = ObjectKey::try_from("test//chunli.jpeg").unwrap();
        assert_eq!(key.as_str(), "test//chunli.jpeg");
        assert_ne!(key, ObjectKey::new("test/chunli.jpeg").unwrap());
    }
}
