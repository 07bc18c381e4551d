//! In-memory object backend / 内存对象存储后端
//!
//! Implements the same protocol semantics the S3 driver relies on: lexicographic paginated
//! listing with opaque continuation tokens, multipart upload state with S3's completion
//! rules, and HMAC-signed expiring GET URLs. Failures can be injected per operation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    CompletedPart, ListPage, ObjectBackend, ObjectSummary, PendingUpload, RemoteObject, MAX_PARTS,
};
use crate::config::{MAX_LIST_PAGE_SIZE, MIN_PART_SIZE};
use crate::error::StorageError;

type HmacSha256 = Hmac<Sha256>;

const BODY_CHUNK_SIZE: usize = 64 * 1024;
const SIGNED_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Operations that can be made to fail / 可注入故障的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    List,
    Put,
    Get,
    /// Break the body stream after its first chunk / 读取中途断流
    ReadBody,
    Delete,
    CreateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
    ListMultipart,
}

/// Ways a truncated listing page can be malformed / 分页响应异常
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFault {
    /// Truncated page with no continuation token
    DropToken,
    /// Hand back the token the request carried
    RepeatToken,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OpenUpload {
    key: String,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: usize,
    status: u16,
}

#[derive(Debug)]
struct MemoryState {
    bucket_exists: bool,
    objects: BTreeMap<String, StoredObject>,
    uploads: BTreeMap<String, OpenUpload>,
    next_upload_id: u64,
    faults: HashMap<FaultOp, Fault>,
    calls: HashMap<FaultOp, usize>,
    part_delay: Duration,
    get_status: u16,
    page_fault: Option<PageFault>,
}

/// In-memory bucket / 内存存储桶
pub struct MemoryBackend {
    bucket: String,
    page_size: usize,
    signing_key: [u8; 32],
    state: Mutex<MemoryState>,
    body_chunks_read: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            page_size: MAX_LIST_PAGE_SIZE,
            signing_key: rand::random(),
            state: Mutex::new(MemoryState {
                bucket_exists: true,
                objects: BTreeMap::new(),
                uploads: BTreeMap::new(),
                next_upload_id: 1,
                faults: HashMap::new(),
                calls: HashMap::new(),
                part_delay: Duration::ZERO,
                get_status: 200,
                page_fault: None,
            }),
            body_chunks_read: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap every page at `page_size` regardless of what the caller asks / 限制单页大小
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Behave as if the bucket was never created / 模拟存储桶不存在
    pub fn without_bucket(self) -> Self {
        self.state.lock().bucket_exists = false;
        self
    }

    /// Fail the next `times` calls of `op` with HTTP `status` / 注入故障
    pub fn inject_failure(&self, op: FaultOp, times: usize, status: u16) {
        self.state
            .lock()
            .faults
            .insert(op, Fault { remaining: times, status });
    }

    /// Delay every part upload, to widen the window for cancellation / 分片上传延迟
    pub fn set_part_delay(&self, delay: Duration) {
        self.state.lock().part_delay = delay;
    }

    /// Status reported by every GET from now on; the body is still attached / GET响应状态
    pub fn set_get_status(&self, status: u16) {
        self.state.lock().get_status = status;
    }

    pub fn set_page_fault(&self, fault: Option<PageFault>) {
        self.state.lock().page_fault = fault;
    }

    /// Body chunks handed out by GET streams so far / 已读取的响应块数
    pub fn body_chunks_read(&self) -> usize {
        self.body_chunks_read.load(Ordering::SeqCst)
    }

    /// Calls made to `op`, failed ones included / 调用次数
    pub fn call_count(&self, op: FaultOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Seed an object without going through the protocol / 直接写入对象
    pub fn insert_object(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        let data = data.into();
        let stored = StoredObject {
            etag: content_etag(&data),
            data,
            last_modified: Utc::now(),
        };
        self.state.lock().objects.insert(key.into(), stored);
    }

    /// Dereference a URL from [`ObjectBackend::presign_get`] at instant `now` / 访问预签名URL
    ///
    /// Tampered or expired URLs fail with `Unauthorized`, like S3 answering 403.
    pub fn fetch_signed(&self, signed_url: &str, now: DateTime<Utc>) -> Result<Bytes, StorageError> {
        // Keys are opaque: the path is read verbatim, `.` and `..` segments included
        let rest = signed_url
            .strip_prefix("memory://")
            .and_then(|rest| rest.strip_prefix(self.bucket.as_str()))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| StorageError::invalid("signed URL does not address this bucket"))?;
        let (raw_path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let key = decode_key(raw_path)?;

        let mut date = None;
        let mut expires = None;
        let mut signature = None;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "X-Amz-Date" => date = Some(value.into_owned()),
                "X-Amz-Expires" => expires = Some(value.into_owned()),
                "X-Amz-Signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let (date, expires, signature) = match (date, expires, signature) {
            (Some(d), Some(e), Some(s)) => (d, e, s),
            _ => return Err(access_denied("signed URL is missing authentication parameters")),
        };

        let provided = hex::decode(&signature).map_err(|_| access_denied("malformed signature"))?;
        let mut mac = self.mac()?;
        mac.update(self.string_to_sign(&key, &date, &expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| access_denied("signature does not match"))?;

        let issued = NaiveDateTime::parse_from_str(&date, SIGNED_DATE_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| access_denied("malformed X-Amz-Date"))?;
        let expires: i64 = expires
            .parse()
            .map_err(|_| access_denied("malformed X-Amz-Expires"))?;
        if now > issued + chrono::Duration::seconds(expires) {
            return Err(access_denied("request has expired"));
        }

        self.state
            .lock()
            .objects
            .get(&key)
            .map(|o| o.data.clone())
            .ok_or_else(|| no_such_key(&key))
    }

    fn mac(&self) -> Result<HmacSha256, StorageError> {
        HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| StorageError::invalid(format!("HMAC key error: {}", e)))
    }

    fn string_to_sign(&self, key: &str, date: &str, expires: &str) -> String {
        format!("GET\n/{}/{}\n{}\n{}", self.bucket, key, date, expires)
    }

    /// Count the call, then fail it if a fault is armed / 计数并检查故障
    fn enter(&self, op: FaultOp) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(fault) = state.faults.get_mut(&op) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(StorageError::from_remote(fault.status, ""));
            }
        }
        if !state.bucket_exists {
            return Err(StorageError::not_found(format!("bucket {} does not exist", self.bucket))
                .with_status(404)
                .with_code("NoSuchBucket"));
        }
        Ok(())
    }

    fn take_read_fault(&self) -> bool {
        let mut state = self.state.lock();
        match state.faults.get_mut(&FaultOp::ReadBody) {
            Some(fault) if fault.remaining > 0 => {
                fault.remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

fn content_etag(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..16])
}

fn access_denied(message: &str) -> StorageError {
    StorageError::unauthorized(message)
        .with_status(403)
        .with_code("AccessDenied")
}

fn no_such_key(key: &str) -> StorageError {
    StorageError::not_found(format!("no such key: {}", key))
        .with_status(404)
        .with_code("NoSuchKey")
}

fn no_such_upload(upload_id: &str) -> StorageError {
    StorageError::conflict(format!("no such upload: {}", upload_id))
        .with_status(404)
        .with_code("NoSuchUpload")
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_key(path: &str) -> Result<String, StorageError> {
    let segments = path
        .split('/')
        .map(|segment| urlencoding::decode(segment).map(|s| s.into_owned()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::invalid(format!("malformed key in signed URL: {}", e)))?;
    Ok(segments.join("/"))
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage, StorageError> {
        self.enter(FaultOp::List)?;

        let start_after = match continuation_token {
            Some(token) => {
                let raw = hex::decode(token)
                    .map_err(|_| StorageError::invalid("invalid continuation token").with_status(400))?;
                Some(String::from_utf8(raw).map_err(|_| {
                    StorageError::invalid("invalid continuation token").with_status(400)
                })?)
            }
            None => None,
        };
        let limit = max_keys.clamp(1, self.page_size);

        let state = self.state.lock();
        let mut matching = state
            .objects
            .range::<String, _>(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| start_after.as_ref().map_or(true, |after| k.as_str() > after.as_str()));

        let mut objects = Vec::new();
        for (key, object) in matching.by_ref().take(limit) {
            objects.push(ObjectSummary {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
                etag: Some(object.etag.clone()),
            });
        }
        let is_truncated = matching.next().is_some();
        let next_continuation_token = if is_truncated {
            match state.page_fault {
                Some(PageFault::DropToken) => None,
                Some(PageFault::RepeatToken) if continuation_token.is_some() => {
                    continuation_token.map(str::to_string)
                }
                _ => objects.last().map(|o| hex::encode(o.key.as_bytes())),
            }
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_continuation_token,
            is_truncated,
        })
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<Option<String>, StorageError> {
        self.enter(FaultOp::Put)?;
        let etag = content_etag(&data);
        self.state.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(Some(etag))
    }

    async fn get_object(&self, key: &str) -> Result<RemoteObject, StorageError> {
        self.enter(FaultOp::Get)?;
        let (data, status) = {
            let state = self.state.lock();
            let data = state
                .objects
                .get(key)
                .map(|o| o.data.clone())
                .ok_or_else(|| no_such_key(key))?;
            (data, state.get_status)
        };

        let len = data.len();
        let mut chunks: Vec<Result<Bytes, StorageError>> = (0..len)
            .step_by(BODY_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + BODY_CHUNK_SIZE).min(len))))
            .collect();
        if self.take_read_fault() {
            chunks.truncate(1);
            chunks.push(Err(StorageError::transient("connection reset while reading body")));
        }

        let reads = Arc::clone(&self.body_chunks_read);
        Ok(RemoteObject {
            status,
            content_length: Some(len as u64),
            content_type: Some("application/octet-stream".to_string()),
            body: stream::iter(chunks)
                .inspect(move |_| {
                    reads.fetch_add(1, Ordering::SeqCst);
                })
                .boxed(),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<bool, StorageError> {
        self.enter(FaultOp::Delete)?;
        Ok(self.state.lock().objects.remove(key).is_some())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        self.enter(FaultOp::CreateMultipart)?;
        let mut state = self.state.lock();
        let upload_id = format!("mem-upload-{}", state.next_upload_id);
        state.next_upload_id += 1;
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                ..Default::default()
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.enter(FaultOp::UploadPart)?;
        if part_number == 0 || part_number > MAX_PARTS {
            return Err(StorageError::invalid(format!("part number {} out of range", part_number))
                .with_status(400)
                .with_code("InvalidArgument"));
        }

        let delay = self.state.lock().part_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let etag = content_etag(&data);
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        upload.parts.insert(part_number, (data, etag.clone()));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StorageError> {
        self.enter(FaultOp::CompleteMultipart)?;
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(StorageError::invalid("no parts to complete")
                .with_status(400)
                .with_code("MalformedXML"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::invalid("parts must be in ascending order")
                .with_status(400)
                .with_code("InvalidPartOrder"));
        }

        let mut body = BytesMut::new();
        let mut digest = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            let (data, etag) = upload
                .parts
                .get(&part.part_number)
                .filter(|(_, etag)| *etag == part.etag)
                .ok_or_else(|| {
                    StorageError::invalid(format!("part {} was not uploaded", part.part_number))
                        .with_status(400)
                        .with_code("InvalidPart")
                })?;
            if i + 1 < parts.len() && data.len() < MIN_PART_SIZE {
                return Err(StorageError::invalid(format!(
                    "part {} is smaller than the minimum part size",
                    part.part_number
                ))
                .with_status(400)
                .with_code("EntityTooSmall"));
            }
            body.extend_from_slice(data);
            digest.update(etag.as_bytes());
        }

        let etag = format!("{}-{}", hex::encode(&digest.finalize()[..16]), parts.len());
        state.uploads.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: body.freeze(),
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(Some(etag))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.enter(FaultOp::AbortMultipart)?;
        let mut state = self.state.lock();
        let owned = state.uploads.get(upload_id).map_or(false, |u| u.key == key);
        if !owned {
            return Err(no_such_upload(upload_id));
        }
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<PendingUpload>, StorageError> {
        self.enter(FaultOp::ListMultipart)?;
        let state = self.state.lock();
        let mut pending: Vec<PendingUpload> = state
            .uploads
            .iter()
            .filter(|(_, u)| u.key.starts_with(prefix))
            .map(|(id, u)| PendingUpload {
                key: u.key.clone(),
                upload_id: id.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.upload_id.cmp(&b.upload_id)));
        Ok(pending)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let date = Utc::now().format(SIGNED_DATE_FORMAT).to_string();
        let expires = expires_in.as_secs().to_string();
        let mut mac = self.mac()?;
        mac.update(self.string_to_sign(key, &date, &expires).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!(
            "memory://{}/{}?X-Amz-Date={}&X-Amz-Expires={}&X-Amz-Signature={}",
            self.bucket,
            encode_key(key),
            date,
            expires,
            signature
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_list_page_tokens_resume_after_last_key() {
        let backend = MemoryBackend::new("bucket").with_page_size(2);
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            backend.insert_object(key, "x");
        }

        let first = backend.list_page("a/", None, 1000).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        assert!(first.is_truncated);
        let token = first.next_continuation_token.unwrap();

        let second = backend.list_page("a/", Some(&token), 1000).await.unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "a/3");
        assert!(!second.is_truncated);
        assert!(second.next_continuation_token.is_none());

        let err = backend.list_page("a/", Some("zz-not-hex"), 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_complete_rejects_bad_part_lists() {
        let backend = MemoryBackend::new("bucket");
        let id = backend.create_multipart_upload("big").await.unwrap();
        let small = backend
            .upload_part("big", &id, 1, Bytes::from_static(b"tiny"))
            .await
            .unwrap();
        let last = backend
            .upload_part("big", &id, 2, Bytes::from_static(b"tail"))
            .await
            .unwrap();

        let err = backend
            .complete_multipart_upload("big", &id, vec![last.clone(), small.clone()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("InvalidPartOrder"));

        let err = backend
            .complete_multipart_upload("big", &id, vec![small, last])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("EntityTooSmall"));

        let err = backend
            .complete_multipart_upload("big", "mem-upload-999", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_signed_url_rejects_tampering() {
        let backend = MemoryBackend::new("bucket");
        backend.insert_object("test/a b.jpeg", "content");
        let url = backend
            .presign_get("test/a b.jpeg", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(backend.fetch_signed(&url, Utc::now()).unwrap(), Bytes::from("content"));

        let tampered = url.replace("X-Amz-Expires=60", "X-Amz-Expires=6000");
        let err = backend.fetch_signed(&tampered, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_signed_url_keeps_dot_segments() {
        let backend = MemoryBackend::new("bucket");
        backend.insert_object("test/../chunli.jpeg", "dots");
        backend.insert_object("chunli.jpeg", "plain");
        let url = backend
            .presign_get("test/../chunli.jpeg", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(backend.fetch_signed(&url, Utc::now()).unwrap(), Bytes::from("dots"));

        let unsigned = url.split_once('?').unwrap().0;
        let err = backend.fetch_signed(unsigned, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = backend
            .fetch_signed(&url.replace("memory://bucket/", "memory://other/"), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let backend = MemoryBackend::new("bucket");
        backend.inject_failure(FaultOp::Delete, 1, 503);
        let err = backend.delete_object("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(!backend.delete_object("k").await.unwrap());
        assert_eq!(backend.call_count(FaultOp::Delete), 2);
    }
}
