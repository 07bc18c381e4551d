//! 分片上传 / Multipart upload engine
//!
//! Parts are read from the source in order, uploaded with bounded concurrency and
//! committed only after every part has succeeded. Any failure, cancellation included,
//! aborts the upload server-side before the error is returned.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::retry::{with_deadline, RetryPolicy};
use super::{
    CompletedPart, ObjectBackend, ObjectKey, ProgressCallback, UploadProgress, UploadResult,
    MAX_PARTS,
};
use crate::error::StorageError;

type PartTask = Result<(CompletedPart, u64), StorageError>;

/// Read until `limit` bytes or end of stream / 读取至多limit字节
///
/// A result shorter than `limit` means the source is exhausted.
pub(crate) async fn read_chunk<R>(
    source: &mut R,
    limit: usize,
    capacity: usize,
    cancel: &CancellationToken,
) -> Result<Bytes, StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(capacity.min(limit));
    let mut limited = (&mut *source).take(limit as u64);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(StorageError::aborted("upload cancelled while reading source"));
        }
        res = limited.read_to_end(&mut buf) => {
            res.map_err(|e| StorageError::invalid(format!("failed to read source stream: {}", e)))?;
        }
    }
    Ok(Bytes::from(buf))
}

/// One multipart upload / 一次分片上传任务
pub(crate) struct MultipartJob {
    pub backend: Arc<dyn ObjectBackend>,
    pub key: ObjectKey,
    pub part_size: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub size_hint: Option<u64>,
    pub progress: Option<ProgressCallback>,
}

impl MultipartJob {
    /// Upload `head` followed by the rest of `source` / 上传全部数据
    pub(crate) async fn run<R>(
        self,
        head: Bytes,
        source: &mut R,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = self.key.as_str();
        let upload_id = with_deadline(
            "create multipart upload",
            self.timeout,
            cancel,
            self.backend.create_multipart_upload(key),
        )
        .await?;
        tracing::debug!("Multipart upload started: key={}, upload_id={}", key, upload_id);

        let outcome = match self.upload_parts(&upload_id, head, source, cancel).await {
            Ok((parts, bytes_written)) => {
                let part_count = parts.len() as u32;
                with_deadline(
                    "complete multipart upload",
                    self.timeout,
                    cancel,
                    self.backend.complete_multipart_upload(key, &upload_id, parts),
                )
                .await
                .map(|etag| (etag, bytes_written, part_count))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((etag, bytes_written, parts)) => {
                tracing::debug!(
                    "Multipart upload completed: key={}, parts={}, bytes={}",
                    key,
                    parts,
                    bytes_written
                );
                Ok(UploadResult {
                    key: self.key.clone(),
                    etag,
                    bytes_written,
                    parts,
                })
            }
            Err(e) => {
                self.abort(&upload_id, &e).await;
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        upload_id: &str,
        head: Bytes,
        source: &mut R,
        cancel: &CancellationToken,
    ) -> Result<(Vec<CompletedPart>, u64), StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        // Child token: stopping siblings must not cancel the caller's token
        let parts_token = cancel.child_token();
        let mut tasks: JoinSet<PartTask> = JoinSet::new();
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut pending = head;
        let mut exhausted = false;
        let mut next_part: u32 = 1;
        let mut bytes_completed: u64 = 0;

        let result: Result<(), StorageError> = 'drive: loop {
            while tasks.len() < self.concurrency {
                let data = match self.next_part_data(&mut pending, &mut exhausted, source, cancel).await {
                    Ok(Some(data)) => data,
                    Ok(None) => break,
                    Err(e) => break 'drive Err(e),
                };
                if next_part > MAX_PARTS {
                    break 'drive Err(StorageError::invalid(format!(
                        "object needs more than {} parts of {} bytes",
                        MAX_PARTS, self.part_size
                    )));
                }
                self.spawn_part(&mut tasks, upload_id, next_part, data, &parts_token);
                next_part += 1;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = tasks.join_next() => Some(joined),
            };
            match joined {
                None => break 'drive Err(StorageError::aborted("multipart upload cancelled")),
                Some(None) => break 'drive Ok(()),
                Some(Some(Ok(Ok((part, len))))) => {
                    bytes_completed += len;
                    completed.push(part);
                    if let Some(progress) = &self.progress {
                        progress(UploadProgress {
                            bytes_completed,
                            total_bytes: self.size_hint,
                            parts_completed: completed.len() as u32,
                        });
                    }
                }
                Some(Some(Ok(Err(e)))) => break 'drive Err(e),
                Some(Some(Err(join_err))) => {
                    break 'drive Err(StorageError::transient(format!(
                        "part upload task failed: {}",
                        join_err
                    )))
                }
            }
        };

        if result.is_err() {
            parts_token.cancel();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        result?;

        completed.sort_by_key(|p| p.part_number);
        Ok((completed, bytes_completed))
    }

    /// Assemble the next part: exactly `part_size` bytes unless the source ends first / 组装下一分片
    async fn next_part_data<R>(
        &self,
        pending: &mut Bytes,
        exhausted: &mut bool,
        source: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if pending.len() < self.part_size && !*exhausted {
            let wanted = self.part_size - pending.len();
            let more = read_chunk(source, wanted, wanted, cancel).await?;
            if more.len() < wanted {
                *exhausted = true;
            }
            if pending.is_empty() {
                *pending = more;
            } else if !more.is_empty() {
                let mut joined = BytesMut::with_capacity(pending.len() + more.len());
                joined.extend_from_slice(pending);
                joined.extend_from_slice(&more);
                *pending = joined.freeze();
            }
        }

        if pending.is_empty() {
            return Ok(None);
        }
        let take = pending.len().min(self.part_size);
        Ok(Some(pending.split_to(take)))
    }

    fn spawn_part(
        &self,
        tasks: &mut JoinSet<PartTask>,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        token: &CancellationToken,
    ) {
        let backend = Arc::clone(&self.backend);
        let key = self.key.as_str().to_string();
        let upload_id = upload_id.to_string();
        let retry = self.retry.clone();
        let timeout = self.timeout;
        let token = token.clone();

        tasks.spawn(async move {
            let len = data.len() as u64;
            let part = retry
                .run("upload part", &token, |attempt| {
                    let data = data.clone();
                    let backend = &backend;
                    let key = &key;
                    let upload_id = &upload_id;
                    let token = &token;
                    async move {
                        tracing::debug!(
                            "Uploading part: key={}, part={}, size={}, attempt={}",
                            key,
                            part_number,
                            data.len(),
                            attempt
                        );
                        with_deadline(
                            "upload part",
                            timeout,
                            token,
                            backend.upload_part(key, upload_id, part_number, data),
                        )
                        .await
                    }
                })
                .await?;
            Ok((part, len))
        });
    }

    /// Abort server-side; runs even when the caller already cancelled / 服务端取消上传
    async fn abort(&self, upload_id: &str, cause: &StorageError) {
        let token = CancellationToken::new();
        let key = self.key.as_str();
        let result = self
            .retry
            .run("abort multipart upload", &token, |_| {
                with_deadline(
                    "abort multipart upload",
                    self.timeout,
                    &token,
                    self.backend.abort_multipart_upload(key, upload_id),
                )
            })
            .await;

        match result {
            Ok(()) => tracing::warn!(
                "Multipart upload aborted: key={}, upload_id={}, cause={}",
                key,
                upload_id,
                cause
            ),
            Err(e) => tracing::error!(
                "Failed to abort multipart upload: key={}, upload_id={}, error={}",
                key,
                upload_id,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use crate::config::MIN_PART_SIZE;

    #[tokio::test]
    async fn test_read_chunk_reports_short_tail() {
        let data: Vec<u8> = (0..10).collect();
        let mut source: &[u8] = &data;
        let token = CancellationToken::new();

        assert_eq!(read_chunk(&mut source, 4, 4, &token).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut source, 4, 4, &token).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut source, 4, 4, &token).await.unwrap().as_ref(), &[8, 9]);
        assert!(read_chunk(&mut source, 4, 4, &token).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_head_shorter_than_part_is_topped_up() {
        let backend = Arc::new(MemoryBackend::new("bucket"));
        let total = 2 * MIN_PART_SIZE + 1;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let head = Bytes::copy_from_slice(&data[..1024]);
        let mut rest: &[u8] = &data[1024..];

        let job = MultipartJob {
            backend: backend.clone(),
            key: ObjectKey::new("big/object").unwrap(),
            part_size: MIN_PART_SIZE,
            concurrency: 2,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::none(),
            size_hint: None,
            progress: None,
        };
        let result = job.run(head, &mut rest, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.parts, 3);
        assert_eq!(result.bytes_written, total as u64);
        let body = backend.get_object("big/object").await.unwrap();
        assert_eq!(body.content_length, Some(total as u64));
    }
}
