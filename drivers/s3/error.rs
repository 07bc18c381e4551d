//! S3错误映射 / S3 error mapping

use s3::error::S3Error;

use crate::error::StorageError;

/// Map a `rust-s3` error onto the storage taxonomy / 映射S3错误
///
/// With `fail-on-err` every non-2xx response arrives as `HttpFailWithBody`, so the HTTP
/// status and the XML error body are classified in one place. Anything without a status
/// is a transport failure.
pub fn map_s3_error(err: S3Error) -> StorageError {
    match err {
        S3Error::HttpFailWithBody(status, body) => StorageError::from_remote(status, &body),
        S3Error::Credentials(e) => StorageError::unauthorized(format!("S3 credentials error: {}", e)),
        S3Error::MaxExpiry(secs) => {
            StorageError::invalid(format!("presign expiry of {}s exceeds the S3 limit", secs))
        }
        other => StorageError::transient(format!("S3 request failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_http_failures_use_remote_classification() {
        let body = "<Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist</Message></Error>";
        let err = map_s3_error(S3Error::HttpFailWithBody(404, body.to_string()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.code(), Some("NoSuchBucket"));

        let err = map_s3_error(S3Error::HttpFailWithBody(503, String::new()));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_expiry_limit_is_invalid() {
        let err = map_s3_error(S3Error::MaxExpiry(700_000));
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
