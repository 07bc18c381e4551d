//! Error taxonomy / 错误分类
//!
//! Every failure that leaves the facade is a [`StorageError`] with one of a closed set of
//! [`ErrorKind`]s. Remote HTTP statuses and S3 error codes are mapped to kinds in
//! [`StorageError::from_remote`] and nowhere else.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failure kinds / 错误种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bucket or object does not exist / 不存在
    NotFound,
    /// Credentials rejected / 凭证被拒绝
    Unauthorized,
    /// Caller misuse or malformed remote response / 非法输入
    Invalid,
    /// Network, timeout or 5xx; retryable / 临时错误，可重试
    Transient,
    /// Cancelled by the caller / 已取消
    Aborted,
    /// Concurrent multipart completion race / 冲突
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Transient => "transient",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage error carrying the remote status/code for diagnostics / 存储错误
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", remote_suffix(.status, .code))]
pub struct StorageError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    code: Option<String>,
}

fn remote_suffix(status: &Option<u16>, code: &Option<String>) -> String {
    match (status, code) {
        (Some(s), Some(c)) => format!(" (status={}, code={})", s, c),
        (Some(s), None) => format!(" (status={})", s),
        (None, Some(c)) => format!(" (code={})", c),
        (None, None) => String::new(),
    }
}

/// S3 error document: `<Error><Code>..</Code><Message>..</Message></Error>`
#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

const MAX_BODY_IN_MESSAGE: usize = 256;

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Classify a non-2xx remote response / 将远端错误响应分类
    ///
    /// `body` is the raw response body; when it is an S3 XML error document its `Code`
    /// refines the status-based classification.
    pub fn from_remote(status: u16, body: &str) -> Self {
        let parsed = quick_xml::de::from_str::<RemoteErrorBody>(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|b| b.code.clone())
            .filter(|c| !c.is_empty());
        let message = parsed
            .and_then(|b| b.message)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("remote returned HTTP {}", status)
                } else {
                    trimmed.chars().take(MAX_BODY_IN_MESSAGE).collect()
                }
            });

        let mut err = Self::new(classify(status, code.as_deref()), message).with_status(status);
        err.code = code;
        err
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Only transient failures are eligible for retry / 仅临时错误可重试
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Map an HTTP status plus optional S3 error code to a kind / 状态码分类
pub fn classify(status: u16, code: Option<&str>) -> ErrorKind {
    if let Some(code) = code {
        match code {
            "NoSuchUpload" | "OperationAborted" => return ErrorKind::Conflict,
            "NoSuchKey" | "NoSuchBucket" => return ErrorKind::NotFound,
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
            | "InvalidToken" | "TokenRefreshRequired" | "RequestTimeTooSkewed" => {
                return ErrorKind::Unauthorized
            }
            "RequestTimeout" | "SlowDown" | "InternalError" | "ServiceUnavailable" => {
                return ErrorKind::Transient
            }
            _ => {}
        }
    }

    match status {
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::Unauthorized,
        409 => ErrorKind::Conflict,
        408 | 429 | 500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Invalid,
    }
}

/// Configuration loading errors / 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
