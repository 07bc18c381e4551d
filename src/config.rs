//! Application configuration module / 应用配置模块
//!
//! Endpoint credentials and the bucket come from the environment (seeded from `.env`
//! when present). Transfer and retry tuning come from an optional `config.json` in the
//! working directory; a missing file means defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Smallest part size S3 accepts for every part but the last / S3最小分片大小
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Largest page S3 returns for ListObjectsV2 / 单页最大条目
pub const MAX_LIST_PAGE_SIZE: usize = 1000;

pub const ENV_ACCESS_KEY_ID: &str = "S3_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "S3_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "S3_SESSION_TOKEN";
pub const ENV_REGION: &str = "S3_REGION";
pub const ENV_BUCKET: &str = "S3_BUCKET";
pub const ENV_ENDPOINT: &str = "S3_ENDPOINT";
pub const ENV_FORCE_PATH_STYLE: &str = "S3_FORCE_PATH_STYLE";

/// Application configuration / 应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage: StorageEndpointConfig,
    pub tuning: TuningConfig,
}

/// URL addressing mode / 寻址方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingStyle {
    /// `https://endpoint/bucket/key`
    Path,
    /// `https://bucket.endpoint/key`
    VirtualHost,
}

/// Remote endpoint and bucket scope, immutable once built / 端点配置
#[derive(Clone)]
pub struct StorageEndpointConfig {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Empty means `https://s3.{region}.amazonaws.com`
    pub endpoint: String,
    pub bucket: String,
    pub addressing: AddressingStyle,
}

impl fmt::Debug for StorageEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageEndpointConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("addressing", &self.addressing)
            .finish()
    }
}

impl StorageEndpointConfig {
    /// Read from process environment / 从环境变量读取
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through an arbitrary variable lookup / 通过查找函数读取
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingVar(name))
        };
        let optional = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let addressing = match optional(ENV_FORCE_PATH_STYLE) {
            None => AddressingStyle::Path,
            Some(v) => {
                if parse_bool(&v).ok_or_else(|| ConfigError::InvalidValue {
                    name: ENV_FORCE_PATH_STYLE,
                    reason: format!("expected a boolean, got {:?}", v),
                })? {
                    AddressingStyle::Path
                } else {
                    AddressingStyle::VirtualHost
                }
            }
        };

        let endpoint = optional(ENV_ENDPOINT).unwrap_or_default();
        if !endpoint.is_empty() {
            url::Url::parse(&endpoint).map_err(|e| ConfigError::InvalidValue {
                name: ENV_ENDPOINT,
                reason: e.to_string(),
            })?;
        }

        Ok(Self {
            region: required(ENV_REGION)?,
            access_key_id: required(ENV_ACCESS_KEY_ID)?,
            secret_access_key: required(ENV_SECRET_ACCESS_KEY)?,
            session_token: optional(ENV_SESSION_TOKEN),
            endpoint,
            bucket: required(ENV_BUCKET)?,
            addressing,
        })
    }

    /// Endpoint URL actually used / 实际端点
    pub fn resolved_endpoint(&self) -> String {
        if self.endpoint.is_empty() {
            format!("https://s3.{}.amazonaws.com", self.region)
        } else {
            self.endpoint.trim_end_matches('/').to_string()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Tuning loaded from `config.json` / 调优配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningConfig {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Transfer configuration / 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Streams at least this long go through multipart upload / 分片上传阈值
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: usize,
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Parts in flight per upload / 每个上传的并发分片数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
}

fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

fn default_concurrency() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_list_page_size() -> usize {
    MAX_LIST_PAGE_SIZE
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            part_size: default_part_size(),
            concurrency: default_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry configuration / 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first / 总尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl TuningConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.multipart_threshold == 0 {
            return Err(invalid("transfer.multipart_threshold", "must be greater than 0"));
        }
        if t.part_size < MIN_PART_SIZE {
            return Err(invalid(
                "transfer.part_size",
                format!("must be at least {} bytes", MIN_PART_SIZE),
            ));
        }
        if t.concurrency == 0 || t.concurrency > 64 {
            return Err(invalid("transfer.concurrency", "must be between 1 and 64"));
        }
        if t.request_timeout_secs == 0 {
            return Err(invalid("transfer.request_timeout_secs", "must be greater than 0"));
        }
        if t.list_page_size == 0 || t.list_page_size > MAX_LIST_PAGE_SIZE {
            return Err(invalid(
                "transfer.list_page_size",
                format!("must be between 1 and {}", MAX_LIST_PAGE_SIZE),
            ));
        }
        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(invalid("retry.base_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.into(),
    }
}

/// Get the config file path / 获取配置文件路径
pub fn get_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load tuning from file, defaults if the file does not exist / 加载调优配置
pub fn load_tuning(path: &Path) -> Result<TuningConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("No config file at {:?}, using defaults", path);
        return Ok(TuningConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let tuning: TuningConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    tuning.validate()?;

    tracing::info!("Loaded configuration from {:?}", path);
    Ok(tuning)
}

/// Load `.env`, the environment and `config.json` / 加载全部配置
pub fn load_config() -> Result<AppConfig, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded environment from {:?}", path);
    }
    let tuning = load_tuning(&get_config_path())?;
    let storage = StorageEndpointConfig::from_env()?;
    Ok(AppConfig { storage, tuning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn base_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_ACCESS_KEY_ID, "AKIDEXAMPLE"),
            (ENV_SECRET_ACCESS_KEY, "wJalrXUtnFEMI"),
            (ENV_REGION, "eu-west-1"),
            (ENV_BUCKET, "app-emea-prod-photo"),
        ]
    }

    #[test]
    fn test_endpoint_from_lookup_defaults_to_path_style() {
        let config = StorageEndpointConfig::from_lookup(lookup(&base_vars())).unwrap();
        assert_eq!(config.addressing, AddressingStyle::Path);
        assert_eq!(config.bucket, "app-emea-prod-photo");
        assert_eq!(config.resolved_endpoint(), "https://s3.eu-west-1.amazonaws.com");
        assert!(config.session_token.is_none());
    }

    #[test]
    fn test_endpoint_virtual_host_and_custom_endpoint() {
        let mut vars = base_vars();
        vars.push((ENV_FORCE_PATH_STYLE, "false"));
        vars.push((ENV_ENDPOINT, "http://localhost:9000/"));
        let config = StorageEndpointConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.addressing, AddressingStyle::VirtualHost);
        assert_eq!(config.resolved_endpoint(), "http://localhost:9000");
    }

    #[test]
    fn test_endpoint_missing_and_invalid_vars() {
        let vars: Vec<_> = base_vars()
            .into_iter()
            .filter(|(k, _)| *k != ENV_SECRET_ACCESS_KEY)
            .collect();
        let err = StorageEndpointConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ENV_SECRET_ACCESS_KEY)));

        let mut vars = base_vars();
        vars.push((ENV_FORCE_PATH_STYLE, "maybe"));
        let err = StorageEndpointConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: ENV_FORCE_PATH_STYLE, .. }));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = StorageEndpointConfig::from_lookup(lookup(&base_vars())).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("wJalrXUtnFEMI"));
        assert!(printed.contains("AKIDEXAMPLE"));
    }

    #[test]
    fn test_load_tuning_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = load_tuning(&dir.path().join("config.json")).unwrap();
        assert_eq!(tuning.transfer.multipart_threshold, 8 * 1024 * 1024);
        assert_eq!(tuning.transfer.concurrency, 4);
        assert_eq!(tuning.retry.base_delay_ms, 200);
    }

    #[test]
    fn test_load_tuning_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"transfer": {"concurrency": 8}, "retry": {"max_attempts": 2}}"#).unwrap();
        let tuning = load_tuning(&path).unwrap();
        assert_eq!(tuning.transfer.concurrency, 8);
        assert_eq!(tuning.transfer.part_size, 8 * 1024 * 1024);
        assert_eq!(tuning.retry.max_attempts, 2);
        assert_eq!(tuning.retry.max_delay_ms, 5_000);
    }

    #[test]
    fn test_load_tuning_rejects_small_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"transfer": {"part_size": 1024}}"#).unwrap();
        let err = load_tuning(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "transfer.part_size", .. }));
    }
}
