use anyhow::Context;
use clap::Parser;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bucket_facade::config;
use bucket_facade::storage::{MemoryBackend, ProgressCallback, StorageFacade, UploadProgress};

const NEW_FILE_KEY: &str = "test/chunli.jpeg";
const LIST_PREFIX: &str = "test/";
const DEFAULT_SOURCE: &str = "./test.jpg";
/// Bucket used by `--memory` when `S3_BUCKET` is unset / 内存模式默认存储桶
const DEFAULT_MEMORY_BUCKET: &str = "app-emea-prod-photo";
const SIGNED_URL_TTL_SECS: i64 = 3600;
const SEPARATOR: &str =
    "********************************************************************************";

/// Command line arguments / 命令行参数
#[derive(Parser, Debug)]
#[command(name = "bucket-facade", version, about = "Object storage walkthrough: list, upload, fetch, sign and delete", long_about = None)]
struct Args {
    /// Run against an in-process bucket instead of S3
    #[arg(long)]
    memory: bool,

    /// File to upload
    #[arg(default_value = DEFAULT_SOURCE)]
    source: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bucket_facade=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "bucket-facade v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME")
    );

    let args = Args::parse();

    let facade = if args.memory {
        let tuning = config::load_tuning(&config::get_config_path())?;
        let bucket = std::env::var(config::ENV_BUCKET)
            .unwrap_or_else(|_| DEFAULT_MEMORY_BUCKET.to_string());
        tracing::info!("Using in-memory bucket {}", bucket);
        StorageFacade::new(Arc::new(MemoryBackend::new(bucket)), &tuning)
    } else {
        let app_config = config::load_config().context("failed to load configuration")?;
        tracing::info!(
            "Using S3 endpoint {} with bucket {}",
            app_config.storage.resolved_endpoint(),
            app_config.storage.bucket
        );
        StorageFacade::connect(&app_config.storage, &app_config.tuning)?
    };

    // Ctrl-C cancels whatever operation is in flight / Ctrl-C取消当前操作
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let result = run(&facade, &args.source, &cancel).await;
    facade.shutdown().await;
    result
}

async fn run(facade: &StorageFacade, source: &Path, cancel: &CancellationToken) -> anyhow::Result<()> {
    let listing = facade.list(LIST_PREFIX, cancel).await?;
    println!("The bucket contains the following...");
    println!("{}", serde_json::to_string_pretty(&listing.objects)?);
    println!("{}", SEPARATOR);

    println!("Uploading a new file with key {}...", NEW_FILE_KEY);
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("failed to open {}", source.display()))?;
    let size_hint = file.metadata().await.ok().map(|m| m.len());
    let progress: ProgressCallback = Arc::new(|p: UploadProgress| {
        tracing::debug!(
            "Upload progress: {} of {:?} bytes, {} parts",
            p.bytes_completed,
            p.total_bytes,
            p.parts_completed
        );
    });
    let uploaded = facade
        .upload(NEW_FILE_KEY, file, size_hint, Some(progress), cancel)
        .await?;
    println!("{}", serde_json::to_string_pretty(&uploaded)?);
    println!("Uploading success!");
    println!("{}", SEPARATOR);

    let listing = facade.list(LIST_PREFIX, cancel).await?;
    println!("The bucket now contains the following objects...");
    println!("{}", serde_json::to_string_pretty(&listing.objects)?);
    println!("{}", SEPARATOR);

    let content = facade.fetch(NEW_FILE_KEY, cancel).await?;
    let filename = format!(
        "downloaded-{}-{}.jpeg",
        Utc::now().timestamp_millis(),
        rand::random::<f64>() * 10.0
    );
    tokio::fs::write(&filename, &content.data)
        .await
        .with_context(|| format!("failed to write {}", filename))?;
    println!("Copy of file from S3 stored in {}", filename);
    println!("{}", SEPARATOR);

    println!("Generating a public accessible signed key");
    let grant = facade
        .sign_access_url(NEW_FILE_KEY, chrono::Duration::seconds(SIGNED_URL_TTL_SECS))
        .await?;
    println!("Signed Key URL is: {}", grant.url);
    println!("{}", SEPARATOR);

    println!("deleting '{}'...", NEW_FILE_KEY);
    let deleted = facade.delete(NEW_FILE_KEY, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&deleted)?);
    println!("Object '{}' deleted!", NEW_FILE_KEY);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_and_memory_flag() {
        let args = Args::try_parse_from(["bucket-facade"]).unwrap();
        assert!(!args.memory);
        assert_eq!(args.source, PathBuf::from(DEFAULT_SOURCE));

        let args = Args::try_parse_from(["bucket-facade", "--memory", "photo.jpg"]).unwrap();
        assert!(args.memory);
        assert_eq!(args.source, PathBuf::from("photo.jpg"));

        assert!(Args::try_parse_from(["bucket-facade", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["bucket-facade", "a.jpg", "b.jpg"]).is_err());
    }
}
