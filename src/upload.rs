//! Upload of benchmark artifacts to the results bucket.

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::info;

use crate::TARGET_AWS_REQUEST;

/// Upload a local file to the results bucket under its own file name.
pub async fn upload_file_to_s3(
    config: &aws_config::SdkConfig,
    bucket: &str,
    path: &Path,
) -> Result<()> {
    let client = Client::new(config);
    let key = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("Upload path has no file name")?;

    let body = ByteStream::from_path(path)
        .await
        .with_context(|| format!("Failed to read {} for upload", path.display()))?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .content_type("application/json")
        .send()
        .await
        .with_context(|| format!("Failed to upload {} to bucket '{}'", key, bucket))?;

    info!(
        target: TARGET_AWS_REQUEST,
        "File '{}' uploaded to bucket '{}'", key, bucket
    );
    Ok(())
}
