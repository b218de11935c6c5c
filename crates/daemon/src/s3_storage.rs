use aws_sdk_s3::Client;
use slog::{error, info, Logger};
use std::path::Path;

pub struct S3Storage {
    client: Client,
    bucket: String,
    logger: Logger,
}

impl S3Storage {
    pub async fn new(
        bucket: String,
        endpoint: Option<String>,
        logger: Logger,
    ) -> Result<Self, anyhow::Error> {
        let mut config_loader = aws_config::from_env();

        if let Some(endpoint_url) = endpoint {
            info!(logger, "Using custom S3 endpoint: {}", endpoint_url);
            config_loader = config_loader.endpoint_url(endpoint_url);
        }

        let config = config_loader.load().await;
        let client = Client::new(&config);

        info!(logger, "S3 storage initialized for bucket: {}", bucket);

        Ok(Self {
            client,
            bucket,
            logger,
        })
    }

    pub async fn upload_file(&self, local_path: &Path, s3_key: &str) -> Result<(), anyhow::Error> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(local_path).await?;

        info!(
            self.logger,
            "Uploading {} to s3://{}/{}",
            local_path.display(),
            self.bucket,
            s3_key
        );

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(s3_key)
            .body(body)
            .content_type("application/parquet")
            .send()
            .await
            .map_err(|e| {
                error!(self.logger, "Failed to upload to S3: {}", e);
                anyhow::anyhow!("S3 upload failed: {}", e)
            })?;

        info!(
            self.logger,
            "Successfully uploaded to s3://{}/{}", self.bucket, s3_key
        );

        Ok(())
    }

    /// Upload the fused table under `air_quality/<date>/<file name>`
    pub async fn upload_table(
        &self,
        table_path: &Path,
        date: time::Date,
    ) -> Result<String, anyhow::Error> {
        let filename = table_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("invalid table path {}", table_path.display()))?;
        let s3_key = table_key(date, filename);
        self.upload_file(table_path, &s3_key).await?;
        Ok(s3_key)
    }
}

fn table_key(date: time::Date, filename: &str) -> String {
    format!("air_quality/{}/{}", date, filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn keys_are_grouped_by_day() {
        assert_eq!(
            table_key(date!(2024 - 08 - 12), "air_quality.parquet"),
            "air_quality/2024-08-12/air_quality.parquet"
        );
    }
}
