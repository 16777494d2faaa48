//! REST side fetch for artifact references that are URLs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::TransportError;
use crate::metrics::ARTIFACT_BYTES_DOWNLOADED;

/// True if `reference` should be fetched over HTTP instead of chunked over the channel.
///
/// Absolute `http(s)://` URLs and service-relative paths starting with `/` qualify.
pub fn is_rest_reference(reference: &str) -> bool {
    reference.starts_with("http://")
        || reference.starts_with("https://")
        || reference.starts_with('/')
}

/// Streams artifact downloads into a staging directory.
pub struct RestFetcher {
    client: reqwest::Client,
    base_url: String,
    staging_dir: PathBuf,
}

impl RestFetcher {
    /// `base_url` is `server.rest_api_url`; files land in `staging_dir`.
    pub fn new(
        base_url: &str,
        staging_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            staging_dir: staging_dir.into(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Absolute URL for a reference.
    pub fn resolve(&self, reference: &str) -> String {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else {
            format!("{}/{}", self.base_url, reference.trim_start_matches('/'))
        }
    }

    /// Download `reference` to `<staging_dir>/<file_name>`.
    ///
    /// Returns the staged path and the number of bytes written. A partial file
    /// is removed on failure.
    pub async fn fetch_to_file(
        &self,
        reference: &str,
        file_name: &str,
    ) -> Result<(PathBuf, u64), TransportError> {
        let url = self.resolve(reference);
        fs::create_dir_all(&self.staging_dir).await?;
        let path = self.staging_dir.join(file_name);

        debug!(url = %url, "Fetching artifact over REST");
        match self.stream_to(&url, &path).await {
            Ok(bytes) => {
                ARTIFACT_BYTES_DOWNLOADED
                    .with_label_values(&["rest"])
                    .inc_by(bytes);
                info!(url = %url, bytes, "Fetched artifact over REST");
                Ok((path, bytes))
            }
            Err(e) => {
                let _ = fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, path: &Path) -> Result<u64, TransportError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut file = fs::File::create(path).await?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> RestFetcher {
        RestFetcher::new(
            "http://localhost:8000/",
            "/tmp/trellis-staging",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_is_rest_reference() {
        assert!(is_rest_reference("http://cdn/a.glb"));
        assert!(is_rest_reference("https://cdn/a.glb"));
        assert!(is_rest_reference("/download/a.glb"));
        assert!(!is_rest_reference("task-1/mesh"));
        assert!(!is_rest_reference("a.glb"));
    }

    #[test]
    fn test_resolve() {
        let fetcher = fetcher();
        assert_eq!(
            fetcher.resolve("/download/t1/glb"),
            "http://localhost:8000/download/t1/glb"
        );
        assert_eq!(fetcher.resolve("https://cdn/x.mp4"), "https://cdn/x.mp4");
    }

    #[tokio::test]
    async fn test_unreachable_host_cleans_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let fetcher = RestFetcher::new(
            "http://127.0.0.1:9",
            dir.path().join("staging"),
            Duration::from_secs(2),
        )
        .unwrap();

        let result = fetcher.fetch_to_file("/download/t1", "t1_output.glb").await;
        assert!(result.is_err());
        assert!(!dir.path().join("staging").join("t1_output.glb").exists());
    }
}
