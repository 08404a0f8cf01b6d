//! Service which handles downloading of remote image bytes.
//!
//! The service is deliberately simple: one GET per request, bounded by the
//! configured deadline, no retries (a failed download fails the request it
//! belongs to).

use std::time::Duration;

use bytes::Bytes;

use crate::caching::{CacheEntry, CacheError};
use crate::config::DownloadTimeouts;

mod http;
mod transform;

pub use self::http::HttpDownloader;
pub use self::transform::TransformStage;

/// A service which downloads image bytes over HTTP.
#[derive(Debug)]
pub struct DownloadService {
    timeouts: DownloadTimeouts,
    http: HttpDownloader,
}

impl DownloadService {
    pub fn new(timeouts: DownloadTimeouts) -> Self {
        let client = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(timeouts.connect)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap();

        Self {
            timeouts,
            http: HttpDownloader::new(client),
        }
    }

    /// Downloads the full body at `url`, bounded by the configured deadline.
    pub async fn download(&self, url: &str) -> CacheEntry<Bytes> {
        let timeout = self.timeouts.max_download;
        let job = self.http.download_source(url);

        let result = match tokio::time::timeout(timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        match &result {
            Ok(bytes) => {
                tracing::debug!(len = bytes.len(), "File `{url}` fetched successfully")
            }
            Err(err) => tracing::debug!("File `{url}` fetching failed: {err}"),
        }

        result
    }
}
