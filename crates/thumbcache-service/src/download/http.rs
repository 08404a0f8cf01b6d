//! Support to download from HTTP sources.

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use reqwest::{Client, StatusCode, Url, header};

use crate::caching::{CacheEntry, CacheError};

/// User agent sent with every outgoing request.
const USER_AGENT: &str = concat!("thumbcache/", env!("CARGO_PKG_VERSION"));

/// Downloader implementation for plain HTTP(S) sources.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Downloads an image hosted on an HTTP server, collecting the full
    /// response body.
    pub async fn download_source(&self, url: &str) -> CacheEntry<Bytes> {
        let download_url: Url = url.parse().map_err(|_| CacheError::InvalidUrl)?;

        tracing::debug!("Fetching image from `{download_url}`");

        let response = self
            .client
            .get(download_url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CacheError::NotFound);
        }
        if !status.is_success() {
            return Err(CacheError::Download(format!(
                "failed to download: {status}"
            )));
        }

        let mut stream = response.bytes_stream();
        let mut body = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}
