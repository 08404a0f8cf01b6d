use std::time::Duration;

use thiserror::Error;

/// An error that happens while fetching, decoding or caching a remote image.
///
/// Every failure is terminal for the one request that hit it; errors are
/// never delivered to a display target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested URL was empty or otherwise unusable as a cache identity.
    ///
    /// The request aborts before any I/O is attempted.
    #[error("invalid url")]
    InvalidUrl,
    /// The image was not found at the remote source.
    #[error("not found")]
    NotFound,
    /// The image could not be fetched due to a transport problem, like
    /// connection loss, DNS resolution, or a non-success server response.
    ///
    /// The attached string contains the innermost error source.
    #[error("download failed: {0}")]
    Download(String),
    /// The download did not complete within the configured deadline.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The image was fetched, but the codec rejected its bytes.
    ///
    /// When the bytes came out of the persistent cache, the record is
    /// additionally removed as corrupt.
    #[error("decode failed: {0}")]
    Decode(String),
    /// An unexpected error in thumbcache itself, including disk I/O failures.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl CacheError {
    /// Creates a [`Download`](Self::Download) error from the innermost source
    /// of an error chain, which tends to carry the actionable message.
    pub(crate) fn download_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        Self::Download(error.to_string())
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// An entry in a cache, containing either `Ok(T)` or the reason why the
/// asset could not be fetched or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
