use crate::caching::CacheEntry;

/// The image codec seam.
///
/// Turns raw downloaded bytes into a displayable asset. The loader never
/// inspects the bytes itself; whatever the decoder accepts is cached and
/// delivered, whatever it rejects fails the request with
/// [`CacheError::Decode`](crate::caching::CacheError::Decode).
pub trait AssetDecoder: Send + Sync + 'static {
    /// The decoded, displayable form of an image.
    ///
    /// Cloning should be cheap (a handle, not a pixel copy) since every
    /// deduplicated waiter receives its own clone.
    type Asset: Clone + Send + Sync + 'static;

    /// Decodes and validates raw image bytes.
    fn decode(&self, bytes: &[u8]) -> CacheEntry<Self::Asset>;

    /// The decoded byte footprint of an asset, used for memory cache
    /// accounting.
    fn weight(asset: &Self::Asset) -> u64;
}
