use bytes::Bytes;

use crate::caching::CacheEntry;

/// A stage applied to freshly downloaded bytes before they are decoded.
///
/// Stages run in registration order, each receiving the previous stage's
/// output. The persistent cache stores the bytes produced by the last stage,
/// so a later disk hit decodes identically without re-running the chain.
/// Bytes served from the persistent cache are therefore never processed
/// again.
pub trait TransformStage: Send + Sync {
    fn process(&self, bytes: Bytes) -> CacheEntry<Bytes>;
}
