//! # Caching infrastructure
//!
//! Caching is front and center in thumbcache. To keep scrolling lists smooth
//! and to avoid re-downloading anything across process restarts, the loader
//! layers two caches:
//!
//! - An in-memory cache of decoded assets with strict, byte-budgeted LRU
//!   eviction. Hits on this layer are delivered synchronously on the calling
//!   thread.
//! - A persistent cache of raw image bytes with an append-only journal for
//!   crash recovery, its own byte budget and LRU eviction.
//!
//! A load goes through the following steps:
//! - First, it tries the in-memory layer.
//! - On miss, a worker tries to load the bytes from the persistent layer.
//! - On miss, the bytes are downloaded, run through the registered transform
//!   stages, decoded, and written through both layers before delivery.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! The caching layer primarily deals with [`CacheEntry`]s, which are just an
//! alias for a [`Result`] around a [`CacheError`]. [`CacheError`] encodes the
//! terminal reasons a load can fail; none of these ever cross the boundary to
//! a display target.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is the sole identity of an asset in both layers. It is a
//! SHA-256 digest of the source URL, and its hex rendering doubles as the
//! value file name in the persistent store.

mod cache_error;
mod cache_key;
mod fs;
mod memory;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::CacheKey;
pub use fs::{DiskCache, PersistentCache};
pub use memory::MemoryCache;
