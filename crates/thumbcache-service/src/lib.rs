//! # thumbcache
//!
//! A dual-layer cache for remotely fetched images: an in-memory cache of
//! decoded assets in front of a persistent, journal-backed byte store. The
//! [`ImageLoader`](loader::ImageLoader) coordinates lookups, downloads,
//! decoding and delivery, deduplicates concurrent fetches per cache key, and
//! drops results whose display target has since been bound to a different
//! URL.

pub mod caching;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod loader;
pub mod logging;
pub mod utils;

pub use caching::{CacheEntry, CacheError, CacheKey, MemoryCache, PersistentCache};
pub use config::Config;
pub use dispatch::WorkerPool;
pub use loader::{AssetDecoder, DisplayTarget, ImageLoader, PlaceholderRef};
