//! The load coordinator.
//!
//! Orchestrates, per request: memory lookup, persistent lookup, network
//! fetch, transform, decode, cache population, and delivery back to the
//! display target. Concurrent requests for the same key are deduplicated
//! through a ticket table so that at most one fetch per key is ever in
//! flight, and results that arrive after their target was rebound to a
//! different URL are discarded.
//!
//! Per key the coordinator is a small state machine: idle until a request
//! misses the memory cache, pending while a ticket exists (additional
//! requesters join as waiters), and idle again once the ticket is torn down
//! after all waiters have been notified. No key ever has two pending
//! tickets.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::caching::{CacheEntry, CacheKey, MemoryCache, PersistentCache};
use crate::config::Config;
use crate::dispatch::WorkerPool;
use crate::download::{DownloadService, TransformStage};
use crate::utils::defer;

mod decode;
mod target;
#[cfg(test)]
mod tests;

pub use decode::AssetDecoder;
pub use target::{DisplayTarget, PlaceholderRef};

type Target<A> = Arc<dyn DisplayTarget<Asset = A>>;

/// One registered requester of an in-flight load.
struct Waiter<A> {
    target: Target<A>,
    url: Arc<str>,
}

/// State of one in-flight fetch, shared by all concurrent requesters of the
/// same key. Torn down once every waiter has been notified.
struct Ticket<A> {
    waiters: Vec<Waiter<A>>,
}

/// The image loading service.
///
/// Owns both cache layers, the download service and the worker pool, and is
/// cheap to clone. Lifecycle is explicit: construction starts the one-time
/// background open of the persistent layer, [`wait_idle`](Self::wait_idle)
/// drains in-flight work, and dropping the last clone shuts the worker pool
/// down in the background.
pub struct ImageLoader<D: AssetDecoder> {
    inner: Arc<LoaderInner<D>>,
}

impl<D: AssetDecoder> Clone for ImageLoader<D> {
    fn clone(&self) -> Self {
        ImageLoader {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct LoaderInner<D: AssetDecoder> {
    memory: MemoryCache<D::Asset>,
    persistent: Option<PersistentCache>,
    downloader: DownloadService,
    pool: WorkerPool,
    decoder: D,
    transforms: Vec<Arc<dyn TransformStage>>,
    tickets: Mutex<HashMap<CacheKey, Ticket<D::Asset>>>,
    /// Signalled whenever the ticket table becomes empty.
    idle: Notify,
}

impl<D: AssetDecoder> ImageLoader<D> {
    /// Creates a loader from the given configuration.
    pub fn new(config: &Config, decoder: D) -> io::Result<Self> {
        Self::with_transforms(config, decoder, Vec::new())
    }

    /// Creates a loader that applies `transforms`, in order, to downloaded
    /// bytes before decoding.
    ///
    /// If a persistent cache directory is configured, its one-time open is
    /// started on the worker pool; requests arriving before it finishes wait
    /// for it inside their fetch job, never on the calling thread.
    pub fn with_transforms(
        config: &Config,
        decoder: D,
        transforms: Vec<Arc<dyn TransformStage>>,
    ) -> io::Result<Self> {
        let pool = WorkerPool::new(config.worker_threads)?;
        let persistent = config
            .disk_cache_dir()
            .map(|dir| PersistentCache::open(&pool, dir, config.disk_budget_bytes));

        Ok(ImageLoader {
            inner: Arc::new(LoaderInner {
                memory: MemoryCache::new(config.memory_budget_bytes, D::weight),
                persistent,
                downloader: DownloadService::new(config.timeouts),
                pool,
                decoder,
                transforms,
                tickets: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        })
    }

    /// Requests `url` to be loaded into `target`.
    ///
    /// Returns immediately. A memory cache hit is delivered synchronously on
    /// the calling thread; anything else is dispatched to the worker pool,
    /// with `placeholder` shown in the meantime if one is given. When the
    /// load completes, the asset is only displayed if the target is still
    /// bound to `url`; a target that was rebound in the meantime is left
    /// alone.
    pub fn request(
        &self,
        target: Target<D::Asset>,
        url: &str,
        placeholder: Option<PlaceholderRef>,
    ) {
        let key = match CacheKey::from_url(url) {
            Ok(key) => key,
            Err(_) => {
                // not a loadable URL; leave the target as it is, apart from
                // an optional placeholder
                if let Some(placeholder) = placeholder {
                    target.display_placeholder(placeholder);
                }
                return;
            }
        };

        let url: Arc<str> = url.into();

        if let Some(asset) = self.inner.memory.get(&key) {
            // rebinding on the hit path keeps a still-pending load for this
            // target's previous URL from overwriting the delivery below
            target.set_current_tag(Arc::clone(&url));
            target.display(asset);
            return;
        }

        target.set_current_tag(Arc::clone(&url));
        if let Some(placeholder) = placeholder {
            target.display_placeholder(placeholder);
        }

        let waiter = Waiter {
            target,
            url: Arc::clone(&url),
        };

        let mut tickets = self.inner.tickets.lock().unwrap();
        match tickets.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                // a fetch for this key is already in flight, join it
                entry.get_mut().waiters.push(waiter);
            }
            Entry::Vacant(entry) => {
                entry.insert(Ticket {
                    waiters: vec![waiter],
                });
                drop(tickets);

                let inner = Arc::clone(&self.inner);
                self.inner.pool.spawn(async move {
                    inner.run_ticket(key, url).await;
                });
            }
        }
    }

    /// Waits until no loads are in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking, so a teardown between the check and
            // the await cannot be missed
            notified.as_mut().enable();
            if self.inner.tickets.lock().unwrap().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of keys with an in-flight load.
    pub fn in_flight(&self) -> usize {
        self.inner.tickets.lock().unwrap().len()
    }
}

impl<D: AssetDecoder> LoaderInner<D> {
    async fn run_ticket(self: Arc<Self>, key: CacheKey, url: Arc<str>) {
        // tear the ticket down even if the job panics, so the key cannot get
        // stuck in a pending state
        let teardown = {
            let inner = Arc::clone(&self);
            let key = key.clone();
            defer(move || inner.finish_ticket(&key, None))
        };

        match self.load(&key, &url).await {
            Ok(asset) => self.finish_ticket(&key, Some(asset)),
            Err(err) => {
                tracing::debug!(%url, error = %err, "image load failed");
                self.finish_ticket(&key, None);
            }
        }

        // the ticket is gone by now, the guard's teardown is a no-op
        drop(teardown);
    }

    /// Produces the asset for `key`: persistent cache first, then a network
    /// fetch. Both cache layers are populated before this returns, so
    /// delivery always happens after the write-through.
    async fn load(&self, key: &CacheKey, url: &str) -> CacheEntry<D::Asset> {
        if let Some(persistent) = &self.persistent {
            match persistent.get(key).await {
                Ok(Some(bytes)) => {
                    return match self.decoder.decode(&bytes) {
                        Ok(asset) => {
                            self.memory.put(key.clone(), asset.clone());
                            Ok(asset)
                        }
                        Err(err) => {
                            // committed bytes the codec rejects are corrupt;
                            // drop the record instead of retrying it on every
                            // subsequent request
                            if let Err(remove_err) = persistent.remove(key).await {
                                tracing::error!(
                                    error = %remove_err,
                                    "failed to drop corrupt cache record",
                                );
                            }
                            Err(err)
                        }
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "persistent cache read failed, treating as miss");
                }
            }
        }

        let mut bytes = self.downloader.download(url).await?;
        for stage in &self.transforms {
            bytes = stage.process(bytes)?;
        }
        let asset = self.decoder.decode(&bytes)?;

        if let Some(persistent) = &self.persistent {
            if let Err(err) = persistent.put(key, &bytes).await {
                tracing::warn!(error = %err, "persistent cache write failed");
            }
        }
        self.memory.put(key.clone(), asset.clone());

        Ok(asset)
    }

    /// Removes the ticket for `key` and notifies its waiters in registration
    /// order. Waiters whose target has been rebound to a different URL in
    /// the meantime are skipped.
    fn finish_ticket(&self, key: &CacheKey, asset: Option<D::Asset>) {
        let ticket = {
            let mut tickets = self.tickets.lock().unwrap();
            let ticket = tickets.remove(key);
            if tickets.is_empty() {
                self.idle.notify_waiters();
            }
            ticket
        };

        let Some(ticket) = ticket else { return };
        let Some(asset) = asset else { return };

        for waiter in ticket.waiters {
            if waiter.target.current_tag().as_deref() == Some(&*waiter.url) {
                waiter.target.display(asset.clone());
            }
        }
    }
}
