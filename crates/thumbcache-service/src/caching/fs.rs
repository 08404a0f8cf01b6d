//! The persistent cache layer.
//!
//! Values are stored as one file per key inside the cache directory, named
//! by the key's hex rendering. Record lifecycle is tracked in an append-only
//! journal that is replayed on open to rebuild the index without reading any
//! value bytes. A value write goes to a temp file in the `tmp` subdirectory,
//! is fsynced, and atomically renamed into place before its `CLEAN` entry is
//! committed. A crash at any point in that sequence leaves either the
//! previously committed bytes or no record at all visible to readers, never
//! a torn write.
//!
//! The journal format is line based:
//!
//! ```text
//! thumbcache.journal 1
//! DIRTY <key>
//! CLEAN <key> <len>
//! REMOVE <key>
//! ```
//!
//! `DIRTY` marks a write in progress, `CLEAN` commits it with the value
//! length, `REMOVE` retires a record. A `DIRTY` entry without a later
//! `CLEAN` marks an interrupted write; its record is dropped and its value
//! file deleted during replay. The journal is rewritten compactly at open,
//! and again whenever its entry count grows far past the number of live
//! records.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;

use crate::dispatch::WorkerPool;

use super::{CacheEntry, CacheError, CacheKey};

/// First line of every journal file.
const JOURNAL_HEADER: &str = "thumbcache.journal 1";

/// Name of the journal file inside the cache directory.
const JOURNAL_FILE: &str = "journal";

/// Name of the directory value writes are staged in.
const TMP_DIR: &str = "tmp";

/// Minimum number of journal entries before a compaction is considered.
const COMPACT_MIN_OPS: usize = 2000;

/// On-disk key→bytes store with journal-based crash recovery and
/// byte-budgeted LRU eviction.
///
/// The index, journal and size accounting are only touched while holding the
/// store lock, so a `put` together with its eviction and journal entries is
/// atomic with respect to all other readers and writers.
///
/// Access order is tracked in memory only; it resets to journal order on
/// open.
pub struct DiskCache {
    dir: PathBuf,
    tmp_dir: PathBuf,
    budget: u64,
    compact_threshold: usize,
    state: Mutex<DiskState>,
}

struct DiskState {
    /// Live committed records and their value lengths, in access order.
    index: LruCache<CacheKey, u64>,
    total_bytes: u64,
    journal: File,
    /// Journal entries written since the journal was last rewritten.
    journal_ops: usize,
}

impl DiskCache {
    /// Opens the store in `dir`, bounded by `budget` bytes.
    ///
    /// Replays the journal to rebuild the index, dropping any record whose
    /// write was interrupted or whose value file is missing or has an
    /// unexpected size, and deleting stray value files. The journal is then
    /// rewritten compactly and the store evicted down to budget.
    pub fn open(dir: PathBuf, budget: u64) -> CacheEntry<Self> {
        let tmp_dir = dir.join(TMP_DIR);
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&tmp_dir)?;

        let journal_path = dir.join(JOURNAL_FILE);
        let replay = match read_journal(&journal_path) {
            Ok(replay) => replay,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Replay::default(),
            Err(err) => {
                // An unreadable journal means no record can be trusted;
                // restart with an empty index and let the scan below delete
                // the stale value files.
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    path = %journal_path.display(),
                    "discarding unreadable cache journal",
                );
                Replay::default()
            }
        };

        let mut index: LruCache<CacheKey, u64> = LruCache::unbounded();
        for (key, len) in replay.in_access_order() {
            index.put(key, len);
        }

        // Validate committed records against the value files on disk without
        // reading their contents.
        let mut total_bytes = 0u64;
        let records: Vec<(CacheKey, u64)> =
            index.iter().map(|(key, len)| (key.clone(), *len)).collect();
        for (key, len) in records {
            let path = dir.join(key.file_name());
            let ok = path
                .metadata()
                .map(|meta| meta.is_file() && meta.len() == len)
                .unwrap_or(false);
            if ok {
                total_bytes += len;
            } else {
                index.pop(&key);
                let _ = fs::remove_file(path);
            }
        }

        // Delete value files that no live record points to. This also covers
        // interrupted writes that were renamed into place but never
        // committed.
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() || entry.file_name() == JOURNAL_FILE {
                continue;
            }
            let live = entry
                .file_name()
                .to_str()
                .and_then(CacheKey::from_hex)
                .is_some_and(|key| index.contains(&key));
            if !live {
                let _ = fs::remove_file(entry.path());
            }
        }
        for entry in fs::read_dir(&tmp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let _ = fs::remove_file(entry.path());
            }
        }

        while total_bytes > budget {
            let Some((key, len)) = index.pop_lru() else {
                break;
            };
            total_bytes -= len;
            let _ = fs::remove_file(dir.join(key.file_name()));
        }

        let journal = rewrite_journal(&dir, &tmp_dir, &index)?;
        let journal_ops = index.len();

        tracing::debug!(
            path = %dir.display(),
            records = index.len(),
            total_bytes,
            "opened persistent cache",
        );

        Ok(DiskCache {
            dir,
            tmp_dir,
            budget,
            compact_threshold: COMPACT_MIN_OPS,
            state: Mutex::new(DiskState {
                index,
                total_bytes,
                journal,
                journal_ops,
            }),
        })
    }

    /// Reads the committed bytes for `key`, marking the record as most
    /// recently used.
    pub fn get(&self, key: &CacheKey) -> CacheEntry<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        if state.index.get(key).is_none() {
            return Ok(None);
        }

        match fs::read(self.dir.join(key.file_name())) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) => {
                // The record was committed but its bytes are gone or
                // unreadable; drop it so the next request re-fetches.
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "failed to read committed cache value",
                );
                self.remove_locked(&mut state, key)?;
                Ok(None)
            }
        }
    }

    /// Commits `bytes` as the value for `key`.
    ///
    /// Only after the atomic rename into place and the `CLEAN` journal entry
    /// is the record visible to [`get`](Self::get). Evicts the least
    /// recently used records while the store is over budget.
    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> CacheEntry {
        let mut state = self.state.lock().unwrap();

        state.append(format_args!("DIRTY {key}"))?;

        let mut temp = tempfile::Builder::new()
            .prefix("put")
            .tempfile_in(&self.tmp_dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(self.dir.join(key.file_name()))
            .map_err(|e| e.error)?;

        let len = bytes.len() as u64;
        state.append(format_args!("CLEAN {key} {len}"))?;
        if let Some(old) = state.index.put(key.clone(), len) {
            state.total_bytes -= old;
        }
        state.total_bytes += len;

        while state.total_bytes > self.budget {
            let Some((evicted, evicted_len)) = state.index.pop_lru() else {
                break;
            };
            state.total_bytes -= evicted_len;
            let _ = fs::remove_file(self.dir.join(evicted.file_name()));
            state.append(format_args!("REMOVE {evicted}"))?;
        }

        self.maybe_compact(&mut state)
    }

    /// Deletes the record for `key`, if any.
    pub fn remove(&self, key: &CacheKey) -> CacheEntry {
        let mut state = self.state.lock().unwrap();
        self.remove_locked(&mut state, key)
    }

    fn remove_locked(&self, state: &mut DiskState, key: &CacheKey) -> CacheEntry {
        if let Some(len) = state.index.pop(key) {
            state.total_bytes -= len;
            let _ = fs::remove_file(self.dir.join(key.file_name()));
            state.append(format_args!("REMOVE {key}"))?;
        }
        Ok(())
    }

    fn maybe_compact(&self, state: &mut DiskState) -> CacheEntry {
        if state.journal_ops < self.compact_threshold
            || state.journal_ops < 2 * state.index.len()
        {
            return Ok(());
        }

        state.journal = rewrite_journal(&self.dir, &self.tmp_dir, &state.index)?;
        state.journal_ops = state.index.len();
        Ok(())
    }

    /// Aggregate size of all committed values, in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    /// Whether a committed record exists, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().unwrap().index.contains(key)
    }

    #[cfg(test)]
    pub(super) fn set_compact_threshold(&mut self, threshold: usize) {
        self.compact_threshold = threshold;
    }
}

impl DiskState {
    fn append(&mut self, entry: fmt::Arguments<'_>) -> io::Result<()> {
        writeln!(self.journal, "{entry}")?;
        self.journal.sync_data()?;
        self.journal_ops += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Replay {
    committed: HashMap<CacheKey, u64>,
    /// Keys in `CLEAN` order, oldest first; later duplicates win.
    order: Vec<CacheKey>,
}

impl Replay {
    /// The committed records, oldest access first.
    fn in_access_order(&self) -> Vec<(CacheKey, u64)> {
        let mut seen = HashSet::new();
        let mut newest_first = Vec::with_capacity(self.committed.len());
        for key in self.order.iter().rev() {
            if let Some(len) = self.committed.get(key) {
                if seen.insert(key.clone()) {
                    newest_first.push((key.clone(), *len));
                }
            }
        }
        newest_first.reverse();
        newest_first
    }
}

/// Replays a journal file into the set of committed records.
///
/// Stops at the first torn or unparsable line; everything before it has been
/// applied already, everything after it cannot be trusted.
fn read_journal(path: &Path) -> io::Result<Replay> {
    let file = File::open(path)?;
    let mut lines = BufReader::new(file).lines();

    match lines.next() {
        Some(Ok(header)) if header == JOURNAL_HEADER => {}
        Some(Ok(_)) | None => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad journal header"));
        }
        Some(Err(err)) => return Err(err),
    }

    let mut replay = Replay::default();
    let mut dirty: HashSet<CacheKey> = HashSet::new();

    for line in lines {
        let line = line?;
        let mut parts = line.split(' ');
        let op = parts.next().unwrap_or_default();
        let Some(key) = parts.next().and_then(CacheKey::from_hex) else {
            break;
        };

        match op {
            "DIRTY" => {
                dirty.insert(key);
            }
            "CLEAN" => {
                let Some(len) = parts.next().and_then(|v| v.parse().ok()) else {
                    break;
                };
                dirty.remove(&key);
                replay.order.push(key.clone());
                replay.committed.insert(key, len);
            }
            "REMOVE" => {
                dirty.remove(&key);
                replay.committed.remove(&key);
            }
            _ => break,
        }
    }

    // A write that never committed invalidates the record entirely; its
    // value file is deleted by the caller's scan.
    for key in dirty {
        replay.committed.remove(&key);
    }

    Ok(replay)
}

/// Writes a fresh journal holding only the live records and atomically swaps
/// it into place, returning the new append handle.
fn rewrite_journal(
    dir: &Path,
    tmp_dir: &Path,
    index: &LruCache<CacheKey, u64>,
) -> io::Result<File> {
    let mut temp = tempfile::Builder::new()
        .prefix("journal")
        .tempfile_in(tmp_dir)?;

    writeln!(temp, "{JOURNAL_HEADER}")?;
    let mut entries: Vec<_> = index.iter().collect();
    entries.reverse(); // oldest access first
    for (key, len) in entries {
        writeln!(temp, "CLEAN {key} {len}")?;
    }
    temp.as_file().sync_all()?;

    temp.persist(dir.join(JOURNAL_FILE)).map_err(|e| e.error)
}

type SharedStore = Shared<BoxFuture<'static, Result<Arc<DiskCache>, CacheError>>>;

/// Asynchronous handle to the persistent cache layer.
///
/// The store is opened exactly once, in the background, on the worker pool.
/// Every access awaits that single-shot open: accesses issued before it
/// completes wait for it instead of failing, and a failed open leaves the
/// store unavailable for the lifetime of the process, with every access
/// degrading to a miss.
#[derive(Clone)]
pub struct PersistentCache {
    store: SharedStore,
}

impl PersistentCache {
    /// Starts opening the store in `dir` on the given pool and returns the
    /// handle immediately.
    pub fn open(pool: &WorkerPool, dir: PathBuf, budget: u64) -> Self {
        let task = pool.spawn(async move { DiskCache::open(dir, budget).map(Arc::new) });
        let store = task
            .map(|res| match res {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "persistent cache open task failed",
                    );
                    Err(CacheError::InternalError)
                }
            })
            .boxed()
            .shared();

        PersistentCache { store }
    }

    async fn store(&self) -> CacheEntry<Arc<DiskCache>> {
        self.store.clone().await
    }

    /// Reads the committed bytes for `key`, awaiting the open if necessary.
    pub async fn get(&self, key: &CacheKey) -> CacheEntry<Option<Vec<u8>>> {
        self.store().await?.get(key)
    }

    /// Commits `bytes` as the value for `key`, awaiting the open if
    /// necessary.
    pub async fn put(&self, key: &CacheKey, bytes: &[u8]) -> CacheEntry {
        self.store().await?.put(key, bytes)
    }

    /// Deletes the record for `key`, awaiting the open if necessary.
    pub async fn remove(&self, key: &CacheKey) -> CacheEntry {
        self.store().await?.remove(key)
    }
}

impl fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.store.peek() {
            None => "opening",
            Some(Ok(_)) => "open",
            Some(Err(_)) => "unavailable",
        };
        f.debug_struct("PersistentCache").field("state", &state).finish()
    }
}
