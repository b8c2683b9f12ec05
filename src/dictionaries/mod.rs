//! Prepared compression dictionaries, shared by all in-flight requests.
//!
//! Preparing a dictionary (building a zstd `CDict`) is expensive, so we do it
//! once per dictionary id and keep the result around until it has gone unused
//! for a while. Concurrent requests for a dictionary we haven't loaded yet
//! share one load.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::format_err;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use zstd::dict::EncoderDictionary;

use crate::Result;

pub use self::{
    assets::{DictionaryAssets, DirectoryAssets},
    hash::{DictionaryHash, HASH_LEN},
};

mod assets;
mod hash;

/// How long a dictionary may sit unused before we evict it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// The minimum time between two opportunistic sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The compression level baked into prepared dictionaries.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 10;

/// Tuning knobs for a [`DictionaryCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    /// Evict entries unused for longer than this.
    pub ttl: Duration,
    /// Run `maybe_sweep` at most this often.
    pub sweep_interval: Duration,
    /// Compression level used when preparing dictionaries.
    pub compression_level: i32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// A loaded and prepared dictionary.
pub struct DictionaryEntry {
    /// The dictionary id.
    id: String,

    /// SHA-256 of the raw dictionary bytes.
    hash: DictionaryHash,

    /// The prepared zstd dictionary. Freed when the last `Arc` goes away,
    /// which can only happen once.
    prepared: EncoderDictionary<'static>,

    /// Size of the raw dictionary.
    size: usize,

    /// Milliseconds since the cache epoch at which we were last used.
    last_used_ms: AtomicU64,

    /// Number of sessions currently using this entry.
    active: AtomicUsize,
}

impl DictionaryEntry {
    /// The dictionary id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The hash of the raw dictionary.
    pub fn hash(&self) -> &DictionaryHash {
        &self.hash
    }

    /// The prepared dictionary, ready to attach to a compression context.
    pub fn prepared(&self) -> &EncoderDictionary<'static> {
        &self.prepared
    }

    /// Is any session currently using this entry?
    pub fn is_pinned(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

impl fmt::Debug for DictionaryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DictionaryEntry")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

/// A dictionary checked out for use by one response. While any pin exists,
/// the entry will not be evicted.
pub struct DictionaryPin {
    entry: Arc<DictionaryEntry>,
    cache: Arc<DictionaryCache>,
}

impl DictionaryPin {
    /// The entry we're pinning.
    pub fn entry(&self) -> &DictionaryEntry {
        &self.entry
    }

    /// Give our cache a chance to sweep. Called when a session finishes.
    pub fn maybe_sweep(&self) {
        self.cache.maybe_sweep();
    }
}

impl fmt::Debug for DictionaryPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DictionaryPin").field(&self.entry).finish()
    }
}

impl Drop for DictionaryPin {
    fn drop(&mut self) {
        // Count the whole session as a use, so a long response doesn't leave
        // the entry looking stale.
        self.cache.touch(&self.entry);
        self.entry.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What `DictionaryCache::try_pin` found.
enum Lookup {
    Pinned(DictionaryPin),
    Mismatch,
    Missing,
}

/// A load shared by everyone waiting for the same id.
type SharedLoad = Shared<BoxFuture<'static, Option<Arc<DictionaryEntry>>>>;

/// Process-wide cache of prepared dictionaries.
pub struct DictionaryCache {
    /// Where we fetch raw dictionaries from.
    assets: Arc<dyn DictionaryAssets>,

    /// Our configuration.
    options: CacheOptions,

    /// Reference point for `last_used_ms`.
    epoch: Instant,

    /// Loaded entries.
    ///
    /// Lock order: `loads` before `entries`.
    entries: Mutex<HashMap<String, Arc<DictionaryEntry>>>,

    /// Loads currently in progress.
    loads: Mutex<HashMap<String, SharedLoad>>,

    /// When we last swept, in milliseconds since `epoch`.
    last_sweep_ms: AtomicU64,
}

impl DictionaryCache {
    /// Create an empty cache.
    pub fn new(
        assets: Arc<dyn DictionaryAssets>,
        options: CacheOptions,
    ) -> Arc<DictionaryCache> {
        describe_counter!(
            "dictproxy.dictionary_loads.total",
            "Dictionary loads, labeled by result"
        );
        describe_counter!(
            "dictproxy.dictionary_evictions.total",
            "Dictionaries evicted after going unused"
        );
        describe_counter!(
            "dictproxy.dictionary_lookups.total",
            "Dictionary lookups, labeled by result"
        );
        describe_histogram!(
            "dictproxy.dictionary_load.duration_seconds",
            Unit::Seconds,
            "Time required to fetch and prepare a dictionary"
        );

        Arc::new(DictionaryCache {
            assets,
            options,
            epoch: Instant::now(),
            entries: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            last_sweep_ms: AtomicU64::new(0),
        })
    }

    /// Our asset store.
    pub fn assets(&self) -> &Arc<dyn DictionaryAssets> {
        &self.assets
    }

    /// Return a usable dictionary if `id` is already loaded and its hash is
    /// exactly `expected`. On a miss, start loading `id` in the background and
    /// return `None`.
    pub fn resolve(
        self: &Arc<Self>,
        id: &str,
        expected: &DictionaryHash,
    ) -> Option<DictionaryPin> {
        match self.try_pin(id, expected) {
            Lookup::Pinned(pin) => Some(pin),
            Lookup::Mismatch => None,
            Lookup::Missing => {
                counter!("dictproxy.dictionary_lookups.total", 1, "result" => "miss");
                // The load is already spawned, so we don't need to poll it.
                let _ = self.start_load(id);
                None
            }
        }
    }

    /// Like `resolve`, but wait for the dictionary to load if necessary.
    #[instrument(level = "debug", skip(self, expected))]
    pub async fn acquire(
        self: &Arc<Self>,
        id: &str,
        expected: &DictionaryHash,
    ) -> Option<DictionaryPin> {
        match self.try_pin(id, expected) {
            Lookup::Pinned(pin) => return Some(pin),
            Lookup::Mismatch => return None,
            Lookup::Missing => {
                counter!("dictproxy.dictionary_lookups.total", 1, "result" => "miss");
            }
        }
        self.start_load(id).await?;
        match self.try_pin(id, expected) {
            Lookup::Pinned(pin) => Some(pin),
            Lookup::Mismatch => None,
            Lookup::Missing => {
                debug!(id, "dictionary was swept before we could use it");
                None
            }
        }
    }

    /// Get the entry for `id`, loading it if we haven't already. Concurrent
    /// callers for the same `id` share a single fetch and preparation.
    ///
    /// Returns `None` if the dictionary can't be loaded. This is never fatal:
    /// a later call will try again.
    pub async fn load(self: &Arc<Self>, id: &str) -> Option<Arc<DictionaryEntry>> {
        let existing = self.lock_entries().get(id).cloned();
        if existing.is_some() {
            return existing;
        }
        self.start_load(id).await
    }

    /// Start loading `id` unless it's loaded or loading already, and return a
    /// future for the result.
    fn start_load(self: &Arc<Self>, id: &str) -> SharedLoad {
        let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(load) = loads.get(id) {
            return load.clone();
        }

        // Check again now that we hold `loads`, because a load may have
        // finished since our caller looked.
        if let Some(entry) = self.lock_entries().get(id) {
            let entry = entry.clone();
            return async move { Some(entry) }.boxed().shared();
        }

        let cache = self.clone();
        let owned_id = id.to_owned();
        let load = async move { cache.run_load(owned_id).await }
            .boxed()
            .shared();
        loads.insert(id.to_owned(), load.clone());

        // Drive the load to completion even if every waiter gives up.
        tokio::spawn(load.clone());
        load
    }

    /// Actually fetch, hash and prepare a dictionary, and install it.
    #[instrument(level = "debug", skip(self))]
    async fn run_load(self: Arc<Self>, id: String) -> Option<Arc<DictionaryEntry>> {
        let start = Instant::now();
        let result = self.fetch_and_prepare(&id).await;

        // Install (or don't) and stop advertising our load in one step, so
        // nobody can see neither.
        let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        let installed = match result {
            Ok((hash, prepared, size)) => {
                let entry = Arc::new(DictionaryEntry {
                    id: id.clone(),
                    hash,
                    prepared,
                    size,
                    last_used_ms: AtomicU64::new(self.now_ms()),
                    active: AtomicUsize::new(0),
                });
                self.lock_entries().insert(id.clone(), entry.clone());
                counter!("dictproxy.dictionary_loads.total", 1, "result" => "loaded");
                histogram!(
                    "dictproxy.dictionary_load.duration_seconds",
                    (Instant::now() - start).as_secs_f64(),
                );
                debug!(?hash, size, "installed dictionary");
                Some(entry)
            }
            Err(err) => {
                counter!("dictproxy.dictionary_loads.total", 1, "result" => "failed");
                warn!("could not load dictionary {:?}: {:#}", id, err);
                None
            }
        };
        loads.remove(&id);
        installed
    }

    /// Fetch the raw bytes for `id` and prepare them.
    async fn fetch_and_prepare(
        &self,
        id: &str,
    ) -> Result<(DictionaryHash, EncoderDictionary<'static>, usize)> {
        let data = self
            .assets
            .fetch(id)
            .await?
            .ok_or_else(|| format_err!("no such dictionary"))?;
        let level = self.options.compression_level;
        let prepared = tokio::task::spawn_blocking(move || {
            let hash = DictionaryHash::digest(&data);
            let prepared = EncoderDictionary::copy(&data, level);
            (hash, prepared, data.len())
        })
        .await?;
        Ok(prepared)
    }

    /// Look up `id` and pin it if its hash matches `expected` byte for byte.
    ///
    /// The pin is taken while we hold `entries`, so `sweep` sees it and can
    /// never evict an entry between our lookup and our pin.
    fn try_pin(self: &Arc<Self>, id: &str, expected: &DictionaryHash) -> Lookup {
        let entries = self.lock_entries();
        let entry = match entries.get(id) {
            Some(entry) => entry,
            None => return Lookup::Missing,
        };
        if entry.hash() != expected {
            counter!("dictproxy.dictionary_lookups.total", 1, "result" => "hash_mismatch");
            debug!(id, ?expected, actual = ?entry.hash(), "dictionary hash mismatch");
            return Lookup::Mismatch;
        }
        counter!("dictproxy.dictionary_lookups.total", 1, "result" => "hit");
        entry.active.fetch_add(1, Ordering::SeqCst);
        self.touch(entry);
        Lookup::Pinned(DictionaryPin {
            entry: entry.clone(),
            cache: self.clone(),
        })
    }

    /// Record a use of `entry`.
    fn touch(&self, entry: &DictionaryEntry) {
        entry.last_used_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// Evict every unpinned entry unused for longer than our TTL. Returns the
    /// number of entries evicted.
    pub fn sweep(&self) -> usize {
        let now = self.now_ms();
        self.last_sweep_ms.store(now, Ordering::SeqCst);
        let ttl = self.options.ttl.as_millis() as u64;
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|id, entry| {
            let idle = now.saturating_sub(entry.last_used_ms.load(Ordering::SeqCst));
            let keep = entry.is_pinned() || idle <= ttl;
            if !keep {
                debug!(id = %id, idle_ms = idle, "evicting dictionary");
            }
            keep
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            counter!("dictproxy.dictionary_evictions.total", evicted as u64);
        }
        evicted
    }

    /// Sweep, but only if we haven't swept in the last `sweep_interval`.
    pub fn maybe_sweep(&self) -> usize {
        let now = self.now_ms();
        let last = self.last_sweep_ms.load(Ordering::SeqCst);
        let interval = self.options.sweep_interval.as_millis() as u64;
        if now.saturating_sub(last) < interval {
            return 0;
        }
        // Only one caller wins the right to sweep.
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }
        self.sweep()
    }

    /// Number of loaded entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Total size of the raw dictionaries behind our loaded entries.
    pub fn total_size(&self) -> usize {
        self.lock_entries().values().map(|entry| entry.size).sum()
    }

    fn now_ms(&self) -> u64 {
        (Instant::now() - self.epoch).as_millis() as u64
    }

    fn lock_entries(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DictionaryEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
