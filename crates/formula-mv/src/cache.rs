use crate::bitmap::BitVec;
use crate::error::{MvError, MvResult};
use lru::LruCache;
use std::fmt;
use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};

/// Time source for entry expiry.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().expect("clock mutex poisoned") += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().expect("clock mutex poisoned")
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries held in memory (default: 200).
    pub capacity: usize,
    /// Lifetime of an entry, measured from insertion (default: 5 minutes).
    pub ttl: Duration,
    /// Entries kept in the swap tier; those swapped out longest ago are dropped beyond this.
    /// Zero disables swapping (default: 10 000).
    pub max_swap_entries: usize,
    /// Parent directory of the swap tier; the system temp dir when `None`.
    pub swap_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            ttl: Duration::from_secs(5 * 60),
            max_swap_entries: 10_000,
            swap_dir: None,
        }
    }
}

impl CacheConfig {
    /// Preset for filter masks: 200 entries, 5 minute TTL.
    pub fn filter_masks() -> Self {
        Self {
            capacity: 200,
            ttl: Duration::from_secs(5 * 60),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful lookups from either tier.
    pub hits: u64,
    pub misses: u64,
    /// Lookups answered by the swap tier (included in `hits`).
    pub swap_hits: u64,
    pub swapped_out: u64,
    pub expired: u64,
}

/// Values that can be written to and read back from the swap tier.
pub trait SwapValue: Send + Sync + Sized {
    fn to_swap_bytes(&self) -> Vec<u8>;

    fn from_swap_bytes(bytes: &[u8]) -> MvResult<Self>;
}

impl SwapValue for BitVec {
    fn to_swap_bytes(&self) -> Vec<u8> {
        self.to_bytes()
    }

    fn from_swap_bytes(bytes: &[u8]) -> MvResult<Self> {
        BitVec::from_bytes(bytes)
    }
}

struct HotEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
}

#[derive(Debug)]
struct SwapEntry {
    path: PathBuf,
    inserted_at: Instant,
    seq: u64,
}

/// Hot-tier victim on its way to the swap tier.
struct Eviction<V> {
    key: String,
    value: Arc<V>,
    inserted_at: Instant,
    seq: u64,
    dir: PathBuf,
}

struct Inner<V> {
    hot: LruCache<String, HotEntry<V>>,
    /// Unbounded; kept in swap-out order so the oldest is popped first.
    swap: LruCache<String, SwapEntry>,
    swap_dir: TempDir,
    next_file: u64,
    stats: CacheStats,
}

/// Keyed cache with an in-memory LRU tier and an on-disk swap tier.
///
/// Entries expire `ttl` after insertion regardless of which tier holds them. When the hot tier
/// is full, its least recently used entry is written to the swap tier; a swap hit moves the
/// entry back into memory with its original insertion time.
///
/// Swap files are written to a temp file and renamed into place without holding the cache
/// lock. An entry joins the swap tier only once its file is complete, so concurrent readers
/// only ever see whole entries; until then a lookup of that key misses.
///
/// Swap-tier read and write failures are logged and the entry is treated as absent.
pub struct TwoTierCache<V: SwapValue> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V: SwapValue> Clone for TwoTierCache<V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clock: self.clock.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<V: SwapValue> fmt::Debug for TwoTierCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("config", &self.config)
            .field("hot", &self.len_hot())
            .field("swap", &self.len_swap())
            .finish()
    }
}

impl<V: SwapValue> TwoTierCache<V> {
    pub fn new(config: CacheConfig) -> MvResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(mut config: CacheConfig, clock: Arc<dyn Clock>) -> MvResult<Self> {
        config.capacity = config.capacity.max(1);
        let cap = NonZeroUsize::new(config.capacity).expect("capacity is non-zero");
        let swap_dir = match &config.swap_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                tempfile::Builder::new().prefix("mv-cache-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("mv-cache-").tempdir()?,
        };
        let inner = Inner {
            hot: LruCache::new(cap),
            swap: LruCache::unbounded(),
            swap_dir,
            next_file: 0,
            stats: CacheStats::default(),
        };
        Ok(Self {
            config,
            clock,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().expect("cache mutex poisoned")
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn len_hot(&self) -> usize {
        self.lock().hot.len()
    }

    pub fn len_swap(&self) -> usize {
        self.lock().swap.len()
    }

    /// Directory holding swap files; removed when the last handle to the cache is dropped.
    pub fn swap_path(&self) -> PathBuf {
        self.lock().swap_dir.path().to_path_buf()
    }

    fn is_expired(&self, inserted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted_at) >= self.config.ttl
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now();
        let entry = {
            let mut guard = self.lock();
            let inner = &mut *guard;

            if let Some((value, inserted_at)) = inner
                .hot
                .get(key)
                .map(|entry| (entry.value.clone(), entry.inserted_at))
            {
                if !self.is_expired(inserted_at, now) {
                    inner.stats.hits += 1;
                    return Some(value);
                }
                inner.hot.pop(key);
                inner.stats.expired += 1;
                inner.stats.misses += 1;
                return None;
            }

            let Some(entry) = inner.swap.pop(key) else {
                inner.stats.misses += 1;
                return None;
            };
            if self.is_expired(entry.inserted_at, now) {
                remove_swap_file(&entry.path);
                inner.stats.expired += 1;
                inner.stats.misses += 1;
                return None;
            }
            entry
        };

        // The entry has left the swap tier, so this thread alone owns its file.
        let loaded = fs::read(&entry.path)
            .map_err(MvError::from)
            .and_then(|bytes| V::from_swap_bytes(&bytes));
        remove_swap_file(&entry.path);
        let value = match loaded {
            Ok(value) => Arc::new(value),
            Err(err) => {
                log::warn!("dropping unreadable swap entry {key:?}: {err}");
                self.lock().stats.misses += 1;
                return None;
            }
        };

        let eviction = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.stats.hits += 1;
            inner.stats.swap_hits += 1;
            // A `put` that landed while the file was read is newer.
            if let Some(current) = inner.hot.get(key) {
                return Some(current.value.clone());
            }
            self.insert_hot(inner, key.to_string(), value.clone(), entry.inserted_at)
        };
        if let Some(eviction) = eviction {
            self.swap_out(eviction);
        }
        Some(value)
    }

    /// Insert or replace `key`. Returns the shared value.
    pub fn put(&self, key: impl Into<String>, value: V) -> Arc<V> {
        let key = key.into();
        let value = Arc::new(value);
        let now = self.clock.now();
        let eviction = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if let Some(stale) = inner.swap.pop(&key) {
                remove_swap_file(&stale.path);
            }
            self.insert_hot(inner, key, value.clone(), now)
        };
        if let Some(eviction) = eviction {
            self.swap_out(eviction);
        }
        value
    }

    /// Drop expired entries from both tiers. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let hot_keys: Vec<String> = inner
            .hot
            .iter()
            .filter(|(_, entry)| self.is_expired(entry.inserted_at, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &hot_keys {
            inner.hot.pop(key);
        }

        let swap_keys: Vec<String> = inner
            .swap
            .iter()
            .filter(|(_, entry)| self.is_expired(entry.inserted_at, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &swap_keys {
            if let Some(entry) = inner.swap.pop(key) {
                remove_swap_file(&entry.path);
            }
        }

        let removed = hot_keys.len() + swap_keys.len();
        inner.stats.expired += removed as u64;
        removed
    }

    /// Push into the hot tier; returns the victim that still has to be written to swap.
    fn insert_hot(
        &self,
        inner: &mut Inner<V>,
        key: String,
        value: Arc<V>,
        inserted_at: Instant,
    ) -> Option<Eviction<V>> {
        let entry = HotEntry { value, inserted_at };
        let (victim_key, victim) = inner.hot.push(key.clone(), entry)?;
        // `push` also hands back the previous value when `key` was already present.
        if victim_key == key {
            return None;
        }
        if self.is_expired(victim.inserted_at, self.clock.now()) {
            inner.stats.expired += 1;
            return None;
        }
        if self.config.max_swap_entries == 0 {
            return None;
        }
        let seq = inner.next_file;
        inner.next_file += 1;
        Some(Eviction {
            key: victim_key,
            value: victim.value,
            inserted_at: victim.inserted_at,
            seq,
            dir: inner.swap_dir.path().to_path_buf(),
        })
    }

    /// Write `eviction` to its swap file, then register it unless a newer value for the same key
    /// got into the cache meanwhile. Called without the lock held.
    fn swap_out(&self, eviction: Eviction<V>) {
        let path = eviction.dir.join(format!("entry-{:016x}.bin", eviction.seq));
        if let Err(err) = write_atomic(&eviction.dir, &path, &eviction.value.to_swap_bytes()) {
            log::warn!("failed to swap out cache entry {:?}: {err}", eviction.key);
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let superseded = inner.hot.contains(&eviction.key)
            || inner
                .swap
                .peek(&eviction.key)
                .is_some_and(|newer| newer.seq > eviction.seq);
        if superseded {
            remove_swap_file(&path);
            return;
        }

        inner.stats.swapped_out += 1;
        let entry = SwapEntry {
            path,
            inserted_at: eviction.inserted_at,
            seq: eviction.seq,
        };
        if let Some(replaced) = inner.swap.put(eviction.key, entry) {
            remove_swap_file(&replaced.path);
        }
        while inner.swap.len() > self.config.max_swap_entries {
            let Some((_, oldest)) = inner.swap.pop_lru() else {
                break;
            };
            remove_swap_file(&oldest.path);
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> MvResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.as_file_mut().write_all(bytes)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| MvError::Io(err.error))?;
    Ok(())
}

fn remove_swap_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        log::debug!("failed to remove swap file {}: {err}", path.display());
    }
}

/// Cache of row-selection masks keyed by filter fingerprint.
#[derive(Debug, Clone)]
pub struct FilterMaskCache {
    cache: TwoTierCache<BitVec>,
}

impl FilterMaskCache {
    pub fn new() -> MvResult<Self> {
        Self::with_config(CacheConfig::filter_masks())
    }

    pub fn with_config(config: CacheConfig) -> MvResult<Self> {
        Ok(Self {
            cache: TwoTierCache::new(config)?,
        })
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> MvResult<Self> {
        Ok(Self {
            cache: TwoTierCache::with_clock(config, clock)?,
        })
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<BitVec>> {
        self.cache.get(fingerprint)
    }

    pub fn put(&self, fingerprint: impl Into<String>, mask: BitVec) -> Arc<BitVec> {
        self.cache.put(fingerprint, mask)
    }

    /// Cached mask for `fingerprint`, evaluating `compute` on a miss.
    ///
    /// `compute` runs without holding the cache lock; two threads missing on the same key may
    /// both evaluate it, and the later insert wins.
    pub fn get_or_compute(
        &self,
        fingerprint: &str,
        compute: impl FnOnce() -> BitVec,
    ) -> Arc<BitVec> {
        if let Some(mask) = self.get(fingerprint) {
            return mask;
        }
        self.put(fingerprint, compute())
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache(&self) -> &TwoTierCache<BitVec> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig {
            capacity,
            ttl: Duration::from_secs(60),
            ..CacheConfig::default()
        }
    }

    fn mask(len: usize) -> BitVec {
        BitVec::from_fn(len, |row| row % 2 == 0)
    }

    #[test]
    fn defaults_match_filter_preset() {
        let preset = CacheConfig::filter_masks();
        assert_eq!(preset.capacity, 200);
        assert_eq!(preset.ttl, Duration::from_secs(300));
    }

    #[test]
    fn overflow_goes_to_swap_and_comes_back() {
        let cache = TwoTierCache::with_clock(config(2), Arc::new(ManualClock::new())).unwrap();
        cache.put("a", mask(10));
        cache.put("b", mask(20));
        cache.put("c", mask(30));
        assert_eq!(cache.len_hot(), 2);
        assert_eq!(cache.len_swap(), 1);

        let a = cache.get("a").unwrap();
        assert_eq!(a.len(), 10);
        // Promoting `a` pushed the least recently used entry (`b`) out.
        assert_eq!(cache.len_hot(), 2);
        assert_eq!(cache.len_swap(), 1);
        assert_eq!(cache.get("b").unwrap().len(), 20);

        let stats = cache.stats();
        assert_eq!(stats.swap_hits, 2);
        assert_eq!(stats.swapped_out, 3);
    }

    #[test]
    fn replacing_a_key_does_not_swap() {
        let cache = TwoTierCache::new(config(1)).unwrap();
        cache.put("k", mask(1));
        cache.put("k", mask(2));
        assert_eq!(cache.len_swap(), 0);
        assert_eq!(cache.get("k").unwrap().len(), 2);
    }

    #[test]
    fn swapped_entries_keep_their_insertion_time() {
        let clock = Arc::new(ManualClock::new());
        let cache = TwoTierCache::with_clock(config(1), clock.clone()).unwrap();
        cache.put("old", mask(4));
        clock.advance(Duration::from_secs(40));
        cache.put("new", mask(4));
        assert!(cache.get("old").is_some());

        clock.advance(Duration::from_secs(30));
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn corrupt_swap_file_reads_as_absent() {
        let cache = TwoTierCache::new(config(1)).unwrap();
        cache.put("a", mask(8));
        cache.put("b", mask(8));
        let path = {
            let inner = cache.lock();
            inner.swap.peek("a").unwrap().path.clone()
        };
        fs::write(&path, b"junk").unwrap();

        assert!(cache.get("a").is_none());
        assert_eq!(cache.len_swap(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn swap_tier_is_bounded() {
        let clock = Arc::new(ManualClock::new());
        let cache = TwoTierCache::with_clock(
            CacheConfig {
                max_swap_entries: 2,
                ..config(1)
            },
            clock.clone(),
        )
        .unwrap();
        for key in ["a", "b", "c", "d"] {
            cache.put(key, mask(3));
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(cache.len_swap(), 2);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn swap_cap_drops_the_entry_swapped_out_first() {
        let cache = TwoTierCache::new(CacheConfig {
            max_swap_entries: 2,
            ..config(1)
        })
        .unwrap();
        for key in ["a", "b", "c"] {
            cache.put(key, mask(3));
        }
        // `a` comes back from swap, pushing `c` out after `b`.
        assert!(cache.get("a").is_some());
        cache.put("d", mask(3));
        // Swap-out order is now b, c, a; the cap keeps the last two.
        assert_eq!(cache.len_swap(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn late_swap_write_does_not_shadow_a_newer_value() {
        let cache = TwoTierCache::new(config(1)).unwrap();
        cache.put("a", mask(1));
        // Evict `a` and hold its swap write back, as a concurrent caller would between locks.
        let stale = {
            let mut guard = cache.lock();
            cache.insert_hot(&mut guard, "b".to_string(), Arc::new(mask(2)), cache.clock.now())
        }
        .unwrap();
        assert_eq!(stale.key, "a");

        // Newer `a` evicts `b`, then is itself swapped out by `c`.
        cache.put("a", mask(3));
        cache.put("c", mask(4));
        assert_eq!(cache.len_swap(), 2);

        cache.swap_out(stale);
        assert_eq!(cache.len_swap(), 2);
        assert_eq!(cache.stats().swapped_out, 2);
        assert_eq!(cache.get("a").unwrap().len(), 3);
    }

    #[test]
    fn purge_removes_expired_from_both_tiers() {
        let clock = Arc::new(ManualClock::new());
        let cache = TwoTierCache::with_clock(config(1), clock.clone()).unwrap();
        cache.put("a", mask(1));
        cache.put("b", mask(1));
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len_hot() + cache.len_swap(), 0);
    }

    #[test]
    fn get_or_compute_evaluates_once() {
        let masks = FilterMaskCache::new().unwrap();
        let mut calls = 0;
        for _ in 0..3 {
            let selected = masks.get_or_compute("region = 'EU'", || {
                calls += 1;
                mask(16)
            });
            assert_eq!(selected.count_ones(), 8);
        }
        assert_eq!(calls, 1);
        assert_eq!(masks.stats().hits, 2);
    }
}
