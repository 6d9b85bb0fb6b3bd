//! Capacity-bounded LRU entry store with explicit expiry metadata.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use marketdata_core::{CacheStrategy, DataError, Payload, Result, Symbol};
use tracing::debug;

/// A cached payload with its expiry metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Composite cache key.
    pub key: String,
    /// Symbols the payload covers.
    pub symbols: Vec<Symbol>,
    /// Cached payload.
    pub value: Payload,
    /// Strategy the entry was stored under.
    pub strategy: CacheStrategy,
    /// Store time in milliseconds since the Unix epoch.
    pub stored_at: i64,
    /// Time-to-live.
    pub ttl: Duration,
    /// Age after which reads schedule a background refresh.
    pub refresh_ahead: Option<Duration>,
    /// Whether a background refresh is queued or running for this key.
    pub refresh_in_flight: bool,
    /// Number of cache hits served, carried over refreshes.
    pub hit_count: u64,
    size_bytes: usize,
    tick: u64,
}

impl CacheEntry {
    /// Creates an entry stored at `stored_at`.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        symbols: Vec<Symbol>,
        value: Payload,
        strategy: CacheStrategy,
        stored_at: i64,
        ttl: Duration,
    ) -> Self {
        let size_bytes = serde_json::to_string(&value).map_or(0, |s| s.len());
        Self {
            key: key.into(),
            symbols,
            value,
            strategy,
            stored_at,
            ttl,
            refresh_ahead: None,
            refresh_in_flight: false,
            hit_count: 0,
            size_bytes,
            tick: 0,
        }
    }

    /// Sets the refresh-ahead age.
    #[must_use]
    pub fn with_refresh_ahead(mut self, refresh_ahead: Option<Duration>) -> Self {
        self.refresh_ahead = refresh_ahead;
        self
    }

    /// Expiry time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.stored_at
            .saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Returns true once `stored_at + ttl` has been reached.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at()
    }

    /// Age of the entry at `now`.
    #[must_use]
    pub fn age(&self, now: i64) -> Duration {
        Duration::from_millis(u64::try_from(now.saturating_sub(self.stored_at)).unwrap_or(0))
    }

    /// Returns true if the entry is old enough to be refreshed ahead of expiry.
    #[must_use]
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.refresh_ahead
            .is_some_and(|threshold| self.age(now) >= threshold)
    }

    /// Approximate serialized size of the payload.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

/// LRU map of [`CacheEntry`] values.
///
/// Expired entries are never returned; they are dropped lazily on lookup and in
/// bulk by [`EntryStore::sweep_expired`].
#[derive(Debug)]
pub struct EntryStore {
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    max_entries: usize,
    max_entry_bytes: usize,
}

impl EntryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(max_entries: usize, max_entry_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            max_entries: max_entries.max(1),
            max_entry_bytes,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Looks up an unexpired entry, marking it most recently used and counting the hit.
    pub fn get(&mut self, key: &str, now: i64) -> Option<&mut CacheEntry> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.remove(key);
            debug!(key, "Dropped expired cache entry");
            return None;
        }

        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, key.to_string());
        entry.tick = tick;
        entry.hit_count += 1;
        Some(entry)
    }

    /// Returns an entry without touching recency or hit counts, expired or not.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Mutable variant of [`EntryStore::peek`].
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Inserts or replaces an entry, evicting least recently used entries at capacity.
    ///
    /// Returns the number of evicted entries.
    ///
    /// # Errors
    /// Returns [`DataError::Cache`] if the payload exceeds the size limit.
    pub fn insert(&mut self, mut entry: CacheEntry) -> Result<usize> {
        if entry.size_bytes > self.max_entry_bytes {
            return Err(DataError::Cache(format!(
                "entry {} is {} bytes, limit is {}",
                entry.key, entry.size_bytes, self.max_entry_bytes
            )));
        }

        if let Some(old) = self.entries.remove(&entry.key) {
            self.recency.remove(&old.tick);
        }

        let mut evicted = 0;
        while self.entries.len() >= self.max_entries {
            let Some((_, lru_key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&lru_key);
            evicted += 1;
        }

        let tick = self.bump();
        entry.tick = tick;
        self.recency.insert(tick, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
        Ok(evicted)
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    /// Removes every expired entry, returning how many were removed.
    pub fn sweep_expired(&mut self, now: i64) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Keys of every entry covering `symbol`.
    #[must_use]
    pub fn keys_for_symbol(&self, symbol: &Symbol) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.symbols.contains(symbol))
            .map(|e| e.key.clone())
            .collect()
    }

    /// All keys currently stored.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, stored_at: i64, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            vec![Symbol::new(key)],
            json!({ "last": 1.0 }),
            CacheStrategy::WeakTimeliness,
            stored_at,
            Duration::from_secs(ttl_secs),
        )
    }

    #[test]
    fn test_expired_entries_are_not_served() {
        let mut store = EntryStore::new(10, 1024);
        store.insert(entry("AAPL", 0, 60)).unwrap();

        assert!(store.get("AAPL", 59_999).is_some());
        assert!(store.get("AAPL", 60_000).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_lru_eviction_keeps_recent() {
        let mut store = EntryStore::new(2, 1024);
        store.insert(entry("A", 0, 60)).unwrap();
        store.insert(entry("B", 0, 60)).unwrap();

        // Touch A so B becomes least recently used
        assert!(store.get("A", 1).is_some());
        let evicted = store.insert(entry("C", 0, 60)).unwrap();

        assert_eq!(evicted, 1);
        assert!(store.peek("A").is_some());
        assert!(store.peek("B").is_none());
        assert!(store.peek("C").is_some());
    }

    #[test]
    fn test_replacing_entry_does_not_evict() {
        let mut store = EntryStore::new(1, 1024);
        store.insert(entry("A", 0, 60)).unwrap();
        let evicted = store.insert(entry("A", 10, 60)).unwrap();

        assert_eq!(evicted, 0);
        assert_eq!(store.peek("A").unwrap().stored_at, 10);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let mut store = EntryStore::new(10, 4);
        let err = store.insert(entry("A", 0, 60)).unwrap_err();
        assert!(matches!(err, DataError::Cache(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_and_symbol_lookup() {
        let mut store = EntryStore::new(10, 1024);
        store.insert(entry("A", 0, 1)).unwrap();
        store.insert(entry("B", 0, 60)).unwrap();

        assert_eq!(store.sweep_expired(5_000), 1);
        assert_eq!(store.keys_for_symbol(&Symbol::new("B")), vec!["B".to_string()]);
        assert!(store.keys_for_symbol(&Symbol::new("A")).is_empty());
    }

    #[test]
    fn test_refresh_ahead_threshold() {
        let e = entry("A", 0, 60).with_refresh_ahead(Some(Duration::from_secs(48)));
        assert!(!e.needs_refresh(47_999));
        assert!(e.needs_refresh(48_000));
        assert!(!entry("B", 0, 60).needs_refresh(59_000));
    }
}
