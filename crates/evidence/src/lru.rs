//! LRU index and byte-budgeted eviction controller.
//!
//! Both cache tiers (full-page renders and crops) are keyed by their
//! deterministic on-disk file stem. The stem is a pure function of the
//! cache parameters, so cold-start recovery from a directory scan is exact.
//!
//! Invariant: the controller's running byte total equals the sum of
//! `size_bytes` across both live tiers. Every insertion and eviction
//! restores it immediately.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

/// Cache keys are on-disk file stems (filename without extension).
pub type CacheKey = String;

/// Metadata for one cached raster file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Absolute path of the cached PNG.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: SystemTime,
    /// Modification time of the source PDF at creation, in milliseconds
    /// since epoch. 0 if unknown (e.g. recovered from disk at startup).
    pub source_mtime_ms: u64,
    pub last_accessed: SystemTime,
}

/// Which tier an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Render,
    Crop,
}

/// Ordered map of cache entries: HashMap for lookup plus a VecDeque for
/// recency order (front = least recently used).
#[derive(Debug, Default)]
pub struct LruIndex {
    entries: HashMap<CacheKey, CacheEntry>,
    lru_queue: VecDeque<CacheKey>,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Marks an entry as most recently used and refreshes its access time.
    pub fn touch(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_accessed = SystemTime::now();
            self.lru_queue.retain(|k| k != key);
            self.lru_queue.push_back(key.to_string());
        }
    }

    /// Inserts an entry at the most-recently-used end. Returns the
    /// replaced entry if the key was already present.
    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> Option<CacheEntry> {
        let replaced = self.entries.insert(key.clone(), entry);
        self.lru_queue.retain(|k| k != &key);
        self.lru_queue.push_back(key);
        replaced
    }

    /// Removes and returns the least-recently-used entry.
    pub fn pop_lru(&mut self) -> Option<(CacheKey, CacheEntry)> {
        while let Some(key) = self.lru_queue.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                return Some((key, entry));
            }
        }
        None
    }

    /// Removes a specific entry.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru_queue.retain(|k| k != key);
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru_queue.clear();
    }
}

/// Tracks total bytes consumed by both tiers against a configured budget
/// and evicts least-recently-used entries to make room for pending writes.
#[derive(Debug)]
pub struct EvictionController {
    pub renders: LruIndex,
    pub crops: LruIndex,
    total_bytes: u64,
    budget_bytes: u64,
}

impl EvictionController {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            renders: LruIndex::new(),
            crops: LruIndex::new(),
            total_bytes: 0,
            budget_bytes,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    fn index_mut(&mut self, tier: Tier) -> &mut LruIndex {
        match tier {
            Tier::Render => &mut self.renders,
            Tier::Crop => &mut self.crops,
        }
    }

    pub fn index(&self, tier: Tier) -> &LruIndex {
        match tier {
            Tier::Render => &self.renders,
            Tier::Crop => &self.crops,
        }
    }

    /// Registers an entry and updates the running total. A replaced entry
    /// under the same key has its size subtracted first.
    pub fn insert(&mut self, tier: Tier, key: CacheKey, entry: CacheEntry) {
        let size = entry.size_bytes;
        if let Some(replaced) = self.index_mut(tier).insert(key, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(replaced.size_bytes);
        }
        self.total_bytes += size;
    }

    /// Removes an entry and updates the running total.
    pub fn remove(&mut self, tier: Tier, key: &str) -> Option<CacheEntry> {
        let entry = self.index_mut(tier).remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Evicts least-recently-used entries until `needed_bytes` fits within
    /// the budget, deleting files best-effort. Crops go first: a crop can
    /// be cheaply regenerated from its full-page render, whereas a full
    /// page requires re-rasterizing the source PDF.
    ///
    /// Never fails the pending write — if both tiers are exhausted and the
    /// budget is still exceeded, the cache may temporarily overshoot.
    pub fn reserve(&mut self, needed_bytes: u64) {
        while self.total_bytes + needed_bytes > self.budget_bytes && !self.crops.is_empty() {
            self.evict_one(Tier::Crop);
        }
        while self.total_bytes + needed_bytes > self.budget_bytes && !self.renders.is_empty() {
            self.evict_one(Tier::Render);
        }
    }

    fn evict_one(&mut self, tier: Tier) {
        if let Some((key, entry)) = self.index_mut(tier).pop_lru() {
            // Deletion is best-effort; the total drops either way so it
            // keeps matching the live entry set.
            if let Err(err) = fs::remove_file(&entry.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %entry.path.display(), %err, "evict unlink failed");
                }
            }
            self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
            tracing::debug!(%key, tier = ?tier, size = entry.size_bytes, "evicted cache entry");
        }
    }

    /// Empties both tiers and zeroes the running total. Does not touch
    /// the filesystem.
    pub fn clear(&mut self) {
        self.renders.clear();
        self.crops.clear();
        self.total_bytes = 0;
    }
}
