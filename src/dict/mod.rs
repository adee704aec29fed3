//! Hash table with two generations and incremental rehashing.
//!
//! A [`Dict`] keeps its entries in `ht[0]` and, while a resize is in
//! progress, also in `ht[1]`. Growing or shrinking never rebuilds the live
//! table in one go: every mutating call migrates one bucket from `ht[0]` to
//! `ht[1]`, so the cost of a resize is spread over many operations and no
//! single call stalls the reactor thread.
//!
//! - [`iter`]: borrowing iterator, safe iterator and reverse-binary scan
//! - [`sample`]: random entry selection used by the eviction sampler
//!
//! The type descriptor of the classic design maps onto Rust traits: hashing
//! is the `BuildHasher` (seeded per instance), comparison is `Eq`, duplication
//! is ownership transfer and destructors are `Drop`.

pub mod iter;
pub mod sample;
mod table;

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::time::{Duration, Instant};

use slotmap::SlotMap;
use tracing::debug;

use self::table::{Entry, EntryKey, Table};

pub use self::iter::{Iter, SafeIter};

/// Size of a freshly allocated table.
pub const INITIAL_SIZE: usize = 4;

/// Load factor that forces a grow even while resizing is disallowed.
pub const FORCE_RESIZE_RATIO: usize = 5;

/// Fill percentage below which a table is worth shrinking.
pub const MIN_FILL_PERCENT: usize = 10;

/// Empty buckets a single rehash step may skip, per bucket requested.
const EMPTY_VISITS_PER_STEP: usize = 10;

/// Buckets migrated per batch by [`Dict::rehash_for`].
const REHASH_BATCH: usize = 100;

/// Stable reference to an entry. Survives rehashing; invalidated by removal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryHandle(pub(crate) EntryKey);

/// Whether a resize is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehashState {
    Stable,
    /// `cursor` is the next `ht[0]` bucket to migrate.
    Rehashing { cursor: usize },
}

/// Outcome of [`Dict::add_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRaw {
    Created(EntryHandle),
    Existing(EntryHandle),
}

impl AddRaw {
    pub fn handle(&self) -> EntryHandle {
        match *self {
            AddRaw::Created(h) | AddRaw::Existing(h) => h,
        }
    }
}

/// Returned by [`Dict::add`] when the key is already present. Hands the
/// rejected pair back to the caller untouched.
#[derive(Debug)]
pub struct Occupied<K, V> {
    pub key: K,
    pub value: V,
    pub existing: EntryHandle,
}

impl<K, V> fmt::Display for Occupied<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key already exists")
    }
}

impl<K: fmt::Debug, V: fmt::Debug> std::error::Error for Occupied<K, V> {}

/// Point-in-time shape of a dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DictStats {
    pub len: usize,
    pub table_sizes: [usize; 2],
    pub table_used: [usize; 2],
    pub rehashing: bool,
    pub longest_chain: usize,
}

pub struct Dict<K, V, S = ahash::RandomState> {
    hasher: S,
    entries: SlotMap<EntryKey, Entry<K, V>>,
    tables: [Table; 2],
    state: RehashState,
    /// Live safe iterators. Rehash steps are skipped while non-zero.
    paused: usize,
    resize_allowed: bool,
}

impl<K, V> Dict<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(ahash::RandomState::new())
    }

    /// Dictionary with a fixed hash seed, for reproducible bucket layouts.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_hasher(ahash::RandomState::with_seeds(
            seed,
            seed.rotate_left(17),
            seed.rotate_left(31),
            seed.rotate_left(47),
        ))
    }
}

impl<K, V> Default for Dict<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Dict<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            entries: SlotMap::with_key(),
            tables: [Table::default(), Table::default()],
            state: RehashState::Stable,
            paused: 0,
            resize_allowed: true,
        }
    }

    fn hash_key<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total buckets across both generations.
    pub fn slots(&self) -> usize {
        self.tables[0].size() + self.tables[1].size()
    }

    pub fn rehash_state(&self) -> RehashState {
        self.state
    }

    pub fn is_rehashing(&self) -> bool {
        matches!(self.state, RehashState::Rehashing { .. })
    }

    /// Next `ht[0]` bucket to migrate, or `None` when stable.
    pub fn rehash_cursor(&self) -> Option<usize> {
        match self.state {
            RehashState::Rehashing { cursor } => Some(cursor),
            RehashState::Stable => None,
        }
    }

    /// Allow or forbid voluntary resizes. Growth still happens once the load
    /// factor passes [`FORCE_RESIZE_RATIO`].
    pub fn set_resize_allowed(&mut self, allowed: bool) {
        self.resize_allowed = allowed;
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    /// Read-only lookup. Probes `ht[0]`, then `ht[1]` while rehashing. Never
    /// advances the rehash.
    pub fn find<Q>(&self, q: &Q) -> Option<EntryHandle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.is_empty() {
            return None;
        }
        let hash = self.hash_key(q);
        for table in &self.tables {
            if !table.is_allocated() {
                break;
            }
            let mut cur = table.buckets[table.index(hash)];
            while let Some(k) = cur {
                let entry = &self.entries[k];
                if entry.hash == hash && entry.key.borrow() == q {
                    return Some(EntryHandle(k));
                }
                cur = entry.next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    pub fn get<Q>(&self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).map(|h| &self.entries[h.0].value)
    }

    /// Mutable lookup. Takes one rehash step first, like every call that may
    /// mutate the table.
    pub fn get_mut<Q>(&mut self, q: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.rehash_step();
        let h = self.find(q)?;
        Some(&mut self.entries[h.0].value)
    }

    pub fn key(&self, h: EntryHandle) -> Option<&K> {
        self.entries.get(h.0).map(|e| &e.key)
    }

    pub fn value(&self, h: EntryHandle) -> Option<&V> {
        self.entries.get(h.0).map(|e| &e.value)
    }

    pub fn value_mut(&mut self, h: EntryHandle) -> Option<&mut V> {
        self.entries.get_mut(h.0).map(|e| &mut e.value)
    }

    pub fn entry(&self, h: EntryHandle) -> Option<(&K, &V)> {
        self.entries.get(h.0).map(|e| (&e.key, &e.value))
    }

    // ─── Insertion ───────────────────────────────────────────────────────

    /// Insert a new pair. Fails without mutating anything if the key exists.
    pub fn add(&mut self, key: K, value: V) -> Result<EntryHandle, Occupied<K, V>> {
        self.rehash_step();
        let hash = self.hash_key(&key);
        match self.key_index(hash, &key) {
            Ok(idx) => Ok(self.link(idx, hash, key, value)),
            Err(existing) => Err(Occupied {
                key,
                value,
                existing: EntryHandle(existing),
            }),
        }
    }

    /// Add-or-find primitive. `make_value` runs only when a new entry is
    /// created; on a hit the passed key is dropped.
    pub fn add_raw<F>(&mut self, key: K, make_value: F) -> AddRaw
    where
        F: FnOnce() -> V,
    {
        self.rehash_step();
        let hash = self.hash_key(&key);
        match self.key_index(hash, &key) {
            Ok(idx) => AddRaw::Created(self.link(idx, hash, key, make_value())),
            Err(existing) => AddRaw::Existing(EntryHandle(existing)),
        }
    }

    /// Insert or overwrite. Returns `true` if the key was new.
    pub fn replace(&mut self, key: K, value: V) -> bool {
        match self.add(key, value) {
            Ok(_) => true,
            Err(Occupied {
                value, existing, ..
            }) => {
                // New value goes in before the old one is dropped.
                let old = std::mem::replace(&mut self.entries[existing.0].value, value);
                drop(old);
                false
            }
        }
    }

    /// Bucket index for a new key (in `ht[1]` while rehashing), or the
    /// existing entry with an equal key.
    fn key_index(&mut self, hash: u64, key: &K) -> Result<usize, EntryKey> {
        self.expand_if_needed();
        let mut idx = 0;
        for table in &self.tables {
            idx = table.index(hash);
            let mut cur = table.buckets[idx];
            while let Some(k) = cur {
                let entry = &self.entries[k];
                if entry.hash == hash && entry.key == *key {
                    return Err(k);
                }
                cur = entry.next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        Ok(idx)
    }

    /// Link a new entry at the head of its bucket; recently added keys tend
    /// to be the ones read next.
    fn link(&mut self, idx: usize, hash: u64, key: K, value: V) -> EntryHandle {
        let t = if self.is_rehashing() { 1 } else { 0 };
        let head = self.tables[t].buckets[idx];
        let k = self.entries.insert(Entry {
            key,
            value,
            hash,
            next: head,
        });
        self.tables[t].buckets[idx] = Some(k);
        self.tables[t].used += 1;
        EntryHandle(k)
    }

    // ─── Removal ─────────────────────────────────────────────────────────

    /// Remove `q` and drop its key and value. Returns whether it was present.
    pub fn delete<Q>(&mut self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.unlink(q).is_some()
    }

    /// Remove `q` and hand the detached pair to the caller instead of
    /// dropping it.
    pub fn unlink<Q>(&mut self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.is_empty() {
            return None;
        }
        self.rehash_step();
        let hash = self.hash_key(q);
        self.unlink_where(hash, |_, entry| entry.key.borrow() == q)
    }

    /// Remove the entry behind `h`. The entry yielded by a safe iterator may
    /// be removed this way.
    pub fn unlink_handle(&mut self, h: EntryHandle) -> Option<(K, V)> {
        let hash = self.entries.get(h.0)?.hash;
        self.rehash_step();
        self.unlink_where(hash, |k, _| k == h.0)
    }

    fn unlink_where<P>(&mut self, hash: u64, matches: P) -> Option<(K, V)>
    where
        P: Fn(EntryKey, &Entry<K, V>) -> bool,
    {
        for t in 0..2 {
            if !self.tables[t].is_allocated() {
                break;
            }
            let idx = self.tables[t].index(hash);
            let mut prev: Option<EntryKey> = None;
            let mut cur = self.tables[t].buckets[idx];
            while let Some(k) = cur {
                let entry = &self.entries[k];
                let next = entry.next;
                if entry.hash == hash && matches(k, entry) {
                    match prev {
                        None => self.tables[t].buckets[idx] = next,
                        Some(p) => self.entries[p].next = next,
                    }
                    self.tables[t].used -= 1;
                    let entry = self.entries.remove(k)?;
                    return Some((entry.key, entry.value));
                }
                prev = cur;
                cur = next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Drop every entry and release both generations.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.tables = [Table::default(), Table::default()];
        self.state = RehashState::Stable;
    }

    // ─── Resizing ────────────────────────────────────────────────────────

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if !self.tables[0].is_allocated() {
            self.expand(INITIAL_SIZE);
            return;
        }
        let used = self.tables[0].used;
        let size = self.tables[0].size();
        if used >= size && (self.resize_allowed || used / size > FORCE_RESIZE_RATIO) {
            self.expand(used * 2);
        }
    }

    /// Start a resize to the next power of two at or above `size`. The
    /// first allocation goes straight into `ht[0]`; anything later becomes
    /// `ht[1]` and starts an incremental migration.
    pub fn expand(&mut self, size: usize) -> bool {
        if self.is_rehashing() || self.tables[0].used > size {
            return false;
        }
        let real_size = next_power(size);
        if real_size == self.tables[0].size() {
            return false;
        }

        let table = Table::with_size(real_size);
        if !self.tables[0].is_allocated() {
            self.tables[0] = table;
            return true;
        }

        debug!(
            from = self.tables[0].size(),
            to = real_size,
            used = self.tables[0].used,
            "Starting incremental rehash"
        );
        self.tables[1] = table;
        self.state = RehashState::Rehashing { cursor: 0 };
        true
    }

    /// Shrink to the smallest table that holds every entry, through the
    /// same incremental migration as a grow.
    pub fn shrink_to_fit(&mut self) -> bool {
        if !self.resize_allowed || self.is_rehashing() {
            return false;
        }
        let minimal = self.tables[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    /// Whether fill has dropped under [`MIN_FILL_PERCENT`].
    pub fn needs_shrink(&self) -> bool {
        let size = self.slots();
        size > INITIAL_SIZE && self.len() * 100 / size < MIN_FILL_PERCENT
    }

    // ─── Incremental rehash ──────────────────────────────────────────────

    /// Migrate up to `n` non-empty buckets from `ht[0]` to `ht[1]`, visiting
    /// at most `n * 10` empty buckets. Returns `true` while work remains.
    pub fn rehash(&mut self, n: usize) -> bool {
        let RehashState::Rehashing { mut cursor } = self.state else {
            return false;
        };
        if self.paused > 0 {
            return true;
        }

        let mut empty_visits = n * EMPTY_VISITS_PER_STEP;
        let mut remaining = n;
        while remaining > 0 && self.tables[0].used != 0 {
            remaining -= 1;
            assert!(
                cursor < self.tables[0].size(),
                "rehash cursor {cursor} past table of size {}",
                self.tables[0].size()
            );

            while self.tables[0].buckets[cursor].is_none() {
                cursor += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    self.state = RehashState::Rehashing { cursor };
                    return true;
                }
            }

            let mut cur = self.tables[0].buckets[cursor].take();
            while let Some(k) = cur {
                let entry = &mut self.entries[k];
                cur = entry.next;
                let idx = self.tables[1].index(entry.hash);
                entry.next = self.tables[1].buckets[idx];
                self.tables[1].buckets[idx] = Some(k);
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            cursor += 1;
        }

        if self.tables[0].used == 0 {
            self.tables[0] = std::mem::take(&mut self.tables[1]);
            self.state = RehashState::Stable;
            debug!(size = self.tables[0].size(), "Rehash complete");
            return false;
        }

        self.state = RehashState::Rehashing { cursor };
        true
    }

    /// One bucket of migration, unless a safe iterator is live.
    fn rehash_step(&mut self) {
        if self.paused == 0 {
            self.rehash(1);
        }
    }

    /// Rehash in batches of 100 buckets until done or `budget` elapses.
    /// Returns the number of buckets requested.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        if self.paused > 0 {
            return 0;
        }
        let start = Instant::now();
        let mut steps = 0;
        while self.rehash(REHASH_BATCH) {
            steps += REHASH_BATCH;
            if start.elapsed() > budget {
                break;
            }
        }
        steps
    }

    pub fn stats(&self) -> DictStats {
        let mut longest_chain = 0;
        for table in &self.tables {
            for head in &table.buckets {
                let mut len = 0;
                let mut cur = *head;
                while let Some(k) = cur {
                    len += 1;
                    cur = self.entries[k].next;
                }
                longest_chain = longest_chain.max(len);
            }
        }
        DictStats {
            len: self.len(),
            table_sizes: [self.tables[0].size(), self.tables[1].size()],
            table_used: [self.tables[0].used, self.tables[1].used],
            rehashing: self.is_rehashing(),
            longest_chain,
        }
    }
}

impl<K, V, S> fmt::Debug for Dict<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dict")
            .field("len", &(self.tables[0].used + self.tables[1].used))
            .field("sizes", &[self.tables[0].size(), self.tables[1].size()])
            .field("state", &self.state)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

fn next_power(size: usize) -> usize {
    size.max(INITIAL_SIZE)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}
