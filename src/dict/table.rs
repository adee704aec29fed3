//! Storage for one dictionary generation.
//!
//! Entries are not owned by a generation: they live in the dictionary's
//! slotmap arena and a generation only links them into bucket chains. Moving
//! an entry from `ht[0]` to `ht[1]` is therefore a relink, and handles stay
//! valid across a rehash.

slotmap::new_key_type! {
    /// Generation-checked index of an entry in the dictionary arena.
    pub(crate) struct EntryKey;
}

/// A key/value pair linked into a bucket chain.
#[derive(Debug)]
pub(crate) struct Entry<K, V> {
    pub key: K,
    pub value: V,
    /// Hash computed once at insertion; rehashing never calls the hasher again.
    pub hash: u64,
    pub next: Option<EntryKey>,
}

/// One generation (`ht[0]` or `ht[1]`) of a dictionary.
#[derive(Debug, Default)]
pub(crate) struct Table {
    /// Head of each bucket chain. Length is zero or a power of two.
    pub buckets: Vec<Option<EntryKey>>,
    /// Entries currently linked into this generation.
    pub used: usize,
}

impl Table {
    pub fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            buckets: vec![None; size],
            used: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn mask(&self) -> u64 {
        (self.size() as u64).saturating_sub(1)
    }

    /// Bucket index for `hash`. Only meaningful on an allocated table.
    pub fn index(&self, hash: u64) -> usize {
        (hash & self.mask()) as usize
    }

    pub fn is_allocated(&self) -> bool {
        !self.buckets.is_empty()
    }
}
