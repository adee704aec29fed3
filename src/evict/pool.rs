//! Fixed-size pool of the best eviction candidates seen so far.

use bytes::Bytes;

/// Capacity of the pool.
pub const EVPOOL_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    /// Higher means a better candidate.
    pub score: u64,
    pub key: Bytes,
    pub db: usize,
}

/// Entries sorted by ascending score; the best candidate is last.
#[derive(Debug, Default)]
pub struct EvictionPool {
    entries: Vec<PoolEntry>,
}

impl EvictionPool {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(EVPOOL_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolEntry> {
        self.entries.iter()
    }

    /// Offer a sampled key. It is taken if there is a free slot or it beats
    /// the worst entry, which is then dropped. A key already pooled is
    /// re-scored. Returns whether the key is now in the pool.
    pub fn offer(&mut self, score: u64, key: &Bytes, db: usize) -> bool {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.db == db && e.key == *key)
        {
            self.entries.remove(pos);
        }

        // First slot whose score is >= ours: ties go in front of older
        // entries, so the older one is popped first.
        let k = self.entries.partition_point(|e| e.score < score);
        let entry = PoolEntry {
            score,
            key: key.clone(),
            db,
        };

        if self.entries.len() < EVPOOL_SIZE {
            self.entries.insert(k, entry);
            return true;
        }
        if k == 0 {
            // Full, and worse than everything pooled.
            return false;
        }
        // Drop the worst entry to make room.
        self.entries.remove(0);
        self.entries.insert(k - 1, entry);
        true
    }

    /// Remove and return the best candidate.
    pub fn pop_best(&mut self) -> Option<PoolEntry> {
        self.entries.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_pool_keeps_sorted_order() {
        let mut pool = EvictionPool::new();
        for (score, name) in [(30, "c"), (10, "a"), (20, "b")] {
            assert!(pool.offer(score, &key(name), 0));
        }
        let scores: Vec<u64> = pool.iter().map(|e| e.score).collect();
        assert_eq!(scores, vec![10, 20, 30]);
        assert_eq!(pool.pop_best().unwrap().key, key("c"));
    }

    #[test]
    fn test_full_pool_rejects_worse_and_replaces_worst() {
        let mut pool = EvictionPool::new();
        for i in 0..EVPOOL_SIZE as u64 {
            pool.offer(100 + i, &key(&format!("k{i}")), 0);
        }
        assert_eq!(pool.len(), EVPOOL_SIZE);

        assert!(!pool.offer(50, &key("cold"), 0));
        assert!(pool.offer(1_000, &key("hot"), 0));
        assert_eq!(pool.len(), EVPOOL_SIZE);
        // The old worst (score 100) is gone.
        assert_eq!(pool.iter().next().unwrap().score, 101);
        assert_eq!(pool.pop_best().unwrap().key, key("hot"));
    }

    #[test]
    fn test_equal_scores_pop_in_insertion_order() {
        let mut pool = EvictionPool::new();
        pool.offer(7, &key("first"), 0);
        pool.offer(7, &key("second"), 0);
        pool.offer(7, &key("third"), 1);
        assert_eq!(pool.pop_best().unwrap().key, key("first"));
        assert_eq!(pool.pop_best().unwrap().key, key("second"));
        assert_eq!(pool.pop_best().unwrap().key, key("third"));
        assert!(pool.pop_best().is_none());
    }

    #[test]
    fn test_same_key_is_rescored_not_duplicated() {
        let mut pool = EvictionPool::new();
        pool.offer(5, &key("x"), 0);
        pool.offer(9, &key("x"), 0);
        pool.offer(9, &key("x"), 1);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.iter().find(|e| e.db == 0).unwrap().score, 9);
    }
}
