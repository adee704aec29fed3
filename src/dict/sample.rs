//! Random sampling of dictionary entries.
//!
//! All sampling works mid-rehash by drawing from whichever generation holds
//! the bucket. None of it mutates the table, so the eviction sampler can read
//! a keyspace and its expiry table at the same time.

use std::collections::HashSet;
use std::hash::{BuildHasher, Hash};

use rand::Rng;

use super::table::EntryKey;
use super::{Dict, EntryHandle};

/// Candidates drawn by [`Dict::fair_random_entry`] before picking one.
const FAIR_SAMPLE_SIZE: usize = 15;

/// Consecutive empty buckets after which [`Dict::sample_entries`] jumps to a
/// new random position.
const EMPTY_RUN_BEFORE_JUMP: usize = 5;

impl<K, V, S> Dict<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Pick a random entry: a uniformly random non-empty bucket, then a
    /// uniformly random element of its chain.
    pub fn random_entry<R>(&self, rng: &mut R) -> Option<EntryHandle>
    where
        R: Rng,
    {
        if self.is_empty() {
            return None;
        }

        let head = match self.rehash_cursor() {
            // Buckets of ht[0] below the cursor are already empty.
            Some(cursor) => {
                let s0 = self.tables[0].size();
                let span = s0 + self.tables[1].size() - cursor;
                loop {
                    let h = cursor + rng.gen_range(0..span);
                    let head = if h >= s0 {
                        self.tables[1].buckets[h - s0]
                    } else {
                        self.tables[0].buckets[h]
                    };
                    if let Some(k) = head {
                        break k;
                    }
                }
            }
            None => {
                let size = self.tables[0].size();
                loop {
                    if let Some(k) = self.tables[0].buckets[rng.gen_range(0..size)] {
                        break k;
                    }
                }
            }
        };

        let chain_len = self.chain_len(head);
        let mut pick = rng.gen_range(0..chain_len);
        let mut cur = head;
        while pick > 0 {
            cur = self.entries[cur].next?;
            pick -= 1;
        }
        Some(EntryHandle(cur))
    }

    /// Collect up to `count` entries starting from a random bucket and
    /// walking forward. Faster than `count` calls to [`random_entry`], but
    /// the result is not uniformly distributed and may be shorter than
    /// `count`. Never returns duplicates.
    ///
    /// [`random_entry`]: Dict::random_entry
    pub fn sample_entries<R>(&self, count: usize, rng: &mut R) -> Vec<EntryHandle>
    where
        R: Rng,
    {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }

        let cursor = self.rehash_cursor();
        let tables = if cursor.is_some() { 2 } else { 1 };
        let mut max_mask = self.tables[0].mask();
        if tables > 1 {
            max_mask = max_mask.max(self.tables[1].mask());
        }

        let mut out = Vec::with_capacity(count);
        let mut seen: HashSet<EntryKey, ahash::RandomState> =
            HashSet::with_capacity_and_hasher(count, ahash::RandomState::new());
        let mut max_steps = count * 10;
        let mut i = rng.gen::<u64>() & max_mask;
        let mut empty_run = 0;

        while out.len() < count && max_steps > 0 {
            max_steps -= 1;
            for t in 0..tables {
                if let Some(cursor) = cursor {
                    // ht[0] below the cursor is already migrated.
                    if t == 0 && (i as usize) < cursor {
                        if i as usize >= self.tables[1].size() {
                            i = cursor as u64;
                        } else {
                            continue;
                        }
                    }
                }
                let table = &self.tables[t];
                if i as usize >= table.size() {
                    continue;
                }
                match table.buckets[i as usize] {
                    None => {
                        empty_run += 1;
                        if empty_run >= EMPTY_RUN_BEFORE_JUMP && empty_run > count {
                            i = rng.gen::<u64>() & max_mask;
                            empty_run = 0;
                        }
                    }
                    Some(head) => {
                        empty_run = 0;
                        let mut cur = Some(head);
                        while let Some(k) = cur {
                            // A random jump or wrap can revisit a bucket.
                            if seen.insert(k) {
                                out.push(EntryHandle(k));
                                if out.len() == count {
                                    return out;
                                }
                            }
                            cur = self.entries[k].next;
                        }
                    }
                }
            }
            i = (i + 1) & max_mask;
        }
        out
    }

    /// Random entry that corrects for chain-length bias by picking among a
    /// batch of sampled entries, falling back to [`Dict::random_entry`].
    pub fn fair_random_entry<R>(&self, rng: &mut R) -> Option<EntryHandle>
    where
        R: Rng,
    {
        let batch = self.sample_entries(FAIR_SAMPLE_SIZE, rng);
        if batch.is_empty() {
            return self.random_entry(rng);
        }
        Some(batch[rng.gen_range(0..batch.len())])
    }

    fn chain_len(&self, head: EntryKey) -> usize {
        let mut len = 0;
        let mut cur = Some(head);
        while let Some(k) = cur {
            len += 1;
            cur = self.entries[k].next;
        }
        len
    }

    /// Which generation currently links `h`.
    #[cfg(test)]
    pub(crate) fn generation_of(&self, h: EntryHandle) -> Option<usize> {
        let hash = self.entries.get(h.0)?.hash;
        for (t, table) in self.tables.iter().enumerate() {
            if !table.is_allocated() {
                continue;
            }
            let mut cur = table.buckets[table.index(hash)];
            while let Some(k) = cur {
                if k == h.0 {
                    return Some(t);
                }
                cur = self.entries[k].next;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use crate::dict::Dict;

    fn filled(n: u64) -> Dict<u64, ()> {
        let mut dict = Dict::with_seed(3);
        for i in 0..n {
            dict.add(i, ()).unwrap();
        }
        dict
    }

    #[test]
    fn test_random_entry_empty() {
        let dict: Dict<u64, ()> = Dict::new();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(dict.random_entry(&mut rng).is_none());
        assert!(dict.sample_entries(5, &mut rng).is_empty());
        assert!(dict.fair_random_entry(&mut rng).is_none());
    }

    #[test]
    fn test_random_entry_after_all_deleted() {
        let mut dict = filled(10);
        for i in 0..10 {
            dict.delete(&i);
        }
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(dict.random_entry(&mut rng).is_none());
    }

    #[test]
    fn test_random_entry_covers_everything() {
        let dict = filled(16);
        let mut rng = SmallRng::seed_from_u64(42);
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let h = dict.random_entry(&mut rng).unwrap();
            seen.insert(*dict.key(h).unwrap());
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_random_entry_visits_both_generations_mid_rehash() {
        let mut dict = filled(64);
        while dict.rehash(100) {}
        dict.add(1000, ()).unwrap();
        assert!(dict.is_rehashing());
        // Migrate roughly half of ht[0].
        for _ in 0..16 {
            dict.rehash(1);
        }
        assert!(dict.is_rehashing());

        let mut rng = SmallRng::seed_from_u64(9);
        let mut generations = HashSet::new();
        for _ in 0..1000 {
            let h = dict.random_entry(&mut rng).unwrap();
            generations.insert(dict.generation_of(h).unwrap());
        }
        assert_eq!(generations, HashSet::from([0, 1]));
    }

    #[test]
    fn test_sample_entries_distinct_and_bounded() {
        let dict = filled(100);
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..50 {
            let sample = dict.sample_entries(5, &mut rng);
            assert!(!sample.is_empty() && sample.len() <= 5);
            let unique: HashSet<_> = sample.iter().collect();
            assert_eq!(unique.len(), sample.len());
        }
    }

    #[test]
    fn test_sample_entries_unique_on_sparse_table() {
        let mut dict = filled(128);
        while dict.rehash(100) {}
        for i in 6..128 {
            dict.delete(&i);
        }
        assert!(dict.slots() >= 128);
        for seed in 0..500 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let sample = dict.sample_entries(6, &mut rng);
            let unique: HashSet<_> = sample.iter().collect();
            assert_eq!(unique.len(), sample.len(), "seed {seed}");
        }
    }

    #[test]
    fn test_sample_entries_caps_at_len() {
        let dict = filled(3);
        let mut rng = SmallRng::seed_from_u64(5);
        assert!(dict.sample_entries(10, &mut rng).len() <= 3);
    }
}
