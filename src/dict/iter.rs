//! Iteration over a [`Dict`].
//!
//! Three flavours, matching what callers need:
//!
//! - [`Iter`] borrows the dictionary. The borrow checker rules out any
//!   mutation while it lives, so no rehash can move entries under it.
//! - [`SafeIter`] is a detached cursor. While one is live the dictionary
//!   pauses incremental rehashing, and the caller may remove the entry it was
//!   just handed (through [`Dict::unlink_handle`]). Removing any other entry
//!   may cause entries to be skipped.
//! - [`Dict::scan`] is a stateless reverse-binary cursor. Every entry present
//!   from the start to the end of a full scan is reported at least once, even
//!   if the table grows or shrinks between calls; some may be reported twice.

use std::hash::{BuildHasher, Hash};

use super::table::EntryKey;
use super::{Dict, EntryHandle};

/// Borrowing iterator over `(key, value)` pairs.
pub struct Iter<'a, K, V, S> {
    dict: &'a Dict<K, V, S>,
    table: usize,
    bucket: usize,
    next: Option<EntryKey>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let dict = self.dict;
        loop {
            if let Some(k) = self.next {
                let entry = &dict.entries[k];
                self.next = entry.next;
                return Some((&entry.key, &entry.value));
            }
            let table = &dict.tables[self.table];
            if self.bucket >= table.size() {
                if self.table == 0 && dict.tables[1].is_allocated() {
                    self.table = 1;
                    self.bucket = 0;
                    continue;
                }
                return None;
            }
            self.next = table.buckets[self.bucket];
            self.bucket += 1;
        }
    }
}

/// Cursor for iteration that tolerates removal of the yielded entry.
///
/// Obtained from [`Dict::acquire_iterator`] and handed back through
/// [`Dict::release_iterator`]; rehashing stays paused until then.
#[must_use = "a safe iterator pauses rehashing until released"]
#[derive(Debug)]
pub struct SafeIter {
    table: usize,
    bucket: usize,
    next: Option<EntryKey>,
}

impl<K, V, S> Dict<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            dict: self,
            table: 0,
            bucket: 0,
            next: None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn acquire_iterator(&mut self) -> SafeIter {
        self.paused += 1;
        SafeIter {
            table: 0,
            bucket: 0,
            next: None,
        }
    }

    /// Advance `it`. The successor is recorded before the entry is handed
    /// out, so removing the returned entry does not derail the walk.
    pub fn iter_next(&self, it: &mut SafeIter) -> Option<EntryHandle> {
        loop {
            if let Some(k) = it.next.take() {
                if let Some(entry) = self.entries.get(k) {
                    it.next = entry.next;
                    return Some(EntryHandle(k));
                }
                // The recorded successor was removed: resume at the next bucket.
            }
            let table = &self.tables[it.table];
            if it.bucket >= table.size() {
                if it.table == 0 && self.tables[1].is_allocated() {
                    it.table = 1;
                    it.bucket = 0;
                    continue;
                }
                return None;
            }
            it.next = table.buckets[it.bucket];
            it.bucket += 1;
        }
    }

    pub fn release_iterator(&mut self, it: SafeIter) {
        drop(it);
        assert!(self.paused > 0, "safe iterator released twice");
        self.paused -= 1;
    }

    /// Visit the bucket(s) addressed by `cursor` and return the next cursor;
    /// `0` means the scan is complete.
    ///
    /// The cursor's bits are incremented from the most significant end, so
    /// a bucket index that has been visited under one table size maps onto
    /// already-visited buckets under any larger or smaller size.
    pub fn scan<F>(&self, cursor: u64, mut visit: F) -> u64
    where
        F: FnMut(&K, &V),
    {
        if self.is_empty() {
            return 0;
        }

        let mut v = cursor;
        if !self.is_rehashing() {
            let m0 = self.tables[0].mask();
            self.visit_bucket(0, v & m0, &mut visit);
            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
        } else {
            let (small, large) = if self.tables[0].size() <= self.tables[1].size() {
                (0, 1)
            } else {
                (1, 0)
            };
            let m0 = self.tables[small].mask();
            let m1 = self.tables[large].mask();

            self.visit_bucket(small, v & m0, &mut visit);
            // Walk every bucket of the larger table that expands the small one.
            loop {
                self.visit_bucket(large, v & m1, &mut visit);
                v |= !m1;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }
        v
    }

    fn visit_bucket<F>(&self, table: usize, idx: u64, visit: &mut F)
    where
        F: FnMut(&K, &V),
    {
        let mut cur = self.tables[table].buckets[idx as usize];
        while let Some(k) = cur {
            let entry = &self.entries[k];
            visit(&entry.key, &entry.value);
            cur = entry.next;
        }
    }
}

impl<'a, K, V, S> IntoIterator for &'a Dict<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
