//! Logical databases.
//!
//! Each database pairs a keyspace dictionary with an expiry dictionary that
//! maps the subset of keys carrying a TTL to their absolute expiry time in
//! unix milliseconds. The two share key bytes through [`Bytes`] clones.

pub mod object;

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::dict::Dict;

pub use self::object::{StoredObject, Value};

pub type Keyspace = Dict<Bytes, StoredObject>;
pub type Expires = Dict<Bytes, u64>;

pub struct Db {
    id: usize,
    keyspace: Keyspace,
    expires: Expires,
}

impl Db {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            keyspace: Dict::new(),
            expires: Dict::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.keyspace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyspace.is_empty()
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn expires(&self) -> &Expires {
        &self.expires
    }

    pub fn get(&self, key: &[u8]) -> Option<&StoredObject> {
        self.keyspace.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut StoredObject> {
        self.keyspace.get_mut(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.keyspace.contains_key(key)
    }

    /// Store `object` under `key`, dropping any TTL. Returns the previous
    /// object so the caller can decide how to release it.
    pub fn set(&mut self, key: Bytes, object: StoredObject) -> Option<StoredObject> {
        let previous = self.keyspace.unlink(&key[..]).map(|(_, old)| old);
        if previous.is_some() {
            self.expires.delete(&key[..]);
        }
        self.keyspace.replace(key, object);
        previous
    }

    /// Attach an absolute expiry (unix ms). Returns `false` if the key is absent.
    pub fn set_expire(&mut self, key: &[u8], at_ms: u64) -> bool {
        let Some(handle) = self.keyspace.find(key) else {
            return false;
        };
        let Some(shared) = self.keyspace.key(handle).cloned() else {
            return false;
        };
        self.expires.replace(shared, at_ms);
        true
    }

    pub fn expire_at(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key).copied()
    }

    /// Drop the TTL of `key`. Returns `true` if it had one.
    pub fn persist(&mut self, key: &[u8]) -> bool {
        self.expires.delete(key)
    }

    /// Detach `key` from both dictionaries and hand it back.
    pub fn unlink(&mut self, key: &[u8]) -> Option<(Bytes, StoredObject)> {
        let removed = self.keyspace.unlink(key)?;
        self.expires.delete(key);
        Some(removed)
    }

    /// Replace both dictionaries with empty ones and return the old pair.
    pub fn take_all(&mut self) -> (Keyspace, Expires) {
        let keyspace = std::mem::take(&mut self.keyspace);
        let expires = std::mem::take(&mut self.expires);
        debug!(db = self.id, keys = keyspace.len(), "Detached keyspace");
        (keyspace, expires)
    }

    /// Keys whose expiry is at or before `now_ms`, from a sample of
    /// `samples` entries of the expiry table.
    pub fn sample_expired<R: rand::Rng>(&self, now_ms: u64, samples: usize, rng: &mut R) -> Vec<Bytes> {
        self.expires
            .sample_entries(samples, rng)
            .into_iter()
            .filter_map(|h| self.expires.entry(h))
            .filter(|(_, at)| **at <= now_ms)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Incremental rehash of both dictionaries within `budget`. Returns
    /// `true` if either still has work left.
    pub fn rehash_for(&mut self, budget: Duration) -> bool {
        self.keyspace.rehash_for(budget);
        if self.keyspace.is_rehashing() {
            return true;
        }
        self.expires.rehash_for(budget);
        self.expires.is_rehashing()
    }

    /// Start shrinking any dictionary whose fill dropped too low.
    pub fn shrink_if_sparse(&mut self) -> bool {
        let mut started = false;
        if self.keyspace.needs_shrink() {
            started |= self.keyspace.shrink_to_fit();
        }
        if self.expires.needs_shrink() {
            started |= self.expires.shrink_to_fit();
        }
        started
    }

    /// Pause or resume automatic growth of both dictionaries, e.g. while a
    /// forked child shares their pages.
    pub fn set_resize_allowed(&mut self, allowed: bool) {
        self.keyspace.set_resize_allowed(allowed);
        self.expires.set_resize_allowed(allowed);
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("keys", &self.keyspace.len())
            .field("expires", &self.expires.len())
            .finish()
    }
}
