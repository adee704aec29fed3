//! Eviction policy: decides which key to drop under memory pressure.
//!
//! Exact LRU/LFU would need a global ordering of every key. Instead each
//! round samples a handful of keys per database and feeds them through a
//! small pool of the best candidates seen so far, which persists across
//! rounds. Scores:
//! - LRU: idle time in milliseconds
//! - LFU: `255 - decayed access counter`
//! - TTL: `u64::MAX - expire_at`, so the soonest expiry wins
//!
//! The pool may hold keys deleted since they were sampled. Those are
//! discarded when popped and the round retried, a bounded number of times.

pub mod clock;
pub mod pool;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::config::{MaxmemoryPolicy, MemoryConfig};
use crate::db::Db;
use crate::dict::EntryHandle;

pub use self::clock::Clock;
pub use self::pool::{EvictionPool, PoolEntry, EVPOOL_SIZE};

/// A key chosen for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionTarget {
    pub db: usize,
    pub key: Bytes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictorStats {
    pub rounds: u64,
    pub picked: u64,
    pub stale_entries: u64,
    pub given_up: u64,
}

/// The eviction policy engine.
pub struct Evictor {
    policy: MaxmemoryPolicy,
    samples: usize,
    lfu_decay_time: u32,
    max_retries: usize,
    pool: EvictionPool,
    rng: SmallRng,
    /// Where the random policies resume their database rotation.
    next_db: usize,
    stats: EvictorStats,
}

impl Evictor {
    pub fn new(config: &MemoryConfig) -> Self {
        Self::with_rng(config, SmallRng::from_entropy())
    }

    /// Evictor with a fixed sampling seed.
    pub fn with_seed(config: &MemoryConfig, seed: u64) -> Self {
        Self::with_rng(config, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: &MemoryConfig, rng: SmallRng) -> Self {
        Self {
            policy: config.policy,
            samples: config.samples.max(1),
            lfu_decay_time: config.lfu_decay_time,
            max_retries: config.max_eviction_retries,
            pool: EvictionPool::new(),
            rng,
            next_db: 0,
            stats: EvictorStats::default(),
        }
    }

    pub fn policy(&self) -> MaxmemoryPolicy {
        self.policy
    }

    pub fn stats(&self) -> EvictorStats {
        self.stats
    }

    pub fn pool(&self) -> &EvictionPool {
        &self.pool
    }

    /// Pick the next key to evict across `dbs`, or `None` if the policy
    /// forbids eviction or no key qualifies.
    pub fn pick_candidate(&mut self, dbs: &[Db], clock: &Clock) -> Option<EvictionTarget> {
        self.stats.rounds += 1;
        let target = match self.policy {
            MaxmemoryPolicy::NoEviction => None,
            p if p.is_random() => self.pick_random(dbs),
            _ => self.pick_from_pool(dbs, clock),
        };
        if let Some(t) = &target {
            self.stats.picked += 1;
            debug!(db = t.db, key = ?t.key, policy = %self.policy, "Eviction candidate");
        }
        target
    }

    fn pick_from_pool(&mut self, dbs: &[Db], clock: &Clock) -> Option<EvictionTarget> {
        let mut retries = 0;
        loop {
            let mut sampled_keys = 0;
            for db in dbs {
                let candidates = self.dict_len(db);
                if candidates > 0 {
                    self.populate(db, clock);
                    sampled_keys += candidates;
                }
            }
            if sampled_keys == 0 {
                return None;
            }

            while let Some(entry) = self.pool.pop_best() {
                if self.still_candidate(dbs, &entry) {
                    return Some(EvictionTarget {
                        db: entry.db,
                        key: entry.key,
                    });
                }
                self.stats.stale_entries += 1;
                retries += 1;
                if retries > self.max_retries {
                    break;
                }
            }
            // Every pooled entry was stale, or sampling came back empty.
            retries += 1;
            if retries > self.max_retries {
                self.stats.given_up += 1;
                warn!(retries, policy = %self.policy, "Giving up on eviction round");
                return None;
            }
        }
    }

    fn dict_len(&self, db: &Db) -> usize {
        if self.policy.is_volatile() {
            db.expires().len()
        } else {
            db.len()
        }
    }

    /// Sample `samples` keys from `db` and offer each to the pool.
    fn populate(&mut self, db: &Db, clock: &Clock) {
        let handles: Vec<EntryHandle> = if self.policy.is_volatile() {
            db.expires().sample_entries(self.samples, &mut self.rng)
        } else {
            db.keyspace().sample_entries(self.samples, &mut self.rng)
        };

        for handle in handles {
            let Some((key, score)) = self.score(db, handle, clock) else {
                continue;
            };
            self.pool.offer(score, &key, db.id());
        }
    }

    fn score(&self, db: &Db, handle: EntryHandle, clock: &Clock) -> Option<(Bytes, u64)> {
        if self.policy == MaxmemoryPolicy::VolatileTtl {
            let (key, expire_at) = db.expires().entry(handle)?;
            return Some((key.clone(), u64::MAX - *expire_at));
        }

        let (key, object) = if self.policy.is_volatile() {
            let key = db.expires().key(handle)?;
            (key, db.get(key)?)
        } else {
            db.keyspace().entry(handle)?
        };

        let score = if self.policy.is_lfu() {
            255 - clock::lfu_decayed(object.access, clock, self.lfu_decay_time) as u64
        } else {
            clock::idle_ms(clock, object.access)
        };
        Some((key.clone(), score))
    }

    fn still_candidate(&self, dbs: &[Db], entry: &PoolEntry) -> bool {
        let Some(db) = dbs.iter().find(|db| db.id() == entry.db) else {
            return false;
        };
        if self.policy.is_volatile() {
            db.expires().contains_key(&entry.key[..])
        } else {
            db.contains(&entry.key)
        }
    }

    fn pick_random(&mut self, dbs: &[Db]) -> Option<EvictionTarget> {
        let n = dbs.len();
        for i in 0..n {
            let idx = (self.next_db + i) % n;
            let db = &dbs[idx];
            let key = if self.policy.is_volatile() {
                db.expires()
                    .random_entry(&mut self.rng)
                    .and_then(|h| db.expires().key(h))
            } else {
                db.keyspace()
                    .random_entry(&mut self.rng)
                    .and_then(|h| db.keyspace().key(h))
            };
            if let Some(key) = key {
                self.next_db = (idx + 1) % n;
                return Some(EvictionTarget {
                    db: db.id(),
                    key: key.clone(),
                });
            }
        }
        None
    }
}

impl std::fmt::Debug for Evictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evictor")
            .field("policy", &self.policy)
            .field("samples", &self.samples)
            .field("pool", &self.pool.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{StoredObject, Value};

    fn config(policy: MaxmemoryPolicy) -> MemoryConfig {
        MemoryConfig {
            policy,
            ..Default::default()
        }
    }

    fn put(db: &mut Db, key: &str, access: u32) {
        db.set(
            Bytes::from(key.to_string()),
            StoredObject::new(Value::Str(Bytes::from_static(b"v")), access),
        );
    }

    #[test]
    fn test_noeviction_never_picks() {
        let mut db = Db::new(0);
        put(&mut db, "a", 0);
        let mut evictor = Evictor::with_seed(&config(MaxmemoryPolicy::NoEviction), 1);
        assert!(evictor
            .pick_candidate(&[db], &Clock::from_unix_ms(1_000_000))
            .is_none());
    }

    #[test]
    fn test_empty_keyspace_yields_none() {
        let dbs = vec![Db::new(0), Db::new(1)];
        let clock = Clock::from_unix_ms(1_000_000);
        for policy in [
            MaxmemoryPolicy::AllkeysLru,
            MaxmemoryPolicy::VolatileTtl,
            MaxmemoryPolicy::AllkeysRandom,
        ] {
            let mut evictor = Evictor::with_seed(&config(policy), 3);
            assert!(evictor.pick_candidate(&dbs, &clock).is_none());
        }
    }

    #[test]
    fn test_single_key_is_picked() {
        let mut db = Db::new(0);
        put(&mut db, "only", 0);
        let mut evictor = Evictor::with_seed(&config(MaxmemoryPolicy::AllkeysLru), 1);
        let target = evictor
            .pick_candidate(&[db], &Clock::from_unix_ms(5_000_000))
            .unwrap();
        assert_eq!(target, EvictionTarget { db: 0, key: Bytes::from_static(b"only") });
    }

    #[test]
    fn test_volatile_ignores_keys_without_ttl() {
        let mut db = Db::new(0);
        put(&mut db, "persistent", 0);
        let mut evictor = Evictor::with_seed(&config(MaxmemoryPolicy::VolatileLru), 1);
        let clock = Clock::from_unix_ms(5_000_000);
        let dbs = [db];
        assert!(evictor.pick_candidate(&dbs, &clock).is_none());
    }

    #[test]
    fn test_lfu_prefers_low_counter() {
        let clock = Clock::from_unix_ms(60_000 * 100);
        let stamp = (clock.minutes() as u32) << 8;
        let mut db = Db::new(0);
        put(&mut db, "hot", stamp | 200);
        put(&mut db, "cold", stamp | 1);
        let mut evictor = Evictor::with_seed(&config(MaxmemoryPolicy::AllkeysLfu), 9);
        let target = evictor.pick_candidate(&[db], &clock).unwrap();
        assert_eq!(&target.key[..], b"cold");
    }

    #[test]
    fn test_random_policy_rotates_databases() {
        let mut dbs = vec![Db::new(0), Db::new(1)];
        put(&mut dbs[0], "a", 0);
        put(&mut dbs[1], "b", 0);
        let mut evictor = Evictor::with_seed(&config(MaxmemoryPolicy::AllkeysRandom), 5);
        let clock = Clock::from_unix_ms(0);
        let first = evictor.pick_candidate(&dbs, &clock).unwrap();
        let second = evictor.pick_candidate(&dbs, &clock).unwrap();
        assert_ne!(first.db, second.db);
    }

    #[test]
    fn test_stale_entries_are_skipped() {
        let clock = Clock::from_unix_ms(10_000_000);
        let mut db = Db::new(0);
        for i in 0..8 {
            put(&mut db, &format!("k{i}"), 0);
        }
        let mut evictor = Evictor::with_seed(&config(MaxmemoryPolicy::AllkeysLru), 2);
        let mut dbs = vec![db];
        let first = evictor.pick_candidate(&dbs, &clock).unwrap();

        // Delete everything the pool still remembers, keep one fresh key.
        for entry in evictor.pool().iter().cloned().collect::<Vec<_>>() {
            dbs[0].unlink(&entry.key);
        }
        dbs[0].unlink(&first.key);
        if dbs[0].is_empty() {
            put(&mut dbs[0], "survivor", 0);
        }

        let next = evictor.pick_candidate(&dbs, &clock).unwrap();
        assert!(dbs[0].contains(&next.key));
    }
}
