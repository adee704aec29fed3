//! Engine: the databases plus everything that keeps them within bounds.
//!
//! Owns the logical databases, the evictor and the LRU clock, and holds a
//! handle to the background job queue for lazy freeing. All of it runs on
//! the reactor thread:
//! - writes check memory pressure first and evict until under `maxmemory`
//! - reads touch the object's access field (LRU clock or LFU counter)
//! - [`Engine::cron`] refreshes the clock, expires keys, and drives
//!   incremental rehashing and shrinking of the dictionaries

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info};

use crate::bio::{BackgroundJobs, Job};
use crate::config::Config;
use crate::db::{Db, StoredObject, Value};
use crate::evict::{clock, Clock, Evictor, EvictorStats};

/// Keys sampled from each expiry table per active-expire pass.
const EXPIRE_KEYS_PER_LOOP: usize = 20;

/// Passes over one database stop once fewer than this share (in percent)
/// of sampled keys turned out expired.
const EXPIRE_ACCEPTABLE_STALE: usize = 25;

/// Upper bound on passes per database per cron tick.
const EXPIRE_MAX_PASSES: usize = 16;

/// Time the cron may spend rehashing a database per tick.
const CRON_REHASH_BUDGET: Duration = Duration::from_millis(1);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    #[error("no database {0}")]
    NoSuchDb(usize),

    #[error("command not allowed when used memory > maxmemory")]
    OutOfMemory,
}

/// Outcome of [`Engine::perform_evictions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Under the limit (or no limit set).
    Ok,
    /// Still over the limit: the policy forbids eviction or nothing qualifies.
    Fail,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub hits: u64,
    pub misses: u64,
    pub evicted_keys: u64,
    pub expired_keys: u64,
    /// Values handed to the background queue instead of dropped inline.
    pub lazyfreed_objects: u64,
    pub rejected_writes: u64,
}

/// What one cron tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CronReport {
    pub expired: usize,
    pub shrinks_started: usize,
    pub rehashing: bool,
}

pub struct Engine {
    config: Config,
    dbs: Vec<Db>,
    /// Bytes charged per database.
    db_memory: Vec<usize>,
    evictor: Evictor,
    jobs: Arc<BackgroundJobs>,
    clock: Clock,
    rng: SmallRng,
    stats: EngineStats,
}

impl Engine {
    pub fn new(config: Config, jobs: Arc<BackgroundJobs>) -> Self {
        let evictor = Evictor::new(&config.memory);
        Self::with_evictor(config, jobs, evictor)
    }

    /// Engine with a caller-built evictor, e.g. one with a fixed seed.
    pub fn with_evictor(config: Config, jobs: Arc<BackgroundJobs>, evictor: Evictor) -> Self {
        let dbs = (0..config.databases).map(Db::new).collect();
        info!(
            databases = config.databases,
            maxmemory = config.memory.maxmemory,
            policy = %config.memory.policy,
            "Engine initialized"
        );
        Self {
            db_memory: vec![0; config.databases],
            dbs,
            evictor,
            jobs,
            clock: Clock::now(),
            rng: SmallRng::from_entropy(),
            stats: EngineStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dbs(&self) -> &[Db] {
        &self.dbs
    }

    pub fn db(&self, id: usize) -> Result<&Db, EngineError> {
        self.dbs.get(id).ok_or(EngineError::NoSuchDb(id))
    }

    pub fn jobs(&self) -> &Arc<BackgroundJobs> {
        &self.jobs
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Override the clock snapshot; the next cron tick refreshes it again.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    pub fn used_memory(&self) -> usize {
        self.db_memory.iter().sum()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn evictor_stats(&self) -> EvictorStats {
        self.evictor.stats()
    }

    fn check_db(&self, id: usize) -> Result<(), EngineError> {
        if id < self.dbs.len() {
            Ok(())
        } else {
            Err(EngineError::NoSuchDb(id))
        }
    }

    /// Access field for an object created now.
    fn fresh_access(&self) -> u32 {
        if self.config.memory.policy.is_lfu() {
            clock::lfu_init(&self.clock)
        } else {
            self.clock.lru()
        }
    }

    // ─── Commands ────────────────────────────────────────────────────────

    /// Store `value` under `key`, evicting first if over the memory limit.
    pub fn set(&mut self, db: usize, key: Bytes, value: Value) -> Result<(), EngineError> {
        self.check_db(db)?;
        if self.perform_evictions() == EvictionOutcome::Fail {
            self.stats.rejected_writes += 1;
            return Err(EngineError::OutOfMemory);
        }

        let object = StoredObject::new(value, self.fresh_access());
        self.db_memory[db] += object.charge(&key);
        let charge_key = key.clone();
        if let Some(old) = self.dbs[db].set(key, object) {
            self.release(db, &charge_key, old, false);
        }
        Ok(())
    }

    /// Read `key`, expiring it first if its TTL passed, and record the access.
    pub fn get(&mut self, db: usize, key: &[u8]) -> Result<Option<&Value>, EngineError> {
        self.check_db(db)?;
        if self.expire_if_needed(db, key) {
            self.stats.misses += 1;
            return Ok(None);
        }

        let now = self.clock;
        let memory = &self.config.memory;
        let Some(object) = self.dbs[db].get_mut(key) else {
            self.stats.misses += 1;
            return Ok(None);
        };
        object.access = if memory.policy.is_lfu() {
            clock::lfu_touch(
                object.access,
                &now,
                memory.lfu_log_factor,
                memory.lfu_decay_time,
                &mut self.rng,
            )
        } else {
            now.lru()
        };
        self.stats.hits += 1;
        Ok(Some(&object.value))
    }

    /// Set an absolute expiry in unix milliseconds.
    pub fn expire_at(&mut self, db: usize, key: &[u8], at_ms: u64) -> Result<bool, EngineError> {
        self.check_db(db)?;
        Ok(self.dbs[db].set_expire(key, at_ms))
    }

    /// Set an expiry relative to the engine clock.
    pub fn expire(&mut self, db: usize, key: &[u8], ttl: Duration) -> Result<bool, EngineError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let at = self.clock.unix_ms().saturating_add(ttl_ms);
        self.expire_at(db, key, at)
    }

    /// Remaining time to live, `None` if the key is absent or persistent.
    pub fn ttl(&self, db: usize, key: &[u8]) -> Result<Option<Duration>, EngineError> {
        let at = self.db(db)?.expire_at(key);
        Ok(at.map(|at| Duration::from_millis(at.saturating_sub(self.clock.unix_ms()))))
    }

    /// Remove `key`. Large values go to the background queue when
    /// `lazyfree.lazy_user_del` is set.
    pub fn delete(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        self.check_db(db)?;
        let lazy = self.config.lazyfree.lazy_user_del;
        Ok(self.remove_key(db, key, lazy))
    }

    /// Remove `key`, always considering background release (`UNLINK`).
    pub fn unlink(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        self.check_db(db)?;
        Ok(self.remove_key(db, key, true))
    }

    /// Empty one database. With `background` both dictionaries are handed
    /// to the lazy-free worker in one job.
    pub fn flush_db(&mut self, db: usize, background: bool) -> Result<usize, EngineError> {
        self.check_db(db)?;
        let (keyspace, expires) = self.dbs[db].take_all();
        let removed = keyspace.len();
        self.db_memory[db] = 0;
        if background && removed > 0 {
            self.jobs.submit(Job::lazy_free_pair(keyspace, expires));
            self.stats.lazyfreed_objects += 1;
        } else {
            drop(keyspace);
            drop(expires);
        }
        debug!(db, removed, background, "Flushed database");
        Ok(removed)
    }

    /// Empty every database. `background` defaults to `lazyfree.lazy_flush`
    /// when `None`.
    pub fn flush_all(&mut self, background: Option<bool>) -> usize {
        let background = background.unwrap_or(self.config.lazyfree.lazy_flush);
        let mut removed = 0;
        for db in 0..self.dbs.len() {
            removed += self.flush_db(db, background).unwrap_or(0);
        }
        removed
    }

    // ─── Memory pressure ─────────────────────────────────────────────────

    /// Evict keys until used memory is back under `maxmemory`.
    pub fn perform_evictions(&mut self) -> EvictionOutcome {
        let limit = self.config.memory.maxmemory;
        if limit == 0 || self.used_memory() <= limit {
            return EvictionOutcome::Ok;
        }

        let start = self.used_memory();
        let mut evicted = 0u64;
        let lazy = self.config.lazyfree.lazy_eviction;
        let outcome = loop {
            if self.used_memory() <= limit {
                break EvictionOutcome::Ok;
            }
            let Some(target) = self.evictor.pick_candidate(&self.dbs, &self.clock) else {
                break EvictionOutcome::Fail;
            };
            if self.remove_key(target.db, &target.key, lazy) {
                evicted += 1;
            }
        };

        self.stats.evicted_keys += evicted;
        if evicted > 0 {
            debug!(
                evicted,
                freed = start - self.used_memory().min(start),
                used = self.used_memory(),
                limit,
                "Eviction round"
            );
        }
        outcome
    }

    // ─── Cron ────────────────────────────────────────────────────────────

    /// Periodic maintenance, run `reactor.hz` times per second.
    pub fn cron(&mut self) -> CronReport {
        self.clock = Clock::now();
        self.cron_at(self.clock)
    }

    /// [`cron`](Self::cron) against an explicit clock.
    pub fn cron_at(&mut self, now: Clock) -> CronReport {
        self.clock = now;
        let mut report = CronReport {
            expired: self.active_expire_cycle(),
            ..Default::default()
        };

        for db in &mut self.dbs {
            if db.shrink_if_sparse() {
                report.shrinks_started += 1;
            }
        }
        // At most one database gets rehash time per tick.
        for db in &mut self.dbs {
            if db.rehash_for(CRON_REHASH_BUDGET) {
                report.rehashing = true;
                break;
            }
        }

        if self.config.memory.maxmemory > 0 {
            self.perform_evictions();
        }
        report
    }

    /// Allow or forbid automatic dictionary growth, e.g. while a snapshot
    /// child shares pages with this process.
    pub fn set_resize_allowed(&mut self, allowed: bool) {
        for db in &mut self.dbs {
            db.set_resize_allowed(allowed);
        }
    }

    /// Sample expiry tables and drop keys past their TTL.
    fn active_expire_cycle(&mut self) -> usize {
        let now = self.clock.unix_ms();
        let mut expired = 0;
        for db in 0..self.dbs.len() {
            for _ in 0..EXPIRE_MAX_PASSES {
                if self.dbs[db].expires().is_empty() {
                    break;
                }
                let keys = self.dbs[db].sample_expired(now, EXPIRE_KEYS_PER_LOOP, &mut self.rng);
                let found = keys.len();
                for key in keys {
                    if self.remove_key(db, &key, self.config.lazyfree.lazy_eviction) {
                        expired += 1;
                    }
                }
                if found * 100 / EXPIRE_KEYS_PER_LOOP <= EXPIRE_ACCEPTABLE_STALE {
                    break;
                }
            }
        }
        self.stats.expired_keys += expired as u64;
        expired
    }

    fn expire_if_needed(&mut self, db: usize, key: &[u8]) -> bool {
        match self.dbs[db].expire_at(key) {
            Some(at) if at <= self.clock.unix_ms() => {
                self.remove_key(db, key, self.config.lazyfree.lazy_eviction);
                self.stats.expired_keys += 1;
                true
            }
            _ => false,
        }
    }

    fn remove_key(&mut self, db: usize, key: &[u8], lazy: bool) -> bool {
        match self.dbs[db].unlink(key) {
            Some((key, object)) => {
                self.release(db, &key, object, lazy);
                true
            }
            None => false,
        }
    }

    /// Uncharge `object` and free it, in the background when `lazy` and the
    /// value is big enough to be worth it.
    fn release(&mut self, db: usize, key: &[u8], object: StoredObject, lazy: bool) {
        let charge = object.charge(key);
        self.db_memory[db] = self.db_memory[db].saturating_sub(charge);
        if lazy && object.value.free_effort() > self.config.lazyfree.threshold {
            self.jobs.submit(Job::lazy_free(object));
            self.stats.lazyfreed_objects += 1;
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dbs", &self.dbs.len())
            .field("used_memory", &self.used_memory())
            .field("evictor", &self.evictor)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::bio::JobClass;
    use crate::config::MaxmemoryPolicy;
    use crate::db::object::ENTRY_OVERHEAD;

    fn engine(config: Config) -> Engine {
        let jobs = Arc::new(BackgroundJobs::start(&config.bio).unwrap());
        let evictor = Evictor::with_seed(&config.memory, 7);
        let mut engine = Engine::with_evictor(config, jobs, evictor);
        engine.set_clock(Clock::from_unix_ms(1_000_000_000));
        engine
    }

    fn small() -> Config {
        Config {
            databases: 2,
            ..Default::default()
        }
    }

    fn string(s: &str) -> Value {
        Value::Str(Bytes::from(s.to_string()))
    }

    #[test]
    fn test_set_get_delete() {
        let mut e = engine(small());
        e.set(0, Bytes::from_static(b"k"), string("v")).unwrap();
        assert_eq!(e.get(0, b"k").unwrap(), Some(&string("v")));
        assert_eq!(e.used_memory(), 1 + 1 + ENTRY_OVERHEAD);

        assert!(e.delete(0, b"k").unwrap());
        assert!(!e.delete(0, b"k").unwrap());
        assert_eq!(e.get(0, b"k").unwrap(), None);
        assert_eq!(e.used_memory(), 0);
        assert_eq!(e.stats().hits, 1);
        assert_eq!(e.stats().misses, 1);
    }

    #[test]
    fn test_bad_db_index() {
        let mut e = engine(small());
        assert_eq!(
            e.set(9, Bytes::from_static(b"k"), string("v")),
            Err(EngineError::NoSuchDb(9))
        );
    }

    #[test]
    fn test_overwrite_uncharges_old_value() {
        let mut e = engine(small());
        e.set(0, Bytes::from_static(b"k"), string("a-long-value")).unwrap();
        e.set(0, Bytes::from_static(b"k"), string("x")).unwrap();
        assert_eq!(e.used_memory(), 1 + 1 + ENTRY_OVERHEAD);
    }

    #[test]
    fn test_get_expires_lazily() {
        let mut e = engine(small());
        e.set(0, Bytes::from_static(b"k"), string("v")).unwrap();
        assert!(e.expire(0, b"k", Duration::from_secs(10)).unwrap());
        assert_eq!(e.ttl(0, b"k").unwrap(), Some(Duration::from_secs(10)));

        let later = Clock::from_unix_ms(e.clock().unix_ms() + 10_000);
        e.set_clock(later);
        assert_eq!(e.get(0, b"k").unwrap(), None);
        assert_eq!(e.stats().expired_keys, 1);
        assert!(e.db(0).unwrap().is_empty());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let mut e = engine(small());
        e.set(0, Bytes::from_static(b"k"), string("v")).unwrap();
        assert!(e.expire(0, b"k", Duration::MAX).unwrap());
        assert_eq!(e.db(0).unwrap().expire_at(b"k"), Some(u64::MAX));

        let report = e.cron_at(Clock::from_unix_ms(e.clock().unix_ms() + 1_000));
        assert_eq!(report.expired, 0);
        assert_eq!(e.get(0, b"k").unwrap(), Some(&string("v")));
    }

    #[test]
    fn test_cron_expires_in_background_sweep() {
        let mut e = engine(small());
        let base = e.clock().unix_ms();
        for i in 0..50 {
            let key = Bytes::from(format!("k{i}"));
            e.set(1, key.clone(), string("v")).unwrap();
            e.expire_at(1, &key, base + 100).unwrap();
        }
        e.set(1, Bytes::from_static(b"keep"), string("v")).unwrap();

        let mut expired = 0;
        for _ in 0..20 {
            expired += e.cron_at(Clock::from_unix_ms(base + 1_000)).expired;
        }
        assert_eq!(expired, 50);
        assert_eq!(e.db(1).unwrap().len(), 1);
    }

    #[test]
    fn test_noeviction_rejects_writes_over_limit() {
        let mut config = small();
        config.memory.maxmemory = 200;
        config.memory.policy = MaxmemoryPolicy::NoEviction;
        let mut e = engine(config);

        let mut rejected = false;
        for i in 0..10 {
            if e.set(0, Bytes::from(format!("key{i}")), string("value")).is_err() {
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        assert_eq!(e.stats().rejected_writes, 1);
    }

    #[test]
    fn test_allkeys_lru_keeps_memory_bounded() {
        let mut config = small();
        config.memory.maxmemory = 4_096;
        config.memory.policy = MaxmemoryPolicy::AllkeysLru;
        let mut e = engine(config);

        for i in 0..500 {
            e.set(i % 2, Bytes::from(format!("key:{i}")), string("payload"))
                .unwrap();
        }
        // One write may overshoot before the next eviction round.
        assert!(e.used_memory() <= 4_096 + 100);
        assert!(e.stats().evicted_keys > 0);
    }

    #[test]
    fn test_lazy_delete_routes_big_values_to_worker() {
        let mut config = small();
        config.lazyfree.lazy_user_del = true;
        let mut e = engine(config);

        let big: VecDeque<Bytes> = (0..1_000).map(|i| Bytes::from(format!("{i}"))).collect();
        e.set(0, Bytes::from_static(b"big"), Value::List(big)).unwrap();
        e.set(0, Bytes::from_static(b"small"), string("v")).unwrap();

        e.delete(0, b"big").unwrap();
        e.delete(0, b"small").unwrap();
        assert_eq!(e.stats().lazyfreed_objects, 1);
        e.jobs().wait_drained(JobClass::LazyFree);
        assert_eq!(e.jobs().stats().lazy_freed, 1);
    }

    #[test]
    fn test_flush_db_in_background() {
        let mut e = engine(small());
        for i in 0..100 {
            e.set(0, Bytes::from(format!("k{i}")), string("v")).unwrap();
        }
        assert_eq!(e.flush_db(0, true).unwrap(), 100);
        assert!(e.db(0).unwrap().is_empty());
        assert_eq!(e.used_memory(), 0);
        e.jobs().wait_drained(JobClass::LazyFree);
        assert_eq!(e.jobs().stats().lazy_freed, 1);
    }

    #[test]
    fn test_lfu_touch_bumps_counter_for_new_keys() {
        let mut config = small();
        config.memory.policy = MaxmemoryPolicy::AllkeysLfu;
        let mut e = engine(config);
        e.set(0, Bytes::from_static(b"k"), string("v")).unwrap();
        let before = e.db(0).unwrap().get(b"k").unwrap().access & 0xFF;
        assert_eq!(before, clock::LFU_INIT_VAL as u32);
        e.get(0, b"k").unwrap();
        let after = e.db(0).unwrap().get(b"k").unwrap().access & 0xFF;
        assert_eq!(after, before + 1);
    }
}
