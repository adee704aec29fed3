//! keystone-server: runs the engine on the event reactor.
//!
//! Loads the JSON config, starts the background workers, and drives the
//! engine cron from a reactor timer at `reactor.hz`. Each tick also issues
//! a synthetic write/read load so eviction, expiry, lazy freeing and
//! incremental rehashing all get exercised. Stops after `--run-secs`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use keystone::bio::BackgroundJobs;
use keystone::config::{Cli, Config};
use keystone::db::Value;
use keystone::engine::{Engine, EngineError};
use keystone::reactor::{EventLoop, TimerAction};

/// Share of synthetic writes that carry a TTL, in percent.
const TTL_PERCENT: u32 = 10;

/// Share of synthetic writes that store a large list, in percent.
const LIST_PERCENT: u32 = 2;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "keystone=debug,keystone_server=debug"
    } else {
        "keystone=info,keystone_server=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("keystone v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        max_clients = config.reactor.max_clients,
        hz = config.reactor.hz,
        databases = config.databases,
        "Configuration loaded"
    );
    info!(
        maxmemory = config.memory.maxmemory,
        policy = %config.memory.policy,
        samples = config.memory.samples,
        lazy_eviction = config.lazyfree.lazy_eviction,
        "Memory limits"
    );

    // Background workers first: the engine hands them lazy frees.
    let jobs = Arc::new(
        BackgroundJobs::start(&config.bio).context("failed to start background workers")?,
    );

    let mut event_loop = EventLoop::new(config.reactor.event_table_size())
        .context("failed to create event loop")?;

    let hz = config.reactor.hz.max(1);
    let engine = Rc::new(RefCell::new(Engine::new(config, Arc::clone(&jobs))));

    // Cron: synthetic load, then maintenance.
    let period = Duration::from_millis(1000 / hz as u64);
    let fill = cli.fill_per_tick;
    let cron_engine = Rc::clone(&engine);
    let mut load = SyntheticLoad::new();
    event_loop.register_timer(period, move |_, _| {
        let mut engine = cron_engine.borrow_mut();
        load.tick(&mut engine, fill);
        let report = engine.cron();
        debug!(
            expired = report.expired,
            shrinks = report.shrinks_started,
            rehashing = report.rehashing,
            "Cron tick"
        );
        TimerAction::Again(period)
    });

    // Once a second, a status line.
    let stats_engine = Rc::clone(&engine);
    event_loop.register_timer(Duration::from_secs(1), move |_, _| {
        let engine = stats_engine.borrow();
        let stats = engine.stats();
        let keys: usize = engine.dbs().iter().map(|db| db.len()).sum();
        info!(
            keys,
            used_memory = engine.used_memory(),
            evicted = stats.evicted_keys,
            expired = stats.expired_keys,
            lazyfreed = stats.lazyfreed_objects,
            rejected = stats.rejected_writes,
            "Engine status"
        );
        TimerAction::Again(Duration::from_secs(1))
    });

    if cli.run_secs > 0 {
        event_loop.register_timer(Duration::from_secs(cli.run_secs), |event_loop, _| {
            info!("Run time elapsed, stopping");
            event_loop.stop();
            TimerAction::Done
        });
    }

    info!(period_ms = period.as_millis() as u64, "Starting event loop");
    event_loop.run();

    let engine = engine.borrow();
    let stats = engine.stats();
    let evictor = engine.evictor_stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        evicted = stats.evicted_keys,
        stale_pool_entries = evictor.stale_entries,
        background = ?engine.jobs().stats(),
        "Final statistics"
    );
    drop(engine);

    jobs.shutdown();
    Ok(())
}

/// Generates writes and reads against the engine.
struct SyntheticLoad {
    rng: SmallRng,
    next_key: u64,
}

impl SyntheticLoad {
    fn new() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
            next_key: 0,
        }
    }

    fn tick(&mut self, engine: &mut Engine, writes: usize) {
        let databases = engine.dbs().len();
        for _ in 0..writes {
            let db = self.rng.gen_range(0..databases);
            let key = Bytes::from(format!("key:{}", self.next_key));
            self.next_key += 1;

            let value = if self.rng.gen_range(0..100) < LIST_PERCENT {
                Value::List((0..128).map(|i| Bytes::from(format!("item:{i}"))).collect())
            } else {
                let len = self.rng.gen_range(8..256);
                Value::Str(Bytes::from(vec![b'x'; len]))
            };

            match engine.set(db, key.clone(), value) {
                Ok(()) => {}
                Err(EngineError::OutOfMemory) => continue,
                Err(e) => {
                    warn!(error = %e, "Synthetic write failed");
                    continue;
                }
            }
            if self.rng.gen_range(0..100) < TTL_PERCENT {
                let ttl = Duration::from_millis(self.rng.gen_range(100..5_000));
                let _ = engine.expire(db, &key, ttl);
            }

            // Re-read a recent key so access times spread out.
            if self.next_key > 10 {
                let recent = self.next_key - self.rng.gen_range(1..10);
                let _ = engine.get(db, format!("key:{recent}").as_bytes());
            }
        }
    }
}
