//! Runtime configuration for keystone.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All engine knobs (event table size, memory limit, eviction sampling, lazy
//! free routing, background worker sizing) live here.

use std::path::PathBuf;

use anyhow::ensure;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "keystone-server", about = "In-memory key-value engine core")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "keystone.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Stop after this many seconds (0 = run until killed).
    #[arg(long, default_value_t = 10)]
    pub run_secs: u64,

    /// Synthetic writes issued per cron tick.
    #[arg(long, default_value_t = 1000)]
    pub fill_per_tick: usize,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event loop settings.
    pub reactor: ReactorConfig,

    /// Memory limit and eviction sampling.
    pub memory: MemoryConfig,

    /// When deletions are handed to the background queue.
    pub lazyfree: LazyFreeConfig,

    /// Background worker settings.
    pub bio: BioConfig,

    /// Number of logical databases.
    pub databases: usize,
}

/// Event loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Maximum simultaneous clients.
    pub max_clients: usize,

    /// Cron frequency in ticks per second.
    pub hz: u32,
}

/// Descriptors reserved on top of `max_clients` for listeners, log files and
/// background work.
pub const RESERVED_FDS: usize = 128;

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            hz: 10,
        }
    }
}

impl ReactorConfig {
    /// Event table capacity needed to serve `max_clients`.
    pub fn event_table_size(&self) -> usize {
        self.max_clients + RESERVED_FDS
    }
}

/// Which keys the evictor may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxmemoryPolicy {
    #[serde(rename = "volatile-lru")]
    VolatileLru,
    #[serde(rename = "volatile-lfu")]
    VolatileLfu,
    #[serde(rename = "volatile-ttl")]
    VolatileTtl,
    #[serde(rename = "volatile-random")]
    VolatileRandom,
    #[serde(rename = "allkeys-lru")]
    AllkeysLru,
    #[serde(rename = "allkeys-lfu")]
    AllkeysLfu,
    #[serde(rename = "allkeys-random")]
    AllkeysRandom,
    #[serde(rename = "noeviction")]
    NoEviction,
}

impl MaxmemoryPolicy {
    /// Only keys with an expiry are candidates.
    pub fn is_volatile(self) -> bool {
        matches!(
            self,
            Self::VolatileLru | Self::VolatileLfu | Self::VolatileTtl | Self::VolatileRandom
        )
    }

    /// Object access fields hold LFU counters rather than LRU clocks.
    pub fn is_lfu(self) -> bool {
        matches!(self, Self::VolatileLfu | Self::AllkeysLfu)
    }

    pub fn is_random(self) -> bool {
        matches!(self, Self::VolatileRandom | Self::AllkeysRandom)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::VolatileLru => "volatile-lru",
            Self::VolatileLfu => "volatile-lfu",
            Self::VolatileTtl => "volatile-ttl",
            Self::VolatileRandom => "volatile-random",
            Self::AllkeysLru => "allkeys-lru",
            Self::AllkeysLfu => "allkeys-lfu",
            Self::AllkeysRandom => "allkeys-random",
            Self::NoEviction => "noeviction",
        }
    }
}

impl std::fmt::Display for MaxmemoryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory limit and eviction sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Memory limit in bytes (0 = unlimited).
    pub maxmemory: usize,

    pub policy: MaxmemoryPolicy,

    /// Keys sampled per dictionary on each eviction round.
    pub samples: usize,

    /// Higher values make the LFU counter saturate more slowly.
    pub lfu_log_factor: u8,

    /// Minutes of idleness that decrement the LFU counter by one.
    pub lfu_decay_time: u32,

    /// Stale pool entries tolerated before an eviction round gives up.
    pub max_eviction_retries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            maxmemory: 0,
            policy: MaxmemoryPolicy::NoEviction,
            samples: 5,
            lfu_log_factor: 10,
            lfu_decay_time: 1,
            max_eviction_retries: 16,
        }
    }
}

/// When deletions are handed to the background queue instead of run inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyFreeConfig {
    /// Free evicted values in the background.
    pub lazy_eviction: bool,

    /// Flush databases in the background.
    pub lazy_flush: bool,

    /// Free explicitly deleted values in the background.
    pub lazy_user_del: bool,

    /// Values made of more allocations than this are freed in the background
    /// when lazy freeing applies; smaller ones are cheaper to free inline.
    pub threshold: usize,
}

impl Default for LazyFreeConfig {
    fn default() -> Self {
        Self {
            lazy_eviction: false,
            lazy_flush: false,
            lazy_user_del: false,
            threshold: 64,
        }
    }
}

/// Background worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BioConfig {
    /// Stack size of each worker thread in bytes.
    pub thread_stack_size: usize,
}

impl Default for BioConfig {
    fn default() -> Self {
        Self {
            thread_stack_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

/// Default number of logical databases.
pub const DEFAULT_DATABASES: usize = 16;

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.databases >= 1, "databases must be at least 1");
        ensure!(
            (1..=500).contains(&self.reactor.hz),
            "reactor.hz must be between 1 and 500"
        );
        ensure!(self.memory.samples >= 1, "memory.samples must be at least 1");
        ensure!(
            self.bio.thread_stack_size >= 64 * 1024,
            "bio.thread_stack_size must be at least 64 KB"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reactor: ReactorConfig::default(),
            memory: MemoryConfig::default(),
            lazyfree: LazyFreeConfig::default(),
            bio: BioConfig::default(),
            databases: DEFAULT_DATABASES,
        }
    }
}
