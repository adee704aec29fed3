//! keystone: engine core of an in-memory key-value store.
//!
//! The pieces a single-threaded key-value server is built from:
//!   reactor (readiness + timers) → engine (databases, eviction, cron)
//!   → dict (incrementally rehashed hash table) ← evict (sampled LRU/LFU/TTL)
//! plus a background job queue that keeps slow frees, closes and fsyncs
//! off the reactor thread.

pub mod bio;
pub mod config;
pub mod db;
pub mod dict;
pub mod engine;
pub mod evict;
pub mod reactor;
