//! Stored values and their access metadata.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

/// Per-entry bookkeeping charged against `maxmemory` on top of key and
/// value bytes.
pub const ENTRY_OVERHEAD: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
}

impl Value {
    /// Number of separate allocations a free would walk. Used to decide
    /// whether releasing the value is worth a background job.
    pub fn free_effort(&self) -> usize {
        match self {
            Value::Str(_) => 1,
            Value::List(items) => items.len(),
            Value::Set(members) => members.len(),
            Value::Hash(fields) => fields.len(),
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::List(items) => items.iter().map(|b| b.len() + 16).sum(),
            Value::Set(members) => members.iter().map(|b| b.len() + 24).sum(),
            Value::Hash(fields) => fields.iter().map(|(k, v)| k.len() + v.len() + 32).sum(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

/// A value plus its 24-bit access field.
///
/// Under LRU policies `access` holds the LRU clock of the last touch. Under
/// LFU policies it holds 16 bits of minutes since the epoch (wrapping)
/// followed by an 8-bit logarithmic access counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub value: Value,
    pub access: u32,
}

impl StoredObject {
    pub fn new(value: Value, access: u32) -> Self {
        Self { value, access }
    }

    /// Bytes charged for storing this object under `key`.
    pub fn charge(&self, key: &[u8]) -> usize {
        key.len() + self.value.approx_size() + ENTRY_OVERHEAD
    }
}
