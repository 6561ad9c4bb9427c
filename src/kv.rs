use anyhow::{Context, Result};
use std::collections::HashMap;
use std::{fs, path::Path};
use thiserror::Error;

use crate::wire::KEY_MAX;

/// Read-only view of the data this node answers queries for.
pub trait KeyValueStore {
    fn lookup(&self, key: &str) -> Option<u32>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KvError {
    #[error("line {line}: expected `key value`")]
    MissingValue { line: usize },
    #[error("line {line}: key longer than {max} bytes")]
    KeyTooLong { line: usize, max: usize },
    #[error("line {line}: `{value}` is not a 32-bit unsigned value")]
    BadValue { line: usize, value: String },
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pairs: HashMap<String, u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: u32) {
        self.pairs.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Parse `key value` lines; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, KvError> {
        let mut store = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let mut parts = raw.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                return Err(KvError::MissingValue { line });
            };
            if key.len() > KEY_MAX {
                return Err(KvError::KeyTooLong { line, max: KEY_MAX });
            }
            let value: u32 = value.parse().map_err(|_| KvError::BadValue { line, value: value.to_string() })?;
            store.insert(key, value);
        }
        Ok(store)
    }
}

impl<K: Into<String>> FromIterator<(K, u32)> for MemoryStore {
    fn from_iter<I: IntoIterator<Item = (K, u32)>>(iter: I) -> Self {
        Self { pairs: iter.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }
}

impl KeyValueStore for MemoryStore {
    fn lookup(&self, key: &str) -> Option<u32> {
        self.pairs.get(key).copied()
    }
}

/// Load the key/value file at `p`.
pub fn load<P: AsRef<Path>>(p: P) -> Result<MemoryStore> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn't read key/value file {}", p.as_ref().display()))?;
    MemoryStore::parse(&text).with_context(|| format!("📝  invalid key/value file {}", p.as_ref().display()))
}
