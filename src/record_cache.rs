//! Secondary read-through cache for config and code records.
//!
//! Values are the records' JSON text. The dispatcher treats every failure
//! here as a miss and goes to the record store.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(60);

pub trait RecordCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

pub fn config_key(config_id: &str) -> String {
    format!("config/{config_id}")
}

pub fn code_key(code_id: &str) -> String {
    format!("code/{code_id}")
}

#[derive(Default)]
pub struct MemoryRecordCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryRecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordCache for MemoryRecordCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
