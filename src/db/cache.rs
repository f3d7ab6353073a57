//! Result cache for repeated read queries.
//!
//! Entries are keyed by statement text, parameters and row mode. A lookup
//! names the oldest result it will accept (`max_age`); asking with a longer
//! `max_age` than the entry was stored with extends the entry's life.
//! Concurrent lookups of one key wait for a single fetch.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::db::row::{BackAs, Row};
use crate::error::DbResult;
use crate::models::{Params, Value};

#[derive(Debug)]
struct Entry {
    rows: Arc<Vec<Row>>,
    fetched: Instant,
    max_age: Duration,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.fetched.elapsed() > self.max_age
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Entry>>>;

fn tagged(value: &Value) -> serde_json::Value {
    json!([value.type_name(), value])
}

/// LRU cache of fetched rows.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    /// Least recently used first
    slots: Mutex<IndexMap<String, Slot>>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(IndexMap::new()),
        }
    }

    /// Cache key for a statement.
    ///
    /// Each value is tagged with its type, so values that serialize alike
    /// (`Int(1)` and `Json(1)`, bytes and their base64 text) get distinct keys.
    pub fn key(sql: &str, params: &Params, back_as: Option<BackAs>) -> String {
        let params = match params {
            Params::None => serde_json::Value::Null,
            Params::Positional(values) => values.iter().map(tagged).collect(),
            Params::Named(pairs) => pairs
                .iter()
                .map(|(name, value)| json!([name, tagged(value)]))
                .collect(),
        };
        let mode = back_as.map_or_else(|| "auto".to_string(), |m| m.to_string());
        format!("{}\u{0}{}\u{0}{}", mode, sql, params)
    }

    fn slots(&self) -> MutexGuard<'_, IndexMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find or create the slot for `key` and mark it most recently used.
    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots();
        let slot = match slots.get_index_of(key) {
            Some(idx) => {
                let last = slots.len() - 1;
                slots.move_index(idx, last);
                Arc::clone(&slots[last])
            }
            None => {
                let slot = Slot::default();
                slots.insert(key.to_string(), Arc::clone(&slot));
                slot
            }
        };
        while slots.len() > self.capacity {
            slots.shift_remove_index(0);
        }
        slot
    }

    /// Cached rows for `key` no older than `max_age`, or the result of `fetch`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        max_age: Duration,
        fetch: F,
    ) -> DbResult<Arc<Vec<Row>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<Vec<Row>>>,
    {
        if self.capacity == 0 {
            return fetch().await.map(Arc::new);
        }

        let slot = self.slot(key);
        let mut entry = slot.lock().await;
        if let Some(cached) = (*entry).as_mut() {
            if cached.fetched.elapsed() <= max_age {
                cached.max_age = cached.max_age.max(max_age);
                debug!(rows = cached.rows.len(), "Result cache hit");
                return Ok(Arc::clone(&cached.rows));
            }
        }

        let rows = Arc::new(fetch().await?);
        *entry = Some(Entry {
            rows: Arc::clone(&rows),
            fetched: Instant::now(),
            max_age,
        });
        debug!(rows = rows.len(), "Result cache filled");
        Ok(rows)
    }

    /// Drop every expired entry. Entries being fetched are kept.
    pub fn prune(&self) {
        self.slots().retain(|_, slot| match slot.try_lock() {
            Ok(entry) => (*entry).as_ref().is_some_and(|e| !e.is_expired()),
            Err(_) => true,
        });
    }

    pub fn clear(&self) {
        self.slots().clear();
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
