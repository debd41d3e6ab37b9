// src/webhooks/log.rs

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Entries kept; older ones are evicted first.
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: String,
    pub url: String,
    pub status: DeliveryStatus,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Bounded FIFO of delivery outcomes, shared between handlers and workers.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    inner: Arc<Mutex<Inner>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a pending entry for `url` and return its id.
    pub fn begin(&self, url: &str, timestamp: String) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push_back(LogEntry {
            id,
            timestamp,
            url: url.to_string(),
            status: DeliveryStatus::Pending,
            response_code: None,
            response_body: None,
            error: None,
        });
        while inner.entries.len() > LOG_CAPACITY {
            inner.entries.pop_front();
        }
        id
    }

    /// Apply `update` to entry `id` if it has not been evicted yet.
    pub fn finish(&self, id: u64, update: impl FnOnce(&mut LogEntry)) -> bool {
        let mut inner = self.lock();
        match inner.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                update(entry);
                true
            }
            None => false,
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}
