//! In-memory usage counters.
//!
//! Two independent tallies: requests per model name and dispatches per
//! credential handle. Counters only grow and are not persisted.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct UsageSnapshot {
    pub model_usage: HashMap<String, u64>,
    pub credential_usage: HashMap<String, u64>,
}

impl UsageSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.model_usage.values().sum()
    }
}

#[derive(Debug, Default)]
pub struct UsageRecorder {
    inner: Mutex<UsageSnapshot>,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, UsageSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_model(&self, model: &str) {
        *self.lock().model_usage.entry(model.to_string()).or_insert(0) += 1;
    }

    pub fn record_credential(&self, handle: &str) {
        *self
            .lock()
            .credential_usage
            .entry(handle.to_string())
            .or_insert(0) += 1;
    }

    /// Consistent copy of both tallies taken under one lock.
    pub fn snapshot(&self) -> UsageSnapshot {
        self.lock().clone()
    }
}
