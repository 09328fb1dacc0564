//! Credential rotation.
//!
//! The pool (loaded credentials plus rotation cursor) lives behind one mutex;
//! every selection runs start to finish under that lock so concurrent callers
//! can never share a usage slot.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::{
    normalize_handle, Credential, CredentialRecord, CredentialStore, CredentialSummary, StoreError,
};
use crate::usage::UsageRecorder;
use crate::util::now_epoch;

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("no valid credential available")]
    Unavailable,
    #[error("credential index {index} out of range (pool size {len})")]
    InvalidIndex { index: usize, len: usize },
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    Manual,
    Fixed,
    Auto,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveCredential {
    pub index: usize,
    pub handle: String,
    pub user_id: Option<String>,
}

/// Read-only snapshot of rotation state.
#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub mode: RotationMode,
    pub active: Option<ActiveCredential>,
    pub total: usize,
    pub valid: usize,
    pub rotation_quota: u64,
    /// Only reported in auto mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<u64>,
}

/// Loaded credentials plus rotation cursor. Indices point into
/// `credentials` (load order), not into the valid subset.
#[derive(Debug, Default)]
struct CredentialPool {
    credentials: Vec<Credential>,
    current_index: usize,
    usage_count: u64,
    manual_index: Option<usize>,
    rotation_quota: u64,
}

impl CredentialPool {
    fn valid_positions(&self, now: i64) -> Vec<usize> {
        self.credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_expired_at(now))
            .map(|(i, _)| i)
            .collect()
    }

    /// Selection algorithm. Returns the chosen position.
    fn select(&mut self, now: i64) -> Result<usize, RotationError> {
        let valid = self.valid_positions(now);
        let first = *valid.first().ok_or(RotationError::Unavailable)?;

        if !valid.contains(&self.current_index) {
            self.current_index = first;
            self.usage_count = 0;
        }

        if let Some(pinned) = self.manual_index {
            if valid.contains(&pinned) {
                return Ok(pinned);
            }
            warn!(
                "Pinned credential #{} is no longer valid, returning to automatic rotation",
                pinned
            );
            self.manual_index = None;
        }

        if self.rotation_quota == 0 {
            return Ok(self.current_index);
        }

        if self.usage_count >= self.rotation_quota {
            let pos = valid
                .iter()
                .position(|&i| i == self.current_index)
                .unwrap_or(0);
            self.current_index = valid[(pos + 1) % valid.len()];
            self.usage_count = 0;
            info!("Credential rotation triggered.");
        }

        self.usage_count += 1;
        Ok(self.current_index)
    }

    fn handle_at(&self, index: usize) -> Option<String> {
        self.credentials.get(index).map(|c| c.handle.clone())
    }

    fn position_of(&self, handle: &str) -> Option<usize> {
        self.credentials.iter().position(|c| c.handle == handle)
    }

    /// Swap in a freshly loaded list, keeping cursor and pin attached to the
    /// same handles where they survived.
    fn replace(&mut self, credentials: Vec<Credential>) {
        let current = self.handle_at(self.current_index);
        let pinned = self.manual_index.and_then(|i| self.handle_at(i));
        self.credentials = credentials;

        match current.and_then(|h| self.position_of(&h)) {
            Some(i) => self.current_index = i,
            None => {
                self.current_index = 0;
                self.usage_count = 0;
            }
        }
        self.manual_index = pinned.and_then(|h| self.position_of(&h));
    }
}

/// Process-wide rotation manager over a [`CredentialStore`].
pub struct CredentialRotator {
    store: CredentialStore,
    usage: Arc<UsageRecorder>,
    pool: Mutex<CredentialPool>,
}

impl CredentialRotator {
    /// Build a rotator and perform the initial load.
    pub fn new(
        store: CredentialStore,
        usage: Arc<UsageRecorder>,
        rotation_quota: u64,
    ) -> Result<Self, RotationError> {
        let rotator = Self::with_credentials(store, usage, Vec::new(), rotation_quota);
        rotator.reload()?;
        Ok(rotator)
    }

    /// Build a rotator over an already loaded credential list.
    pub fn with_credentials(
        store: CredentialStore,
        usage: Arc<UsageRecorder>,
        credentials: Vec<Credential>,
        rotation_quota: u64,
    ) -> Self {
        Self {
            store,
            usage,
            pool: Mutex::new(CredentialPool {
                credentials,
                rotation_quota,
                ..CredentialPool::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CredentialPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn next(&self) -> Result<Credential, RotationError> {
        self.next_at(now_epoch() as i64)
    }

    /// Select the credential for one outbound request as of `now`.
    pub fn next_at(&self, now: i64) -> Result<Credential, RotationError> {
        let credential = {
            let mut pool = self.lock();
            let index = pool.select(now)?;
            debug!(
                "Using credential #{} (usage {}/{})",
                index + 1,
                pool.usage_count,
                pool.rotation_quota
            );
            pool.credentials[index].clone()
        };
        self.usage.record_credential(&credential.handle);
        Ok(credential)
    }

    pub fn set_manual(&self, index: usize) -> Result<Credential, RotationError> {
        let mut pool = self.lock();
        let len = pool.credentials.len();
        let credential = pool
            .credentials
            .get(index)
            .cloned()
            .ok_or(RotationError::InvalidIndex { index, len })?;
        pool.manual_index = Some(index);
        info!("Manually selected credential #{}: {}", index + 1, credential.handle);
        Ok(credential)
    }

    pub fn clear_manual(&self) {
        self.lock().manual_index = None;
        info!("Switched to automatic credential rotation");
    }

    pub fn rotation_quota(&self) -> u64 {
        self.lock().rotation_quota
    }

    pub fn set_rotation_quota(&self, quota: u64) {
        let mut pool = self.lock();
        pool.rotation_quota = quota;
        info!("Rotation quota set to {}", quota);
    }

    pub fn status(&self) -> RotationStatus {
        self.status_at(now_epoch() as i64)
    }

    pub fn status_at(&self, now: i64) -> RotationStatus {
        let pool = self.lock();
        let valid = pool.valid_positions(now);

        let pinned = pool.manual_index.filter(|i| valid.contains(i));
        let mode = if pinned.is_some() {
            RotationMode::Manual
        } else if pool.rotation_quota == 0 {
            RotationMode::Fixed
        } else {
            RotationMode::Auto
        };

        let active_index = pinned.or_else(|| {
            if valid.contains(&pool.current_index) {
                Some(pool.current_index)
            } else {
                valid.first().copied()
            }
        });
        let active = active_index.map(|index| {
            let c = &pool.credentials[index];
            ActiveCredential {
                index,
                handle: c.handle.clone(),
                user_id: c.record.user_id.clone(),
            }
        });

        RotationStatus {
            mode,
            active,
            total: pool.credentials.len(),
            valid: valid.len(),
            rotation_quota: pool.rotation_quota,
            usage_count: (mode == RotationMode::Auto).then_some(pool.usage_count),
        }
    }

    /// Detailed per-credential listing for introspection.
    pub fn enumerate(&self) -> Vec<CredentialSummary> {
        let now = now_epoch() as i64;
        let pool = self.lock();
        pool.credentials
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut summary = c.summary(i, now);
                summary.active = i == pool.current_index;
                summary.pinned = pool.manual_index == Some(i);
                summary
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the credential directory. Directory I/O happens outside the
    /// lock; only the swap is serialized.
    pub fn reload(&self) -> Result<usize, RotationError> {
        let credentials = self.store.load_all()?;
        let count = credentials.len();
        self.lock().replace(credentials);
        Ok(count)
    }

    /// Write a record and reload. Returns the handle written.
    pub fn persist(
        &self,
        record: &CredentialRecord,
        handle: Option<&str>,
    ) -> Result<String, RotationError> {
        let handle = self.store.persist(record, handle)?;
        self.reload()?;
        Ok(handle)
    }

    /// Delete by handle. Accepts the same forms as [`Self::persist`], with or
    /// without the `.json` suffix.
    pub fn delete(&self, handle: &str) -> Result<(), RotationError> {
        let handle = normalize_handle(handle.trim())?;
        let known = self.lock().position_of(&handle).is_some();
        if !known {
            return Err(RotationError::NotFound(handle));
        }
        self.store.remove(&handle)?;
        self.reload()?;
        Ok(())
    }

    pub fn delete_at(&self, index: usize) -> Result<String, RotationError> {
        let handle = {
            let pool = self.lock();
            let len = pool.credentials.len();
            pool.handle_at(index)
                .ok_or(RotationError::InvalidIndex { index, len })?
        };
        self.delete(&handle)?;
        Ok(handle)
    }
}
