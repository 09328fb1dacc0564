//! Credential store
//!
//! One JSON file per credential inside a directory. Files are independent:
//! a broken file is logged and skipped, never fatal to the pool.
//!
//! Record format (unknown fields are preserved and written back):
//! ```json
//! { "bearer_token": "...", "user_id": "...", "created_at": 1700000000,
//!   "expires_in": 86400, "refresh_token": "...", "token_type": "Bearer",
//!   "scope": "...", "domain": "...", "session_state": "..." }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::util::now_epoch;

/// Credentials are treated as expired this many seconds before their
/// nominal expiry.
pub const EXPIRY_GRACE_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("credential directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file {handle}: {reason}")]
    File { handle: String, reason: String },
    #[error("invalid credential handle: {0}")]
    InvalidHandle(String),
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// On-disk credential record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub bearer_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialRecord {
    pub fn new(bearer_token: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            bearer_token: bearer_token.into(),
            user_id,
            created_at: Some(now_epoch() as i64),
            expires_in: None,
            refresh_token: None,
            token_type: default_token_type(),
            scope: None,
            domain: None,
            session_state: None,
            extra: Map::new(),
        }
    }

    /// Absolute expiry in epoch seconds. Records without `expires_in` never
    /// expire; a missing `created_at` is read as "unknown issue time" and
    /// likewise never expires.
    pub fn expires_at(&self) -> Option<i64> {
        match (self.created_at, self.expires_in) {
            (Some(created), Some(ttl)) => Some(created.saturating_add(ttl)),
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at()
            .map(|exp| now >= exp - EXPIRY_GRACE_SECS)
            .unwrap_or(false)
    }
}

/// A loaded credential together with its file handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    /// File name inside the credential directory; stable handle for
    /// selection, deletion and usage accounting.
    pub handle: String,
    pub record: CredentialRecord,
}

impl Credential {
    pub fn bearer_token(&self) -> &str {
        &self.record.bearer_token
    }

    pub fn user_id(&self) -> Option<&str> {
        self.record.user_id.as_deref()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.record.is_expired_at(now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_epoch() as i64)
    }

    /// `first10...last4`, or `Invalid Token` for short tokens.
    pub fn token_preview(&self) -> String {
        let token = self.bearer_token();
        let chars: Vec<char> = token.chars().collect();
        if chars.len() > 14 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        } else {
            "Invalid Token".to_string()
        }
    }

    pub fn summary(&self, index: usize, now: i64) -> CredentialSummary {
        CredentialSummary {
            index,
            handle: self.handle.clone(),
            user_id: self.record.user_id.clone(),
            created_at: self.record.created_at,
            expires_at: self.record.expires_at(),
            expired: self.is_expired_at(now),
            token_type: self.record.token_type.clone(),
            scope: self.record.scope.clone(),
            domain: self.record.domain.clone(),
            has_token: !self.bearer_token().is_empty(),
            token_preview: self.token_preview(),
            active: false,
            pinned: false,
        }
    }
}

/// Introspection view of a credential; never exposes the full token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialSummary {
    pub index: usize,
    pub handle: String,
    pub user_id: Option<String>,
    pub created_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub expired: bool,
    pub token_type: String,
    pub scope: Option<String>,
    pub domain: Option<String>,
    pub has_token: bool,
    pub token_preview: String,
    pub active: bool,
    pub pinned: bool,
}

/// Directory-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory and load every `*.json` record, sorted by file name.
    ///
    /// Files that fail to parse or lack `bearer_token` are skipped with a log
    /// line. Only directory-level failures are returned as errors; an empty or
    /// freshly created directory yields an empty list.
    pub fn load_all(&self) -> Result<Vec<Credential>> {
        info!("Loading credentials from: {}", self.dir.display());

        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Directory {
                path: self.dir.clone(),
                source,
            })?;
            warn!(
                "Credentials directory created at {}. No credentials found.",
                self.dir.display()
            );
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Directory {
            path: self.dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::load_file(&path) {
                Ok(cred) => {
                    info!("Successfully loaded credential: {}", cred.handle);
                    out.push(cred);
                }
                Err(err) => {
                    error!("Skipping credential file: {}", err);
                }
            }
        }

        info!("Loaded a total of {} credentials.", out.len());
        Ok(out)
    }

    fn load_file(path: &Path) -> Result<Credential> {
        let handle = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| StoreError::InvalidHandle(path.display().to_string()))?;

        let text = std::fs::read_to_string(path).map_err(|e| StoreError::File {
            handle: handle.clone(),
            reason: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| StoreError::File {
            handle: handle.clone(),
            reason: e.to_string(),
        })?;
        if value.get("bearer_token").and_then(|t| t.as_str()).is_none() {
            return Err(StoreError::File {
                handle,
                reason: "missing bearer_token".to_string(),
            });
        }
        let record: CredentialRecord =
            serde_json::from_value(value).map_err(|e| StoreError::File {
                handle: handle.clone(),
                reason: e.to_string(),
            })?;

        Ok(Credential { handle, record })
    }

    /// Write a record. Without a handle one is derived from the record's user
    /// id and the current time. Returns the handle written.
    pub fn persist(&self, record: &CredentialRecord, handle: Option<&str>) -> Result<String> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Directory {
            path: self.dir.clone(),
            source,
        })?;

        let handle = match handle.map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => normalize_handle(h)?,
            None => self.unused_handle(record),
        };

        let path = self.dir.join(&handle);
        let body = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, body)?;
        info!("Saved credential: {}", handle);
        Ok(handle)
    }

    fn unused_handle(&self, record: &CredentialRecord) -> String {
        let base = derive_stem(record);
        let mut handle = format!("{}.json", base);
        let mut n = 1;
        while self.dir.join(&handle).exists() {
            handle = format!("{}_{}.json", base, n);
            n += 1;
        }
        handle
    }

    /// Remove the backing file. A file that is already gone counts as removed.
    pub fn remove(&self, handle: &str) -> Result<()> {
        let handle = normalize_handle(handle)?;
        let path = self.dir.join(&handle);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted credential: {}", handle);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Credential file already missing: {}", handle);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Handles are plain file names; anything resembling a path is rejected.
pub(crate) fn normalize_handle(handle: &str) -> Result<String> {
    if handle.contains('/') || handle.contains('\\') || handle.contains("..") {
        return Err(StoreError::InvalidHandle(handle.to_string()));
    }
    if handle.ends_with(".json") {
        Ok(handle.to_string())
    } else {
        Ok(format!("{}.json", handle))
    }
}

fn derive_stem(record: &CredentialRecord) -> String {
    let identity: String = record
        .user_id
        .as_deref()
        .unwrap_or("credential")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}_{}", identity, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn load_skips_invalid_files_and_sorts_by_name() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.json", r#"{"bearer_token":"tok-b","user_id":"ub"}"#);
        write(tmp.path(), "a.json", r#"{"bearer_token":"tok-a"}"#);
        write(tmp.path(), "broken.json", "{not json");
        write(tmp.path(), "missing.json", r#"{"user_id":"x"}"#);
        write(tmp.path(), "notes.txt", "ignored");

        let store = CredentialStore::new(tmp.path());
        let creds = store.load_all().unwrap();
        let handles: Vec<&str> = creds.iter().map(|c| c.handle.as_str()).collect();
        assert_eq!(handles, vec!["a.json", "b.json"]);
        assert_eq!(creds[0].record.token_type, "Bearer");
        assert_eq!(creds[1].user_id(), Some("ub"));
    }

    #[test]
    fn load_creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("creds");
        let store = CredentialStore::new(&dir);
        assert!(store.load_all().unwrap().is_empty());
        assert!(dir.is_dir());
    }

    #[test]
    fn unknown_fields_round_trip() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "x.json",
            r#"{"bearer_token":"t","custom":{"a":1},"session_state":"s"}"#,
        );
        let store = CredentialStore::new(tmp.path());
        let cred = store.load_all().unwrap().remove(0);
        assert_eq!(cred.record.extra["custom"], json!({"a": 1}));

        store.persist(&cred.record, Some("x")).unwrap();
        let text = std::fs::read_to_string(tmp.path().join("x.json")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["custom"]["a"], 1);
        assert_eq!(value["session_state"], "s");
    }

    #[test]
    fn expiry_honours_grace_window() {
        let mut rec = CredentialRecord::new("t", None);
        rec.created_at = Some(1_000);
        rec.expires_in = Some(1_000);
        assert!(!rec.is_expired_at(1_699));
        assert!(rec.is_expired_at(1_700));

        rec.expires_in = None;
        assert!(!rec.is_expired_at(i64::MAX));
    }

    #[test]
    fn persist_derives_unique_handles() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        let rec = CredentialRecord::new("token-value", Some("user@example".into()));
        let h1 = store.persist(&rec, None).unwrap();
        let h2 = store.persist(&rec, None).unwrap();
        assert_ne!(h1, h2);
        assert!(h1.starts_with("user_example_"));
        assert_eq!(store.load_all().unwrap().len(), 2);
    }

    #[test]
    fn remove_is_idempotent_and_rejects_paths() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        let handle = store
            .persist(&CredentialRecord::new("t", None), Some("one.json"))
            .unwrap();
        store.remove(&handle).unwrap();
        store.remove(&handle).unwrap();
        assert!(matches!(
            store.remove("../etc/passwd"),
            Err(StoreError::InvalidHandle(_))
        ));
    }

    #[test]
    fn token_preview_masks_token() {
        let cred = Credential {
            handle: "a.json".into(),
            record: CredentialRecord::new("abcdefghijklmnopqrstuvwxyz", None),
        };
        assert_eq!(cred.token_preview(), "abcdefghij...wxyz");
        let short = Credential {
            handle: "b.json".into(),
            record: CredentialRecord::new("short", None),
        };
        assert_eq!(short.token_preview(), "Invalid Token");
    }
}
