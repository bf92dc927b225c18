//! Per-target session cache with a time-based expiry policy.
//!
//! One JSON file per target (`<dir>/<escaped-target-id>.json`) holding the storage
//! state captured after a successful login and an explicit `saved_at`
//! timestamp. Age is always computed from `saved_at`; filesystem metadata is
//! never consulted.
//!
//! Every public operation fails softly. Unreadable, unparsable or expired
//! records are purged when detected and reported as "no session".

pub mod state;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;

pub use self::state::{Cookie, OriginState, StorageEntry, StorageState};

const RECORD_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

/// How far `saved_at` may lie in the future before the record is treated as
/// expired.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session record for '{target}' is malformed: {source}")]
    Malformed {
        target: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Cached authentication material for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub target_id: String,
    pub saved_at: DateTime<Utc>,
    pub storage_state: StorageState,
}

impl SessionRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.saved_at)
    }
}

/// Inventory line for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub target_id: String,
    pub is_valid: bool,
    /// `None` when the record could not be parsed.
    pub age_days: Option<f64>,
}

/// Outcome of reading a record without side effects.
#[derive(Debug)]
enum Inspection {
    Missing,
    Corrupt(String),
    Expired(SessionRecord),
    Empty(SessionRecord),
    Valid(SessionRecord),
}

/// File-backed session cache, keyed by target id.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn from_config(cfg: &SessionConfig) -> Self {
        Self::new(
            cfg.dir.clone(),
            Duration::from_secs(cfg.ttl_days.saturating_mul(24 * 60 * 60)),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Path of the record file for `target_id`.
    pub fn path_for(&self, target_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", file_stem_for(target_id)))
    }

    /// Read the record for `target_id`.
    ///
    /// Returns `None` for a missing file, a parse error or missing required
    /// fields; the latter two also purge the file.
    pub async fn load(&self, target_id: &str) -> Option<SessionRecord> {
        match self.read_record(target_id).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => None,
            Err(e) => {
                warn!(target = %target_id, error = %e, "discarding unreadable session");
                self.purge(target_id).await;
                None
            }
        }
    }

    /// True iff a record exists, parses, holds at least one session element
    /// and is no older than the TTL. Any existing record that fails these
    /// checks is purged on the spot.
    pub async fn is_valid(&self, target_id: &str) -> bool {
        self.load_valid(target_id).await.is_some()
    }

    /// The record for `target_id` if it passes [`Self::is_valid`]; purges it
    /// otherwise.
    pub async fn load_valid(&self, target_id: &str) -> Option<SessionRecord> {
        match self.inspect(target_id, Utc::now()).await {
            Inspection::Valid(record) => Some(record),
            Inspection::Missing => None,
            Inspection::Corrupt(reason) => {
                warn!(target = %target_id, %reason, "purging corrupt session");
                self.purge(target_id).await;
                None
            }
            Inspection::Expired(record) => {
                info!(
                    target = %target_id,
                    saved_at = %record.saved_at,
                    "session expired, purging"
                );
                self.purge(target_id).await;
                None
            }
            Inspection::Empty(_) => {
                debug!(target = %target_id, "session holds no cookies or storage, purging");
                self.purge(target_id).await;
                None
            }
        }
    }

    /// Overwrite the record for `target_id` with `state`, stamped now.
    ///
    /// Failures are logged and swallowed: a later run can always fall back to
    /// a fresh login.
    pub async fn save(&self, target_id: &str, state: &StorageState) {
        match self.try_save(target_id, state).await {
            Ok(record) => {
                debug!(
                    target = %target_id,
                    elements = record.storage_state.element_count(),
                    "session saved"
                );
            }
            Err(e) => {
                error!(target = %target_id, error = %e, "failed to save session");
            }
        }
    }

    /// Atomic write: serialise to a uniquely named temp file in the same
    /// directory, fsync, then rename over the record. Concurrent writers for
    /// the same target end with one complete record (last writer wins).
    pub async fn try_save(
        &self,
        target_id: &str,
        state: &StorageState,
    ) -> Result<SessionRecord, SessionStoreError> {
        let record = SessionRecord {
            target_id: target_id.to_string(),
            saved_at: Utc::now(),
            storage_state: state.clone(),
        };
        let json =
            serde_json::to_vec_pretty(&record).map_err(|source| SessionStoreError::Malformed {
                target: target_id.to_string(),
                source,
            })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SessionStoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path_for(target_id);
        let tmp_path = self.dir.join(format!(
            ".{}.{}.{TMP_EXT}",
            file_stem_for(target_id),
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(source) = write_synced(&tmp_path, &json).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SessionStoreError::Io {
                path: tmp_path,
                source,
            });
        }

        if let Err(source) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SessionStoreError::Io { path, source });
        }

        Ok(record)
    }

    /// Delete the record for `target_id`. A missing record is not an error.
    pub async fn purge(&self, target_id: &str) {
        let path = self.path_for(target_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(target = %target_id, "session purged"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(target = %target_id, path = %path.display(), error = %e, "failed to purge session"),
        }
    }

    /// Purge every record older than the TTL. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        for target_id in self.record_ids().await {
            if let Inspection::Expired(_) = self.inspect(&target_id, now).await {
                self.purge(&target_id).await;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "expired sessions purged");
        }
        purged
    }

    /// Remove every record. Returns how many were removed.
    pub async fn purge_all(&self) -> usize {
        let ids = self.record_ids().await;
        for target_id in &ids {
            self.purge(target_id).await;
        }
        ids.len()
    }

    /// Read-only inventory of stored records, sorted by target id.
    pub async fn list_all(&self) -> Vec<SessionSummary> {
        let now = Utc::now();
        let mut out = Vec::new();
        for target_id in self.record_ids().await {
            let summary = match self.inspect(&target_id, now).await {
                Inspection::Missing => continue,
                Inspection::Corrupt(_) => SessionSummary {
                    target_id,
                    is_valid: false,
                    age_days: None,
                },
                Inspection::Valid(record) => summary_of(&record, true, now),
                Inspection::Expired(record) | Inspection::Empty(record) => {
                    summary_of(&record, false, now)
                }
            };
            out.push(summary);
        }
        out
    }

    async fn read_record(&self, target_id: &str) -> Result<Option<SessionRecord>, SessionStoreError> {
        let path = self.path_for(target_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionStoreError::Io { path, source }),
        };
        serde_json::from_slice::<SessionRecord>(&bytes)
            .map(Some)
            .map_err(|source| SessionStoreError::Malformed {
                target: target_id.to_string(),
                source,
            })
    }

    async fn inspect(&self, target_id: &str, now: DateTime<Utc>) -> Inspection {
        let record = match self.read_record(target_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Inspection::Missing,
            Err(e) => return Inspection::Corrupt(e.to_string()),
        };
        if record.target_id != target_id {
            return Inspection::Corrupt(format!(
                "record belongs to target '{}'",
                record.target_id
            ));
        }
        let age = record.age(now);
        if age > self.ttl || age < -chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            Inspection::Expired(record)
        } else if record.storage_state.is_empty() {
            Inspection::Empty(record)
        } else {
            Inspection::Valid(record)
        }
    }

    /// Target ids of all record files currently on disk.
    async fn record_ids(&self) -> Vec<String> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list sessions");
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                        continue;
                    }
                    if let Some(id) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(target_id_for_stem)
                    {
                        ids.push(id);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "failed to read session entry");
                    break;
                }
            }
        }
        ids.sort();
        ids
    }
}

fn summary_of(record: &SessionRecord, is_valid: bool, now: DateTime<Utc>) -> SessionSummary {
    SessionSummary {
        target_id: record.target_id.clone(),
        is_valid,
        age_days: Some(record.age(now).num_seconds() as f64 / 86_400.0),
    }
}

/// File-name-safe form of a target id. ASCII alphanumerics, `-`, `_` and
/// non-leading `.` are kept; every other byte becomes `%XX`, so distinct ids
/// never share a file.
fn file_stem_for(target_id: &str) -> String {
    let mut stem = String::with_capacity(target_id.len());
    for (i, byte) in target_id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// Inverse of [`file_stem_for`]. `None` for names this store never writes.
fn target_id_for_stem(stem: &str) -> Option<String> {
    let raw = stem.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = std::str::from_utf8(raw.get(i + 1..i + 3)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    let id = String::from_utf8(bytes).ok()?;
    (file_stem_for(&id) == stem).then_some(id)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
