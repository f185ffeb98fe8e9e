//! Append-only, hash-chained, rotation-safe audit log.
//!
//! Every sealed decision becomes a [`TrustLogRecord`] whose `sha256` covers
//! its own canonical body plus the previous record's hash, so removal,
//! reordering, or modification of any record is detectable by a
//! re-verification pass. Rotation archives the primary into a timestamped
//! segment and records the tail hash in a marker file; the next segment's
//! first record chains from that hash, preserving continuity.
//!
//! # Storage layout
//!
//! ```text
//! log_dir/trust_log.primary            append-only JSONL, authoritative
//! log_dir/trust_log.mirror             bounded JSONL mirror for UIs
//! log_dir/trust_log.<ts>.segment       archived segments (never deleted)
//! log_dir/trust_log.rotation.marker    tail hash of the last archived segment
//! ```
//!
//! # Concurrency
//!
//! Appends are globally serialized by the log lock; the resulting record
//! sequence defines the canonical order. Tail and last-hash reads are served
//! from in-memory state under the same lock (one record's worth of work);
//! verification and fetch operations stream the files without the lock.

pub mod canonical;

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::utils::atomic_io::{self, AtomicIoError};
use crate::utils::hash::chain_hash;
use canonical::{canonical_json, strip_hash_fields};

/// Payload key marking a degraded record written by the fallback path.
pub const HASH_CHAIN_KEY: &str = "hash_chain";
/// Payload value marking a degraded record.
pub const HASH_CHAIN_UNAVAILABLE: &str = "unavailable";

// ============================================================================
// Records
// ============================================================================

/// One immutable audit record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrustLogRecord {
    pub id: String,
    /// ISO-8601 UTC timestamp, millisecond precision.
    pub created_at: String,
    pub request_id: String,
    pub stage: String,
    pub payload: Value,
    /// `None` only for the first record of the first segment.
    pub sha256_prev: Option<String>,
    /// Empty string on degraded records (`hash_chain: unavailable`).
    pub sha256: String,
}

impl TrustLogRecord {
    /// Whether this record was written by the degraded fallback path.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.payload.get(HASH_CHAIN_KEY).and_then(Value::as_str)
            == Some(HASH_CHAIN_UNAVAILABLE)
    }

    /// The canonical byte string this record's hash covers: the full record
    /// body with the hash fields stripped.
    #[must_use]
    pub fn canonical_body(&self) -> String {
        let as_value = serde_json::json!({
            "id": self.id,
            "created_at": self.created_at,
            "request_id": self.request_id,
            "stage": self.stage,
            "payload": self.payload,
        });
        canonical_json(&strip_hash_fields(&as_value))
    }

    /// Recompute the chain hash this record should carry.
    #[must_use]
    pub fn expected_sha256(&self) -> String {
        chain_hash(self.sha256_prev.as_deref(), &self.canonical_body())
    }
}

/// The hash head returned to callers after a successful append.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrustLogHead {
    pub id: String,
    pub sha256: String,
    pub sha256_prev: Option<String>,
}

/// Marker persisted at rotation: links segment tails across files.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RotationMarker {
    pub last_sha256: Option<String>,
    pub segment: String,
    pub rotated_at: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Trust-log failures. An append failure is fatal to the decide call that
/// triggered it; the pipeline answers `hold` with `trust_log_unavailable`.
#[derive(Debug, Error, Diagnostic)]
pub enum TrustLogError {
    #[error("trust log I/O failure on {path}: {source}")]
    #[diagnostic(code(veritas::trustlog::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(veritas::trustlog::durable_write))]
    Durable(#[from] AtomicIoError),

    #[error("failed to serialize trust log record: {0}")]
    #[diagnostic(code(veritas::trustlog::serde))]
    Serde(#[from] serde_json::Error),
}

// ============================================================================
// Verification
// ============================================================================

/// Result of a full-chain verification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    /// Total records inspected across all segments plus the primary.
    pub records: usize,
    /// Global index of the first record whose hash or linkage is wrong.
    pub first_mismatch: Option<usize>,
}

impl VerifyReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.first_mismatch.is_none()
    }
}

/// Records for one request plus a per-record integrity verdict.
#[derive(Clone, Debug)]
pub struct RequestAudit {
    pub records: Vec<TrustLogRecord>,
    /// True when every non-degraded record recomputes to its stored hash.
    pub chain_ok: bool,
}

/// One page of records from [`TrustLog::list`].
#[derive(Clone, Debug)]
pub struct RecordPage {
    pub records: Vec<TrustLogRecord>,
    /// Opaque cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

// ============================================================================
// TrustLog
// ============================================================================

#[derive(Clone, Debug)]
struct LogPaths {
    dir: PathBuf,
    primary: PathBuf,
    mirror: PathBuf,
    marker: PathBuf,
}

impl LogPaths {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            primary: dir.join("trust_log.primary"),
            mirror: dir.join("trust_log.mirror"),
            marker: dir.join("trust_log.rotation.marker"),
        }
    }
}

struct LogInner {
    /// Tail hash of the chain; `Some("")` after a degraded append.
    last_sha: Option<String>,
    primary_bytes: u64,
    mirror: VecDeque<TrustLogRecord>,
}

/// The append-only hash-chained audit log.
pub struct TrustLog {
    paths: LogPaths,
    max_segment_bytes: u64,
    mirror_cap: usize,
    inner: Mutex<LogInner>,
}

impl TrustLog {
    /// Open (or create) the log under `dir`.
    ///
    /// The primary is streamed once to recover the tail hash, the byte
    /// length, and the mirror seed; if the primary is empty, the rotation
    /// marker supplies the tail so the chain continues across segments.
    pub fn open(
        dir: &Path,
        max_segment_bytes: u64,
        mirror_cap: usize,
    ) -> Result<Self, TrustLogError> {
        fs::create_dir_all(dir).map_err(|source| TrustLogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let paths = LogPaths::new(dir);

        let mut last_sha: Option<String> = None;
        let mut primary_bytes: u64 = 0;
        let mut mirror: VecDeque<TrustLogRecord> = VecDeque::new();

        if paths.primary.exists() {
            let file = File::open(&paths.primary).map_err(|source| TrustLogError::Io {
                path: paths.primary.clone(),
                source,
            })?;
            primary_bytes = file
                .metadata()
                .map_err(|source| TrustLogError::Io {
                    path: paths.primary.clone(),
                    source,
                })?
                .len();
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|source| TrustLogError::Io {
                    path: paths.primary.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                // A torn final line (crash mid-append) is tolerated: the
                // record never became part of the chain.
                let Ok(record) = serde_json::from_str::<TrustLogRecord>(&line) else {
                    tracing::warn!(path = %paths.primary.display(), "skipping unparseable trust log line");
                    continue;
                };
                last_sha = Some(record.sha256.clone());
                mirror.push_back(record);
                if mirror.len() > mirror_cap {
                    mirror.pop_front();
                }
            }
        }

        if last_sha.is_none() && paths.marker.exists() {
            let text = fs::read_to_string(&paths.marker).map_err(|source| TrustLogError::Io {
                path: paths.marker.clone(),
                source,
            })?;
            let marker: RotationMarker = serde_json::from_str(&text)?;
            last_sha = marker.last_sha256;
        }

        Ok(Self {
            paths,
            max_segment_bytes,
            mirror_cap,
            inner: Mutex::new(LogInner {
                last_sha,
                primary_bytes,
                mirror,
            }),
        })
    }

    /// Append one record, extending the chain.
    ///
    /// Holds the log lock for the whole protocol: hash computation, durable
    /// primary append, rotation check, and mirror rewrite.
    pub async fn append(
        &self,
        request_id: &str,
        stage: &str,
        payload: Value,
    ) -> Result<TrustLogHead, TrustLogError> {
        let mut inner = self.inner.lock().await;
        let record = Self::build_record(inner.last_sha.clone(), request_id, stage, payload);
        self.commit(&mut inner, record).await
    }

    /// Last line of defense: append a degraded record with an empty hash and
    /// `hash_chain: unavailable` in the payload. Verification skips the hash
    /// check for such records but still enforces linkage around them.
    pub async fn append_degraded(
        &self,
        request_id: &str,
        stage: &str,
        mut payload: Value,
    ) -> Result<TrustLogHead, TrustLogError> {
        if let Value::Object(map) = &mut payload {
            map.insert(
                HASH_CHAIN_KEY.to_string(),
                Value::String(HASH_CHAIN_UNAVAILABLE.to_string()),
            );
        }
        let mut inner = self.inner.lock().await;
        let record = TrustLogRecord {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: request_id.to_string(),
            stage: stage.to_string(),
            payload,
            sha256_prev: inner.last_sha.clone(),
            sha256: String::new(),
        };
        self.commit(&mut inner, record).await
    }

    fn build_record(
        prev: Option<String>,
        request_id: &str,
        stage: &str,
        payload: Value,
    ) -> TrustLogRecord {
        let mut record = TrustLogRecord {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: request_id.to_string(),
            stage: stage.to_string(),
            payload,
            sha256_prev: prev,
            sha256: String::new(),
        };
        record.sha256 = record.expected_sha256();
        record
    }

    async fn commit(
        &self,
        inner: &mut LogInner,
        record: TrustLogRecord,
    ) -> Result<TrustLogHead, TrustLogError> {
        let line = serde_json::to_string(&record)?;
        atomic_io::append_line_durable(&self.paths.primary, &line)?;

        inner.last_sha = Some(record.sha256.clone());
        inner.primary_bytes += line.len() as u64 + 1;

        let head = TrustLogHead {
            id: record.id.clone(),
            sha256: record.sha256.clone(),
            sha256_prev: record.sha256_prev.clone(),
        };

        inner.mirror.push_back(record);
        while inner.mirror.len() > self.mirror_cap {
            inner.mirror.pop_front();
        }

        if inner.primary_bytes >= self.max_segment_bytes {
            self.rotate(inner)?;
        }

        // Mirror failures are tolerated: the primary is authoritative and
        // the mirror is rewritten on the next successful append anyway.
        if let Err(err) = self.write_mirror(&inner.mirror) {
            tracing::warn!(error = %err, "trust log mirror update failed");
        }

        Ok(head)
    }

    fn write_mirror(&self, mirror: &VecDeque<TrustLogRecord>) -> Result<(), TrustLogError> {
        let mut contents = String::new();
        for record in mirror {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        atomic_io::write_atomic(&self.paths.mirror, contents.as_bytes())?;
        Ok(())
    }

    /// Archive the primary and open a fresh one. Runs under the log lock.
    fn rotate(&self, inner: &mut LogInner) -> Result<(), TrustLogError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f").to_string();
        let mut segment = self.paths.dir.join(format!("trust_log.{stamp}.segment"));
        // Collisions get a `z` suffix, which sorts after the bare stamp so
        // lexicographic order stays chain order.
        let mut suffix = 1u32;
        while segment.exists() {
            segment = self
                .paths
                .dir
                .join(format!("trust_log.{stamp}z{suffix}.segment"));
            suffix += 1;
        }

        fs::rename(&self.paths.primary, &segment).map_err(|source| TrustLogError::Io {
            path: segment.clone(),
            source,
        })?;

        let marker = RotationMarker {
            last_sha256: inner.last_sha.clone(),
            segment: segment
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            rotated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        atomic_io::write_atomic(&self.paths.marker, serde_json::to_vec(&marker)?.as_slice())?;

        // Open a new empty primary so the segment boundary is visible on disk.
        File::create(&self.paths.primary).map_err(|source| TrustLogError::Io {
            path: self.paths.primary.clone(),
            source,
        })?;
        atomic_io::fsync_dir(&self.paths.dir)?;
        inner.primary_bytes = 0;
        Ok(())
    }

    /// The chain's current tail hash, if any records exist.
    pub async fn last_hash(&self) -> Option<String> {
        self.inner.lock().await.last_sha.clone()
    }

    /// The latest `n` records, served from the bounded mirror.
    pub async fn tail(&self, n: usize) -> Vec<TrustLogRecord> {
        let inner = self.inner.lock().await;
        inner
            .mirror
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }

    /// The current rotation marker, if any rotation has happened.
    pub fn rotation_marker(&self) -> Result<Option<RotationMarker>, TrustLogError> {
        if !self.paths.marker.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.paths.marker).map_err(|source| TrustLogError::Io {
            path: self.paths.marker.clone(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Archived segment paths in chain order, oldest first.
    ///
    /// Segment names embed a fixed-width UTC timestamp, so lexicographic
    /// order is chain order.
    pub fn segments(&self) -> Result<Vec<PathBuf>, TrustLogError> {
        let mut segments = Vec::new();
        let entries = fs::read_dir(&self.paths.dir).map_err(|source| TrustLogError::Io {
            path: self.paths.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| TrustLogError::Io {
                path: self.paths.dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("trust_log.") && name.ends_with(".segment") {
                segments.push(entry.path());
            }
        }
        segments.sort();
        Ok(segments)
    }

    fn chain_files(&self) -> Result<Vec<PathBuf>, TrustLogError> {
        let mut files = self.segments()?;
        if self.paths.primary.exists() {
            files.push(self.paths.primary.clone());
        }
        Ok(files)
    }

    /// Re-verify the whole chain across every segment plus the primary.
    ///
    /// Returns the global index of the first record whose linkage or hash is
    /// wrong. Degraded records skip the hash recompute but must still sit at
    /// the right place in the chain: their `sha256_prev` must match the
    /// running tail, and their recorded `sha256` becomes the tail their
    /// successor must reference.
    pub fn verify(&self) -> Result<VerifyReport, TrustLogError> {
        let mut prev: Option<String> = None;
        let mut index = 0usize;
        let mut first_mismatch = None;

        'files: for path in self.chain_files()? {
            let file = File::open(&path).map_err(|source| TrustLogError::Io {
                path: path.clone(),
                source,
            })?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|source| TrustLogError::Io {
                    path: path.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: Result<TrustLogRecord, _> = serde_json::from_str(&line);
                let Ok(record) = parsed else {
                    first_mismatch = Some(index);
                    index += 1;
                    break 'files;
                };

                let linked = record.sha256_prev == prev;
                let hashed = record.is_degraded() || record.sha256 == record.expected_sha256();
                if !(linked && hashed) {
                    first_mismatch = Some(index);
                    index += 1;
                    break 'files;
                }

                prev = Some(record.sha256.clone());
                index += 1;
            }
        }

        Ok(VerifyReport {
            records: index,
            first_mismatch,
        })
    }

    /// Paged listing across segments and the primary, oldest first.
    ///
    /// The cursor is opaque to callers; passing back `next_cursor` resumes
    /// where the previous page ended.
    pub fn list(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<RecordPage, TrustLogError> {
        let (start_file, start_line) = cursor
            .and_then(|c| {
                let (f, l) = c.strip_prefix('f')?.split_once(':')?;
                Some((f.parse::<usize>().ok()?, l.parse::<usize>().ok()?))
            })
            .unwrap_or((0, 0));

        let files = self.chain_files()?;
        let mut records = Vec::new();
        let mut next_cursor = None;

        'outer: for (file_idx, path) in files.iter().enumerate().skip(start_file) {
            let file = File::open(path).map_err(|source| TrustLogError::Io {
                path: path.clone(),
                source,
            })?;
            for (line_idx, line) in BufReader::new(file).lines().enumerate() {
                if file_idx == start_file && line_idx < start_line {
                    continue;
                }
                let line = line.map_err(|source| TrustLogError::Io {
                    path: path.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                if records.len() == limit {
                    next_cursor = Some(format!("f{file_idx}:{line_idx}"));
                    break 'outer;
                }
                if let Ok(record) = serde_json::from_str::<TrustLogRecord>(&line) {
                    records.push(record);
                }
            }
        }

        Ok(RecordPage {
            records,
            next_cursor,
        })
    }

    /// Lookup a single record by id, scanning newest files first.
    pub fn get(&self, id: &str) -> Result<Option<TrustLogRecord>, TrustLogError> {
        for path in self.chain_files()?.iter().rev() {
            let file = File::open(path).map_err(|source| TrustLogError::Io {
                path: path.clone(),
                source,
            })?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|source| TrustLogError::Io {
                    path: path.clone(),
                    source,
                })?;
                if let Ok(record) = serde_json::from_str::<TrustLogRecord>(&line) {
                    if record.id == id {
                        return Ok(Some(record));
                    }
                }
            }
        }
        Ok(None)
    }

    /// All records for one request, with a per-record integrity verdict.
    pub fn by_request(&self, request_id: &str) -> Result<RequestAudit, TrustLogError> {
        let mut records = Vec::new();
        let mut chain_ok = true;
        for path in self.chain_files()? {
            let file = File::open(&path).map_err(|source| TrustLogError::Io {
                path: path.clone(),
                source,
            })?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|source| TrustLogError::Io {
                    path: path.clone(),
                    source,
                })?;
                let Ok(record) = serde_json::from_str::<TrustLogRecord>(&line) else {
                    continue;
                };
                if record.request_id == request_id {
                    if !record.is_degraded() && record.sha256 != record.expected_sha256() {
                        chain_ok = false;
                    }
                    records.push(record);
                }
            }
        }
        Ok(RequestAudit { records, chain_ok })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_log(dir: &Path) -> TrustLog {
        TrustLog::open(dir, 8 * 1024 * 1024, 2_000).unwrap()
    }

    #[tokio::test]
    async fn first_record_has_null_prev() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let head = log.append("r1", "fuji", json!({"ok": true})).await.unwrap();
        assert!(head.sha256_prev.is_none());
        assert!(!head.sha256.is_empty());
    }

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let first = log.append("r1", "fuji", json!({"n": 1})).await.unwrap();
        let second = log.append("r2", "fuji", json!({"n": 2})).await.unwrap();
        assert_eq!(second.sha256_prev.as_deref(), Some(first.sha256.as_str()));

        let report = log.verify().unwrap();
        assert!(report.ok());
        assert_eq!(report.records, 2);
    }

    #[tokio::test]
    async fn reopen_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let tail = {
            let log = open_log(dir.path());
            log.append("r1", "fuji", json!({"n": 1})).await.unwrap();
            log.last_hash().await.unwrap()
        };
        let log = open_log(dir.path());
        let head = log.append("r2", "fuji", json!({"n": 2})).await.unwrap();
        assert_eq!(head.sha256_prev.as_deref(), Some(tail.as_str()));
        assert!(log.verify().unwrap().ok());
    }

    #[tokio::test]
    async fn degraded_records_keep_linkage() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        log.append("r1", "fuji", json!({"n": 1})).await.unwrap();
        let degraded = log
            .append_degraded("r2", "seal_trust_log", json!({"error": "disk"}))
            .await
            .unwrap();
        assert!(degraded.sha256.is_empty());
        let after = log.append("r3", "fuji", json!({"n": 3})).await.unwrap();
        assert_eq!(after.sha256_prev.as_deref(), Some(""));

        let report = log.verify().unwrap();
        assert!(report.ok());
        assert_eq!(report.records, 3);
    }

    #[tokio::test]
    async fn tail_serves_latest_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        for n in 0..5 {
            log.append("r", "fuji", json!({"n": n})).await.unwrap();
        }
        let tail = log.tail(2).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].payload["n"], json!(4));
    }

    #[tokio::test]
    async fn list_pages_with_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        for n in 0..5 {
            log.append("r", "fuji", json!({"n": n})).await.unwrap();
        }
        let page1 = log.list(None, 2).unwrap();
        assert_eq!(page1.records.len(), 2);
        let page2 = log.list(page1.next_cursor.as_deref(), 10).unwrap();
        assert_eq!(page2.records.len(), 3);
        assert!(page2.next_cursor.is_none());
        assert_eq!(page2.records[0].payload["n"], json!(2));
    }

    #[tokio::test]
    async fn get_and_by_request() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let head = log.append("req-a", "fuji", json!({"n": 1})).await.unwrap();
        log.append("req-b", "fuji", json!({"n": 2})).await.unwrap();
        log.append("req-a", "seal_trust_log", json!({"n": 3}))
            .await
            .unwrap();

        let found = log.get(&head.id).unwrap().unwrap();
        assert_eq!(found.request_id, "req-a");

        let audit = log.by_request("req-a").unwrap();
        assert_eq!(audit.records.len(), 2);
        assert!(audit.chain_ok);
    }

    #[tokio::test]
    async fn rotation_preserves_continuity() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold so every append rotates.
        let log = TrustLog::open(dir.path(), 64, 2_000).unwrap();
        let first = log.append("r1", "fuji", json!({"n": 1})).await.unwrap();
        let marker = log.rotation_marker().unwrap().unwrap();
        assert_eq!(marker.last_sha256.as_deref(), Some(first.sha256.as_str()));

        let second = log.append("r2", "fuji", json!({"n": 2})).await.unwrap();
        assert_eq!(second.sha256_prev.as_deref(), Some(first.sha256.as_str()));
        assert!(log.verify().unwrap().ok());
        assert!(!log.segments().unwrap().is_empty());
    }
}
