//! Append-only JSON-lines event log with size-based rotation.
//!
//! Each credential validation and each verification outcome becomes one JSON
//! object per line. Before a write, a file that has reached `max_bytes` is
//! rotated: `path.N` is deleted, `path.k` moves to `path.k+1`, and the active
//! file becomes `path.1`. Rotation problems never stop logging; the record is
//! appended to whatever file is active.

use crate::beacon::BeaconFrame;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

pub const DEFAULT_LOG_MAX_BYTES: u64 = 5_000_000;
pub const DEFAULT_LOG_BACKUPS: usize = 3;

/// Rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogConfig {
    /// Size at which the active file is rotated before the next write
    pub max_bytes: u64,
    /// Rotated generations kept next to the active file; 0 disables rotation
    pub backups: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backups: DEFAULT_LOG_BACKUPS,
        }
    }
}

/// Kind of event a [`LogRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    ScannerKeyValidation,
    AttendanceVerified,
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    #[serde(serialize_with = "serialize_ts")]
    pub ts: DateTime<Utc>,
    pub event: LogEvent,
    pub ok: bool,
    pub status_code: Option<u16>,
    pub gym_id: u64,
    pub scanner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn serialize_ts<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl LogRecord {
    /// Record for the startup credential check.
    pub fn key_validation(
        gym_id: u64,
        scanner_id: &str,
        ok: bool,
        status_code: Option<u16>,
        error: Option<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            event: LogEvent::ScannerKeyValidation,
            ok,
            status_code,
            gym_id,
            scanner_id: scanner_id.to_string(),
            user_id: None,
            token: None,
            rssi: None,
            error,
        }
    }

    /// Record for one verification outcome of `frame`.
    pub fn verification(
        gym_id: u64,
        scanner_id: &str,
        frame: &BeaconFrame,
        ok: bool,
        status_code: Option<u16>,
        error: Option<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            event: LogEvent::AttendanceVerified,
            ok,
            status_code,
            gym_id,
            scanner_id: scanner_id.to_string(),
            user_id: Some(frame.user_id()),
            token: Some(frame.token()),
            rssi: Some(frame.rssi()),
            error,
        }
    }
}

/// The event log. Owns the active file and its rotation siblings.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    config: EventLogConfig,
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Open (or prepare to create) the log at `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns an `io::Error` if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>, config: EventLogConfig) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            config,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rotate if needed, then append `record` as one line.
    ///
    /// # Errors
    /// Returns an `io::Error` if serialization or the append itself fails.
    /// Rotation failures are logged and ignored.
    pub fn append(&self, record: &LogRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.rotate_if_needed();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }

    fn rotate_if_needed(&self) {
        let backups = self.config.backups;
        if backups == 0 {
            return;
        }
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.config.max_bytes => {}
            _ => return,
        }

        tracing::debug!(path = %self.path.display(), "rotating event log");

        let oldest = self.backup_path(backups);
        if oldest.exists()
            && let Err(error) = fs::remove_file(&oldest)
        {
            tracing::warn!(path = %oldest.display(), %error, "failed to remove oldest event log");
        }

        for idx in (1..backups).rev() {
            let src = self.backup_path(idx);
            if src.exists()
                && let Err(error) = fs::rename(&src, self.backup_path(idx + 1))
            {
                tracing::warn!(path = %src.display(), %error, "failed to shift event log");
            }
        }

        if let Err(error) = fs::rename(&self.path, self.backup_path(1)) {
            tracing::warn!(path = %self.path.display(), %error, "event log rotation failed, appending to active file");
        }
    }

    /// `events.jsonl` -> `events.jsonl.<idx>`
    fn backup_path(&self, idx: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{idx}"));
        PathBuf::from(name)
    }
}
