//! Append-only audit trail.
//!
//! The vault appends a record for every document access, workflow decision
//! and package movement. Records can be forwarded to pluggable sinks.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    DocumentStored,
    DocumentRetrieved,
    DocumentDeleted,
    RequestSubmitted,
    RequestApproved,
    RequestRejected,
    ApprovalRevoked,
    PermissionGranted,
    PermissionRevoked,
    PackageCreated,
    PackageDelivered,
    PackageOpened,
}

/// A receiver of audit records: a file, a database, a remote collector.
pub trait AuditSink: Send {
    /// Called once for every appended record.
    fn append(&mut self, record: AuditRecord);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub action: AuditAction,
    /// Who acted: a user id, a recipient, or `"owner"`.
    pub actor: String,
    /// What was acted on, e.g. `medical/vax-1` or a request id.
    pub subject: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, actor: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            action,
            actor: actor.into(),
            subject: subject.into(),
            timestamp: crate::now_millis(),
        }
    }
}

#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward a copy of every later record to `sink`.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn record(&mut self, action: AuditAction, actor: &str, subject: &str) {
        self.append(AuditRecord::new(action, actor, subject));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    /// Records for one action, oldest first.
    pub fn by_action(&self, action: AuditAction) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter().filter(move |r| r.action == action)
    }
}

/// Writes records as JSON lines, appending to an owner-only file.
pub struct FileAuditSink {
    file: File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        Ok(Self {
            file: options.open(path)?,
        })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let written = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.file, "{line}"))
            .and_then(|()| self.file.flush());
        if let Err(error) = written {
            warn!(%error, action = ?record.action, "audit sink write failed");
        }
    }
}
