//! The audit sink: an append-only, flush-per-record journal of policy
//! decisions (spec section 4.5). Write-only from the mediator's viewpoint.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::label::Sensitivity;
use crate::policy::{Decision, Operation};

/// One audit record. Carries everything spec 4.5 requires:
/// `(timestamp, principal.name, principal.clearance, operation, path, outcome, extra)`.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub user: String,
    pub clearance: Sensitivity,
    pub operation: Operation,
    pub path: PathBuf,
    pub outcome: String,
    pub extra: Option<String>,
}

impl AuditRecord {
    pub fn granted(
        user: impl Into<String>,
        clearance: Sensitivity,
        operation: Operation,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user: user.into(),
            clearance,
            operation,
            path: path.into(),
            outcome: "GRANTED".to_string(),
            extra: None,
        }
    }

    pub fn downgrade(
        user: impl Into<String>,
        clearance: Sensitivity,
        operation: Operation,
        path: impl Into<PathBuf>,
        from: Sensitivity,
        to: Sensitivity,
    ) -> Self {
        Self {
            user: user.into(),
            clearance,
            operation,
            path: path.into(),
            outcome: "GRANTED".to_string(),
            extra: Some(format!("downgrade {from}->{to}")),
        }
    }

    pub fn denied(
        user: impl Into<String>,
        clearance: Sensitivity,
        operation: Operation,
        path: impl Into<PathBuf>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self {
            user: user.into(),
            clearance,
            operation,
            path: path.into(),
            outcome: "DENIED".to_string(),
            extra: Some(reason.to_string()),
        }
    }

    /// Build the record a policy `Decision` implies, for the common case
    /// where the caller already has the principal/operation/path at hand.
    pub fn from_decision(
        user: impl Into<String>,
        clearance: Sensitivity,
        operation: Operation,
        path: impl Into<PathBuf>,
        decision: Decision,
    ) -> Self {
        match decision {
            Decision::Grant => Self::granted(user, clearance, operation, path),
            Decision::GrantAsDowngrade { from, to } => {
                Self::downgrade(user, clearance, operation, path, from, to)
            }
            Decision::Deny(reason) => Self::denied(user, clearance, operation, path, reason),
        }
    }

    /// Render as the single line format spec 6 fixes:
    /// `<ISO-8601 timestamp> | <user> - <level> | <action> | <path> | <status>`
    fn to_line(&self) -> String {
        let status = match &self.extra {
            Some(extra) => format!("{} ({})", self.outcome, extra),
            None => self.outcome.clone(),
        };
        format!(
            "{} | {} - {} | {} | {} | {}",
            Local::now().to_rfc3339(),
            self.user,
            self.clearance,
            self.operation,
            self.path.display(),
            status,
        )
    }
}

/// Appends audit records to a plain-text log file, one line per record,
/// flushed immediately so a record is durable before the caller observes the
/// outcome it describes (spec 5's ordering guarantee).
pub struct AuditSink {
    file: Mutex<File>,
}

impl AuditSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Write one record and flush. A failure here is the one way a
    /// credential-store/audit-sink failure surfaces to the caller as `EIO`
    /// (spec 7): the mediator must not report success without a durable
    /// record.
    pub fn record(&self, record: &AuditRecord) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(file, "{}", record.to_line())?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Operation;

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = AuditSink::open(&path).unwrap();

        sink.record(&AuditRecord::granted(
            "alice",
            Sensitivity::Secret,
            Operation::OpenRead,
            "/secret/memo",
        ))
        .unwrap();
        sink.record(&AuditRecord::denied(
            "eve",
            Sensitivity::Unclassified,
            Operation::OpenRead,
            "/secret/memo",
            "no-read-up",
        ))
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("alice"));
        assert!(lines[0].contains("GRANTED"));
        assert!(lines[1].contains("eve"));
        assert!(lines[1].contains("DENIED"));
        assert!(lines[1].contains("no-read-up"));
    }

    #[test]
    fn downgrade_records_from_and_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = AuditSink::open(&path).unwrap();

        sink.record(&AuditRecord::downgrade(
            "root",
            Sensitivity::TopSecret,
            Operation::Expurgate,
            "/unclassified/memo.dc",
            Sensitivity::Secret,
            Sensitivity::Unclassified,
        ))
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("downgrade SECRET->UNCLASSIFIED"));
    }
}
