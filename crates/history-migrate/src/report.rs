//! Accumulated error log for a migration run.
//!
//! Stages never abort the run for a single bad event. They record an error
//! here and recover locally. The orchestrator checks the log at every phase
//! boundary and refuses to continue once anything was recorded.

use crate::core::Revision;
use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Structural,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Structural => "structural",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

/// One recorded error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    pub message: String,
}

impl fmt::Display for RecordedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.revision {
            Some(rev) => write!(f, "[{} r{}] {}", self.kind, rev, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Shared error log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorLog {
    errors: Vec<RecordedError>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error and emit it through tracing.
    pub fn record(
        &mut self,
        kind: ErrorKind,
        revision: Option<Revision>,
        message: impl Into<String>,
    ) {
        let entry = RecordedError {
            kind,
            revision,
            message: message.into(),
        };
        error!("{}", entry);
        self.errors.push(entry);
    }

    pub fn resolution(&mut self, revision: Revision, message: impl Into<String>) {
        self.record(ErrorKind::Resolution, Some(revision), message);
    }

    pub fn structural(&mut self, revision: Revision, message: impl Into<String>) {
        self.record(ErrorKind::Structural, Some(revision), message);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[RecordedError] {
        &self.errors
    }

    /// Count of errors of one kind.
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.errors.iter().filter(|e| e.kind == kind).count()
    }

    /// Append another log without re-emitting its entries.
    pub fn extend(&mut self, other: ErrorLog) {
        self.errors.extend(other.errors);
    }

    /// Fail if anything was recorded.
    pub fn check(&self, phase: &str) -> Result<()> {
        match self.errors.first() {
            None => Ok(()),
            Some(first) => Err(MigrateError::ErrorsRecorded {
                phase: phase.to_string(),
                count: self.errors.len(),
                first: first.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log_passes_check() {
        assert!(ErrorLog::new().check("transform").is_ok());
    }

    #[test]
    fn test_check_reports_first_error() {
        let mut log = ErrorLog::new();
        log.resolution(7, "reference to unmapped object Person#3@1");
        log.structural(8, "link modified");

        let err = log.check("transform").unwrap_err();
        match err {
            MigrateError::ErrorsRecorded {
                phase,
                count,
                first,
            } => {
                assert_eq!(phase, "transform");
                assert_eq!(count, 2);
                assert!(first.contains("r7"));
                assert!(first.contains("Person#3@1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(log.count(ErrorKind::Structural), 1);
    }

    #[test]
    fn test_extend() {
        let mut a = ErrorLog::new();
        let mut b = ErrorLog::new();
        b.record(ErrorKind::Io, None, "disk full");
        a.extend(b);
        assert_eq!(a.len(), 1);
        assert_eq!(a.errors()[0].to_string(), "[io] disk full");
    }
}
