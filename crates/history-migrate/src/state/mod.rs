//! Run journal: what a migration run did, phase by phase.
//!
//! The journal is a JSON file signed with HMAC-SHA256 keyed by the config
//! hash. It is written after every phase transition so an interrupted run
//! leaves a record of how far it got.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Journal of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub status: RunStatus,

    /// Phases in the order they started.
    #[serde(default)]
    pub phases: Vec<PhaseState>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Error message of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// HMAC-SHA256 over the journal without this field, keyed by `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Status of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: String,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Short outcome, e.g. row counts or the reason a phase was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MigrationState {
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            phases: Vec::new(),
            completed_at: None,
            error: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize journal: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a journal and check its signature.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) if *stored == state.compute_hmac()? => Ok(state),
            Some(_) => Err(MigrateError::State(
                "journal integrity check failed: HMAC mismatch".to_string(),
            )),
            None => Err(MigrateError::State("journal is not signed".to_string())),
        }
    }

    /// Sign and write atomically (temp file, then rename).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Fail if the journal was written for a different configuration.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::State(
                "configuration changed since the journal was written".to_string(),
            ));
        }
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.iter().rev().find(|p| p.name == name)
    }

    pub fn begin_phase(&mut self, name: &str) {
        self.phases.push(PhaseState {
            name: name.to_string(),
            status: PhaseStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            detail: None,
        });
    }

    pub fn complete_phase(&mut self, name: &str, detail: Option<String>) {
        self.finish_phase(name, PhaseStatus::Completed, detail);
    }

    /// Record a phase that had nothing to do.
    pub fn skip_phase(&mut self, name: &str, reason: &str) {
        self.begin_phase(name);
        self.finish_phase(name, PhaseStatus::Skipped, Some(reason.to_string()));
    }

    fn finish_phase(&mut self, name: &str, status: PhaseStatus, detail: Option<String>) {
        if let Some(phase) = self.phases.iter_mut().rev().find(|p| p.name == name) {
            phase.status = status;
            phase.completed_at = Some(Utc::now());
            phase.detail = detail;
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the run and its running phase failed.
    pub fn mark_failed(&mut self, error: &str) {
        self.close_running(PhaseStatus::Failed, error);
        self.status = RunStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.close_running(PhaseStatus::Failed, "cancelled");
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    fn close_running(&mut self, status: PhaseStatus, detail: &str) {
        for phase in &mut self.phases {
            if phase.status == PhaseStatus::Running {
                phase.status = status;
                phase.completed_at = Some(Utc::now());
                phase.detail = Some(detail.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_state_save_load() {
        let mut state = MigrationState::new("test-run".into(), "abc123".into());
        state.begin_phase("build");
        state.complete_phase("build", Some("3 stages".into()));
        state.skip_phase("schema", "no schema processors");

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let loaded = MigrationState::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "test-run");
        assert_eq!(loaded.phases.len(), 2);
        assert_eq!(loaded.phase("build").unwrap().status, PhaseStatus::Completed);
        assert_eq!(loaded.phase("schema").unwrap().status, PhaseStatus::Skipped);
    }

    #[test]
    fn test_tampered_journal_rejected() {
        let mut state = MigrationState::new("test-run".into(), "abc123".into());
        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        std::fs::write(file.path(), content.replace("running", "completed")).unwrap();

        let err = MigrationState::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_unsigned_journal_rejected() {
        let state = MigrationState::new("test-run".into(), "abc123".into());
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&state).unwrap()).unwrap();
        assert!(MigrationState::load(file.path()).is_err());
    }

    #[test]
    fn test_config_validation() {
        let state = MigrationState::new("test-run".into(), "abc123".into());
        assert!(state.validate_config("abc123").is_ok());
        assert!(state.validate_config("different").is_err());
    }

    #[test]
    fn test_mark_failed_closes_running_phase() {
        let mut state = MigrationState::new("run".into(), "hash".into());
        state.begin_phase("transform");
        state.mark_failed("2 error(s) recorded during transform");

        assert_eq!(state.status, RunStatus::Failed);
        let phase = state.phase("transform").unwrap();
        assert_eq!(phase.status, PhaseStatus::Failed);
        assert!(phase.completed_at.is_some());
        assert!(state.error.as_deref().unwrap().contains("transform"));
    }
}
