use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{ConstructError, Result};
use crate::netplan::apply::ApplyPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Validating,
    ConflictChecking,
    CriticalGate,
    Writing,
    Testing,
    Applying,
    Verifying,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Edit,
    Delete,
    SetLinkState,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Create => "create",
            Operation::Edit => "edit",
            Operation::Delete => "delete",
            Operation::SetLinkState => "link state change",
        };
        f.write_str(label)
    }
}

/// The change probably happened, but live state did not confirm it in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation_id: Uuid,
    pub operation: Operation,
    pub name: String,
    pub status: LifecycleState,
    pub message: String,
    pub hint: Option<String>,
    pub warnings: Vec<VerificationWarning>,
    pub notes: Vec<String>,
    pub apply_path: Option<ApplyPath>,
    pub document: Option<PathBuf>,
    pub trail: Vec<LifecycleState>,
    pub finished_at: DateTime<Utc>,
}

/// Records one operation's walk through the lifecycle
pub struct OperationTracker {
    id: Uuid,
    operation: Operation,
    name: String,
    trail: Vec<LifecycleState>,
    notes: Vec<String>,
    warnings: Vec<VerificationWarning>,
    apply_path: Option<ApplyPath>,
    document: Option<PathBuf>,
}

impl OperationTracker {
    pub fn new(operation: Operation, name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let name = name.into();
        tracing::info!("[{}] {} {} started", id, operation, name);
        Self {
            id,
            operation,
            name,
            trail: Vec::new(),
            notes: Vec::new(),
            warnings: Vec::new(),
            apply_path: None,
            document: None,
        }
    }

    pub fn enter(&mut self, state: LifecycleState) {
        tracing::debug!("[{}] {} -> {:?}", self.id, self.name, state);
        self.trail.push(state);
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn warn(&mut self, warning: VerificationWarning) {
        tracing::warn!("[{}] {}: {}", self.id, self.name, warning.message);
        self.warnings.push(warning);
    }

    pub fn set_apply_path(&mut self, path: ApplyPath) {
        self.apply_path = Some(path);
    }

    pub fn set_document(&mut self, path: PathBuf) {
        self.document = Some(path);
    }

    /// Close the operation. Warnings never turn success into failure.
    pub fn conclude(mut self, result: Result<String>) -> Result<OperationOutcome> {
        match result {
            Ok(message) => {
                self.enter(LifecycleState::Done);
                tracing::info!(
                    "[{}] {} {} done: {}",
                    self.id,
                    self.operation,
                    self.name,
                    message
                );
                let hint = self.warnings.iter().find_map(|warning| warning.hint.clone());
                Ok(OperationOutcome {
                    operation_id: self.id,
                    operation: self.operation,
                    name: self.name,
                    status: LifecycleState::Done,
                    message,
                    hint,
                    warnings: self.warnings,
                    notes: self.notes,
                    apply_path: self.apply_path,
                    document: self.document,
                    trail: self.trail,
                    finished_at: Utc::now(),
                })
            }
            Err(err) => {
                self.enter(LifecycleState::Failed);
                log_failure(&self, &err);
                Err(err)
            }
        }
    }
}

fn log_failure(tracker: &OperationTracker, err: &ConstructError) {
    let reached = tracker
        .trail
        .iter()
        .rev()
        .nth(1)
        .map(|state| format!("{state:?}"))
        .unwrap_or_else(|| "start".to_string());
    tracing::warn!(
        "[{}] {} {} failed at {}: {}",
        tracker.id,
        tracker.operation,
        tracker.name,
        reached,
        err
    );
}
