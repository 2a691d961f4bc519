/*!
 * Error taxonomy for construct operations
 * Every error carries a plain-language message and, where one exists, a hint
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::netplan::DeviceKind;

pub type Result<T> = std::result::Result<T, ConstructError>;

/// How far an apply sequence got before it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    Write,
    Validate,
    Trial,
    Apply,
    Runtime,
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApplyPhase::Write => "writing configuration",
            ApplyPhase::Validate => "validating configuration",
            ApplyPhase::Trial => "trial apply",
            ApplyPhase::Apply => "permanent apply",
            ApplyPhase::Runtime => "runtime change",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to render netplan document: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("{path} was changed by another editor since it was read")]
    Modified { path: PathBuf },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConstructError {
    /// Input failed a static rule; nothing was touched.
    #[error("{message}")]
    Validation { message: String },

    /// Naming or type collision with declared or live state; nothing was touched.
    #[error("{message}")]
    Conflict {
        message: String,
        path: Option<PathBuf>,
        existing: Option<DeviceKind>,
    },

    #[error("{name} has live dependents: {}", details.join("; "))]
    Dependency { name: String, details: Vec<String> },

    #[error("{operation} on critical interface {name} needs confirmation: {name} {}", reasons.join(", "))]
    ConfirmationRequired {
        name: String,
        operation: String,
        token: String,
        name_echo: bool,
        reasons: Vec<String>,
    },

    #[error("{phase} failed: {message}")]
    Apply {
        phase: ApplyPhase,
        message: String,
        hint: Option<String>,
        rolled_back: bool,
    },

    #[error("Another network change is already in progress")]
    Busy,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConstructError {
    pub fn validation(message: impl Into<String>) -> Self {
        ConstructError::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ConstructError::Conflict {
            message: message.into(),
            path: None,
            existing: None,
        }
    }

    /// Stable machine-readable label used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ConstructError::Validation { .. } => "validation",
            ConstructError::Conflict { .. } => "conflict",
            ConstructError::Dependency { .. } => "dependency",
            ConstructError::ConfirmationRequired { .. } => "confirmation_required",
            ConstructError::Apply { .. } => "apply",
            ConstructError::Busy => "busy",
            ConstructError::Store(_) => "store",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            ConstructError::Validation { .. } => None,
            ConstructError::Conflict { path: Some(path), .. } => Some(format!(
                "Rename the construct or edit {} by hand",
                path.display()
            )),
            ConstructError::Conflict { .. } => Some("Choose a different name".to_string()),
            ConstructError::Dependency { .. } => Some(
                "Remove the dependents first, or repeat the delete with force to proceed anyway"
                    .to_string(),
            ),
            ConstructError::ConfirmationRequired {
                token, name_echo, ..
            } => Some(if *name_echo {
                format!("Type the interface name \"{token}\" exactly to confirm")
            } else {
                format!("Type \"{token}\" to confirm you understand the risks")
            }),
            ConstructError::Apply { hint, .. } => hint.clone(),
            ConstructError::Busy => {
                Some("Wait for the running operation to finish and retry".to_string())
            }
            ConstructError::Store(StoreError::Modified { .. }) => {
                Some("Reload and repeat the operation".to_string())
            }
            ConstructError::Store(_) => None,
        }
    }

    /// Whether the live system is known to be back in its previous state
    pub fn rolled_back(&self) -> Option<bool> {
        match self {
            ConstructError::Apply { rolled_back, .. } => Some(*rolled_back),
            _ => None,
        }
    }
}
