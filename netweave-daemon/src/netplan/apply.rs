use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::DeviceKind;
use crate::error::{ApplyPhase, ConstructError, Result};
use crate::exec::{CommandExecutor, ExecError, ExecOptions};

/// Printed by `netplan try` when the change touches bridge or bond parameters
const TRIAL_REFUSAL: &str = "reverting custom parameters for bridges and bonds";

/// Which commit sequence actually ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPath {
    /// `netplan try` auto-reverting trial, then `netplan apply`
    TrialThenApply,
    /// `netplan apply` only; the kind does not support a trial
    Direct,
    /// The trial refused to run and the change went straight to `netplan apply`
    DirectAfterTrialRefused,
}

impl ApplyPath {
    pub fn describe(self) -> &'static str {
        match self {
            ApplyPath::TrialThenApply => "tested with an auto-reverting trial, then applied",
            ApplyPath::Direct => "applied directly (no trial available for this type)",
            ApplyPath::DirectAfterTrialRefused => {
                "applied directly after the trial refused bridge/bond parameters"
            }
        }
    }
}

enum TrialOutcome {
    Passed,
    Refused,
}

/// Drives the netplan toolchain: `generate`, `try`, `apply`
pub struct NetplanApplier {
    executor: Arc<dyn CommandExecutor>,
    try_timeout: Duration,
    try_grace: Duration,
}

impl NetplanApplier {
    pub fn new(executor: Arc<dyn CommandExecutor>, try_timeout: Duration, try_grace: Duration) -> Self {
        Self {
            executor,
            try_timeout,
            try_grace,
        }
    }

    /// Offline parse of the merged namespace. Nothing on the live system changes.
    pub async fn validate(&self) -> Result<()> {
        tracing::debug!("Validating netplan configuration");
        self.executor
            .execute(&["netplan", "generate"], ExecOptions::elevated())
            .await
            .map_err(|e| apply_error(ApplyPhase::Validate, "netplan generate", &e, true))?;
        Ok(())
    }

    /// Two-phase commit. Kinds without trial support go straight to a
    /// permanent apply, and the returned path says which sequence ran.
    /// `observe` hears about each phase before it starts.
    pub async fn test_and_apply_observed<F>(&self, kind: DeviceKind, mut observe: F) -> Result<ApplyPath>
    where
        F: FnMut(ApplyPhase) + Send,
    {
        if !kind.supports_trial() {
            tracing::info!("{} changes cannot be trialled, applying directly", kind);
            observe(ApplyPhase::Apply);
            self.apply(false).await?;
            return Ok(ApplyPath::Direct);
        }

        observe(ApplyPhase::Trial);
        match self.trial().await? {
            TrialOutcome::Passed => {
                observe(ApplyPhase::Apply);
                self.apply(true).await?;
                Ok(ApplyPath::TrialThenApply)
            }
            TrialOutcome::Refused => {
                tracing::info!("Trial refused bridge/bond parameters, applying directly");
                observe(ApplyPhase::Apply);
                self.apply(false).await?;
                Ok(ApplyPath::DirectAfterTrialRefused)
            }
        }
    }

    async fn trial(&self) -> Result<TrialOutcome> {
        let timeout_arg = format!("--timeout={}", self.try_timeout.as_secs());
        let options = ExecOptions::elevated().with_timeout(self.try_timeout + self.try_grace);
        tracing::info!("Trial apply with {}s revert window", self.try_timeout.as_secs());

        match self
            .executor
            .execute(&["netplan", "try", timeout_arg.as_str()], options)
            .await
        {
            Ok(_) => Ok(TrialOutcome::Passed),
            Err(e) if e.output_text().contains(TRIAL_REFUSAL) => Ok(TrialOutcome::Refused),
            // the revert window elapsed, netplan restores the previous state itself
            Err(e) => Err(apply_error(ApplyPhase::Trial, "netplan try", &e, true)),
        }
    }

    /// After a successful trial the previous state is still committed when the
    /// permanent apply fails; a direct apply gives no such guarantee.
    async fn apply(&self, after_trial: bool) -> Result<()> {
        self.executor
            .execute(&["netplan", "apply"], ExecOptions::elevated())
            .await
            .map_err(|e| apply_error(ApplyPhase::Apply, "netplan apply", &e, after_trial))?;
        tracing::info!("netplan apply succeeded");
        Ok(())
    }
}

fn apply_error(phase: ApplyPhase, step: &str, error: &ExecError, rolled_back: bool) -> ConstructError {
    let output = error.output_text();
    let hint = match error {
        ExecError::TimedOut { .. } => {
            Some("Check for syntax errors, missing fields, or network conflicts.".to_string())
        }
        _ => classify_failure(&output).map(str::to_string),
    };
    tracing::warn!("{} failed during {}: {}", step, phase, output.trim());
    ConstructError::Apply {
        phase,
        message: format!("{step} failed: {}", first_line(&output)),
        hint,
        rolled_back,
    }
}

fn first_line(output: &str) -> &str {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
}

/// Map netplan's error text to a remediation hint
pub fn classify_failure(output: &str) -> Option<&'static str> {
    let hint = if output.contains("YAML") || output.contains("yaml") {
        "Check your netplan YAML syntax for errors (indentation, colons, etc.)."
    } else if output.contains("duplicate") {
        "Check for duplicate IP addresses, interface names, or routes."
    } else if output.contains("missing") {
        "A required field may be missing in your netplan configuration."
    } else if output.contains("Invalid") || output.contains("invalid") {
        "Check for invalid values in your netplan file (e.g., wrong IP format, device name, etc.)."
    } else if output.contains("not found") {
        "A referenced device or key was not found. Check interface names and keys."
    } else if output.contains("Address already in use") {
        "The IP address you are trying to assign is already in use."
    } else if output.contains("Permission denied") {
        "You may not have permission to apply netplan. Try running as root."
    } else {
        return None;
    };
    Some(hint)
}
