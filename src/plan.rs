//! Plan and step data model.
//!
//! A workspace's plan lives at `.drover/plan.json`: an ordered list of
//! steps plus the run state. Step statuses are monotonic along the
//! sequence: every step before the current one is done, at most one
//! step is in progress, and nothing after a non-done step may be done.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub title: String,
    pub status: StepStatus,
}

impl Step {
    pub fn pending(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: StepStatus::Pending,
        }
    }
}

/// Lifecycle state of a workspace's run, persisted beside the steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Escalated,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Escalated => "escalated",
        }
    }
}

/// The persisted plan document for one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub state: RunState,
    /// Reason surfaced when the run escalated; cleared on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn from_titles<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: RunState::Created,
            escalation: None,
            steps: titles.into_iter().map(Step::pending).collect(),
        }
    }

    /// Index of the current step: the first one that is not done.
    pub fn current_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Done)
    }

    pub fn is_complete(&self) -> bool {
        self.current_index().is_none()
    }

    pub fn done_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count()
    }

    /// Mark a step in progress. Only the current step may start.
    pub fn begin_step(&mut self, index: usize) -> Result<()> {
        if self.current_index() != Some(index) {
            bail!(
                "step {index} cannot start: current step is {:?}",
                self.current_index()
            );
        }
        self.steps[index].status = StepStatus::InProgress;
        Ok(())
    }

    /// Mark a step done. Only the current step may complete.
    pub fn complete_step(&mut self, index: usize) -> Result<()> {
        if self.current_index() != Some(index) {
            bail!(
                "step {index} cannot complete: current step is {:?}",
                self.current_index()
            );
        }
        self.steps[index].status = StepStatus::Done;
        Ok(())
    }

    /// Check the monotonic-status invariant over the whole sequence.
    pub fn validate(&self) -> Result<()> {
        let mut seen_not_done = false;
        let mut in_progress = 0usize;
        for (i, step) in self.steps.iter().enumerate() {
            match step.status {
                StepStatus::Done => {
                    if seen_not_done {
                        bail!("step {i} is done after an unfinished step");
                    }
                }
                StepStatus::InProgress => {
                    in_progress += 1;
                    if in_progress > 1 {
                        bail!("more than one step is in progress");
                    }
                    seen_not_done = true;
                }
                StepStatus::Pending => {
                    seen_not_done = true;
                }
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse plan file {}", path.display()))?;
        plan.validate()
            .with_context(|| format!("plan file {} violates step ordering", path.display()))?;
        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize plan")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write plan file {}", path.display()))?;
        Ok(())
    }
}
