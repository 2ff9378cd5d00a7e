//! Structured run log: JSON lines per control-loop run.
//!
//! Every run writes a `.jsonl` file under `<workspace>/.drover/logs/`
//! capturing what the loop did: prompts sent, monitor outcomes,
//! evaluation decisions, restarts, and how the run ended. Each line is
//! a self-contained JSON object with a timestamp, easy to grep and
//! post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

/// A structured event in the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// All event types that can appear in the run log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// A control-loop run began.
    RunStarted {
        run_id: String,
        session: String,
        steps: usize,
        evaluator: String,
    },
    /// The interactive assistant was launched in a fresh session.
    AgentLaunched { session: String, program: String },
    /// Work on a plan step began.
    StepStarted { index: usize, title: String },
    /// A prompt was sent into the session.
    PromptSent {
        index: usize,
        kind: String,
        prompt: String,
    },
    /// The monitoring phase ended with this signal.
    MonitorEnded { index: usize, signal: String },
    /// An interrupt keystroke was sent after a stall.
    StallInterrupted { index: usize },
    /// The evaluator returned a decision.
    Evaluated {
        index: usize,
        decision: String,
        detail: String,
    },
    /// A step was marked done.
    StepCompleted { index: usize, title: String },
    /// The session died and was recreated in place.
    SessionRestarted { session: String, prompt_resent: bool },
    /// The run finished with every step done.
    RunCompleted { steps_done: usize },
    /// The run stopped at a step and needs a human.
    RunEscalated { index: usize, reason: String },
    /// The run was stopped cooperatively.
    RunStopped { index: usize },
    /// The run aborted on an infrastructure failure.
    RunFailed { reason: String },
}

/// Writer for JSON lines run logs.
pub struct RunLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl RunLog {
    /// Open a log at the given path, creating parent directories and
    /// appending when the file already exists.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Open a fresh timestamp-named log file in `logs_dir`.
    pub fn create_in(logs_dir: &Path) -> Result<Self> {
        let name = format!("run-{}.jsonl", Utc::now().format("%Y%m%d-%H%M%S"));
        Self::new(&logs_dir.join(name))
    }

    /// Log an event.
    pub fn log(&self, event: RunEvent) -> Result<()> {
        let entry = RunLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "run log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
