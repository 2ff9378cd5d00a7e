//! Workspace directories: on-disk layout, identity file, and the
//! message transcript that drives conversation continuation.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::tmux;

pub const DROVER_DIR: &str = ".drover";
const PLAN_FILENAME: &str = "plan.json";
const MESSAGES_FILENAME: &str = "messages.jsonl";
const PID_FILENAME: &str = "run.pid";
const IDENTITY_FILENAME: &str = "CLAUDE.md";

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9\s-]").unwrap());
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DASH_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());

/// Derive a directory-friendly slug from a project name: lowercase,
/// keep `[a-z0-9 -]`, whitespace runs become single dashes.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped = NON_SLUG.replace_all(lowered.trim(), "");
    let dashed = WHITESPACE_RUN.replace_all(&stripped, "-");
    let collapsed = DASH_RUN.replace_all(&dashed, "-");
    collapsed.trim_matches('-').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One line of the `.drover/messages.jsonl` transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// A project workspace. The directory path doubles as the conversation
/// key: the registry, the plan, the transcript, and the tmux session
/// name are all derived from it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registry key for this workspace. Canonicalized so the same
    /// directory reached via different relative paths is one task.
    pub fn key(&self) -> String {
        fs::canonicalize(&self.root)
            .unwrap_or_else(|_| self.root.clone())
            .to_string_lossy()
            .into_owned()
    }

    /// tmux session name for this workspace, derived from the directory
    /// name.
    pub fn session_name(&self) -> String {
        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        tmux::session_name(&dir_name)
    }

    pub fn drover_dir(&self) -> PathBuf {
        self.root.join(DROVER_DIR)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.drover_dir().join(PLAN_FILENAME)
    }

    pub fn messages_path(&self) -> PathBuf {
        self.drover_dir().join(MESSAGES_FILENAME)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.drover_dir().join(PID_FILENAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.drover_dir().join("logs")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.root.join(IDENTITY_FILENAME)
    }

    /// Create the workspace directories and write the identity file the
    /// assistant reads on startup.
    pub fn scaffold(&self, name: &str, description: &str, architecture: Option<&str>) -> Result<()> {
        if slugify(name).is_empty() {
            bail!("invalid project name: {name:?} produces an empty slug");
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create workspace {}", self.root.display()))?;
        fs::create_dir_all(self.drover_dir())
            .with_context(|| format!("failed to create {}", self.drover_dir().display()))?;

        let mut identity = format!("# {name}\n\n{description}\n");
        if let Some(arch) = architecture.filter(|a| !a.trim().is_empty()) {
            identity.push_str(&format!("\n## Architecture\n\n{arch}\n"));
        }
        fs::write(self.identity_path(), identity)
            .with_context(|| format!("failed to write {}", self.identity_path().display()))?;
        Ok(())
    }

    pub fn has_identity(&self) -> bool {
        self.identity_path().is_file()
    }

    /// Append one transcript entry, creating the file on first use.
    pub fn append_message(&self, role: Role, content: &str) -> Result<()> {
        let path = self.messages_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let entry = TranscriptEntry {
            role,
            content: content.to_string(),
            at: Utc::now(),
        };
        let line = serde_json::to_string(&entry).context("failed to serialize transcript entry")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load the transcript, skipping lines that fail to parse.
    pub fn load_messages(&self) -> Result<Vec<TranscriptEntry>> {
        let path = self.messages_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("skipping malformed transcript line: {e}");
                }
            }
        }
        Ok(entries)
    }

    /// Whether this workspace has any prior conversation. A send with
    /// history continues the conversation instead of starting fresh.
    pub fn has_history(&self) -> bool {
        let path = self.messages_path();
        match fs::read_to_string(&path) {
            Ok(contents) => contents.lines().any(|l| !l.trim().is_empty()),
            Err(_) => false,
        }
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        let path = self.pid_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, format!("{pid}\n"))
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn read_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(self.pid_path()).ok()?;
        contents.trim().parse().ok()
    }

    pub fn clear_pid(&self) {
        let _ = fs::remove_file(self.pid_path());
    }
}
