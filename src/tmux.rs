//! tmux session management for drover.
//!
//! Wraps tmux CLI commands for session lifecycle, input injection via
//! send-keys, and visible-pane capture. Each agent workspace gets one
//! detached session running the user's shell; the interactive assistant
//! is launched by sending its program name as a line of input.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::error::DroverError;

/// Pane history window captured by default, in lines.
pub const DEFAULT_CAPTURE_LINES: u32 = 200;

/// Check that tmux is installed and reachable.
pub fn check_tmux() -> Result<String> {
    let output = Command::new("tmux").arg("-V").output().context(
        "tmux not found: install tmux (e.g., `apt install tmux` or `brew install tmux`)",
    )?;

    if !output.status.success() {
        bail!(
            "tmux -V failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(version = %version, "tmux found");
    Ok(version)
}

/// Convention for session names: `drover-<slug>`.
pub fn session_name(slug: &str) -> String {
    // tmux target parsing treats '.' and ':' as pane/window separators,
    // so session names must avoid punctuation that can be interpreted.
    let sanitized: String = slug
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("drover-{sanitized}")
}

/// Check if a tmux session exists. Never errors; an unreachable tmux
/// binary reads as "no session".
pub fn session_exists(session: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", "-t", session])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Create a detached tmux session rooted at the given working directory.
///
/// The session runs the default shell; callers launch the assistant by
/// sending its program name with [`send_line`].
pub fn create_session(session: &str, work_dir: &Path) -> Result<(), DroverError> {
    if session_exists(session) {
        return Err(DroverError::SessionCreate {
            name: session.to_string(),
            detail: "session already exists".to_string(),
        });
    }

    // tmux new-session -d -s <name> -c <work_dir>
    let output = Command::new("tmux")
        .args(["new-session", "-d", "-s", session, "-c"])
        .arg(work_dir)
        .output()
        .map_err(|e| DroverError::SessionCreate {
            name: session.to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(DroverError::SessionCreate {
            name: session.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!(session = session, work_dir = %work_dir.display(), "tmux session created");
    Ok(())
}

/// Send a line of text into the session, submitted with Enter.
///
/// The text is sent literally (`-l`) so punctuation is not interpreted as
/// tmux key names, then Enter goes as an explicit second action so the
/// line is always submitted.
pub fn send_line(session: &str, text: &str) -> Result<(), DroverError> {
    if !session_exists(session) {
        return Err(DroverError::SessionNotFound {
            name: session.to_string(),
        });
    }

    if !text.is_empty() {
        let output = Command::new("tmux")
            .args(["send-keys", "-t", session, "-l", "--", text])
            .output()
            .map_err(|_| DroverError::SessionNotFound {
                name: session.to_string(),
            })?;

        if !output.status.success() {
            return Err(DroverError::SessionNotFound {
                name: session.to_string(),
            });
        }
    }

    let output = Command::new("tmux")
        .args(["send-keys", "-t", session, "C-m"])
        .output()
        .map_err(|_| DroverError::SessionNotFound {
            name: session.to_string(),
        })?;

    if !output.status.success() {
        return Err(DroverError::SessionNotFound {
            name: session.to_string(),
        });
    }

    debug!(session = session, len = text.len(), "sent line");
    Ok(())
}

/// Send Ctrl-C into the session (used to break a stalled command).
pub fn send_interrupt(session: &str) -> Result<(), DroverError> {
    let output = Command::new("tmux")
        .args(["send-keys", "-t", session, "C-c"])
        .output()
        .map_err(|_| DroverError::SessionNotFound {
            name: session.to_string(),
        })?;

    if !output.status.success() {
        return Err(DroverError::SessionNotFound {
            name: session.to_string(),
        });
    }

    debug!(session = session, "sent interrupt");
    Ok(())
}

/// Capture the last `lines` of rendered pane content.
///
/// Safe to call on a dead session: liveness can change between a check
/// and the capture, so a failed capture reads as empty output rather
/// than an error.
pub fn capture_pane(session: &str, lines: u32) -> String {
    let start = format!("-{lines}");
    let output = Command::new("tmux")
        .args(["capture-pane", "-t", session, "-p", "-S", &start])
        .output();

    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
        _ => String::new(),
    }
}

/// Kill a tmux session. Best-effort and idempotent: killing a session
/// that is already gone is a no-op, not an error.
pub fn kill_session(session: &str) {
    if !session_exists(session) {
        return; // already gone
    }

    match Command::new("tmux")
        .args(["kill-session", "-t", session])
        .output()
    {
        Ok(o) if o.status.success() => {
            info!(session = session, "tmux session killed");
        }
        Ok(o) => {
            debug!(
                session = session,
                stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                "tmux kill-session failed (ignored)"
            );
        }
        Err(e) => {
            debug!(session = session, error = %e, "tmux kill-session failed (ignored)");
        }
    }
}

/// List all live tmux session names. An unreachable tmux server reads
/// as "no sessions".
pub fn list_sessions() -> Vec<String> {
    let output = Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output();

    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
            .lines()
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

/// Attach to an existing tmux session (blocks until detach/exit).
pub fn attach(session: &str) -> Result<()> {
    if !session_exists(session) {
        bail!(
            "tmux session '{session}' not found; is a run active? \
             Start one with `drover run <workspace>`"
        );
    }

    let status = Command::new("tmux")
        .args(["attach-session", "-t", session])
        .status()
        .with_context(|| format!("failed to attach to tmux session '{session}'"))?;

    if !status.success() {
        bail!("tmux attach exited with non-zero status");
    }

    Ok(())
}
