//! Error taxonomy for the orchestration core.
//!
//! These are the failures callers are expected to match on. Everything
//! else (filesystem, serialization plumbing) travels as `anyhow` context
//! at the call sites.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DroverError {
    /// The terminal multiplexer could not allocate a session.
    #[error("failed to create session '{name}': {detail}")]
    SessionCreate { name: String, detail: String },

    /// A session operation targeted a session that is gone.
    #[error("session '{name}' not found")]
    SessionNotFound { name: String },

    /// A one-shot invocation exited non-zero. Carries the tool's stderr.
    #[error("assistant CLI failed (exit {exit_code}): {stderr}")]
    Invocation { exit_code: i32, stderr: String },

    /// The tool's stdout was not the expected JSON object with a
    /// `result` string field. Logged distinctly from `Invocation`
    /// since it points at a contract mismatch with the installed tool.
    #[error("assistant CLI output did not parse: {detail}")]
    MalformedOutput { detail: String },

    /// A unit of work is already in flight for this workspace.
    #[error("work already in progress for '{key}'")]
    AlreadyRunning { key: String },
}
