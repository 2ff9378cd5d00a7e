//! drover: drive a coding assistant CLI through plans, tmux sessions,
//! and one-shot messages.
//!
//! The binary in `main.rs` is a thin dispatch layer; everything it does
//! goes through the [`runs`] facade, which is also the programmatic
//! entry point for embedding.

pub mod classify;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod evaluate;
pub mod oneshot;
pub mod plan;
pub mod prompt;
pub mod registry;
pub mod runlog;
pub mod runs;
pub mod shell_completion;
pub mod tmux;
pub mod workspace;
