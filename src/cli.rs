use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "drover",
    about = "Drive a coding assistant CLI through plans, tmux sessions, and one-shot messages",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scaffold a new project workspace
    New {
        /// Project name; the directory slug is derived from it
        name: String,

        /// One-line project description written into the identity file
        #[arg(long, default_value = "")]
        description: String,

        /// Architecture notes appended to the identity file
        #[arg(long)]
        architecture: Option<String>,

        /// File with one plan step title per line
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Parent directory for the workspace
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Run the plan for a workspace through the control loop
    Run {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: PathBuf,

        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Resume a paused or escalated run
    Resume {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: PathBuf,

        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the active run for a workspace
    Stop {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: PathBuf,

        /// Leave the tmux session alive for inspection
        #[arg(long)]
        keep_session: bool,
    },

    /// Send one message to the assistant and print the reply
    Send {
        /// Workspace directory
        workspace: PathBuf,

        /// The message text
        message: String,

        /// Start a fresh conversation even when the workspace has history
        #[arg(long)]
        new_conversation: bool,
    },

    /// Show the run state, plan progress, and session liveness
    Status {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: PathBuf,
    },

    /// List live drover tmux sessions
    Sessions,

    /// Attach to a workspace's tmux session
    Attach {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of the human-readable form
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
