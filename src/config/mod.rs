use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".drover";

fn default_agent_program() -> String {
    "claude".to_string()
}

fn default_startup_delay_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_capture_lines() -> u32 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_oneshot_program() -> String {
    "claude".to_string()
}

fn default_judge_program() -> String {
    "claude".to_string()
}

/// The interactive assistant launched inside the tmux session.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    /// Delay after launching the assistant before the first prompt is sent.
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// House rules folded into every step prompt.
    #[serde(default)]
    pub rules: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            startup_delay_secs: default_startup_delay_secs(),
            rules: String::new(),
        }
    }
}

/// Timings for the monitoring phase of the control loop.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound on one monitoring phase, prompt or not.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// How long captured output may stay byte-identical before the step
    /// counts as stalled.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_capture_lines")]
    pub capture_lines: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            capture_lines: default_capture_lines(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Consecutive failed evaluations tolerated per step before the run
    /// switches approach and then escalates.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// The non-interactive assistant used for one-shot messages.
#[derive(Debug, Clone, Deserialize)]
pub struct OneShotConfig {
    #[serde(default = "default_oneshot_program")]
    pub program: String,
}

impl Default for OneShotConfig {
    fn default() -> Self {
        Self {
            program: default_oneshot_program(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluatorMode {
    /// A step is complete when the assistant is back at its prompt.
    #[default]
    PromptIdle,
    /// Ask the assistant CLI itself for a verdict on the captured output.
    Judge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default)]
    pub mode: EvaluatorMode,
    #[serde(default = "default_judge_program")]
    pub judge_program: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            mode: EvaluatorMode::default(),
            judge_program: default_judge_program(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DroverConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub oneshot: OneShotConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

impl DroverConfig {
    /// Search upward from `start` for a `.drover/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: DroverConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((DroverConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
