use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

use drover::cli::{Cli, Command};
use drover::config::{DroverConfig, EvaluatorMode};
use drover::control::RunOutcome;
use drover::oneshot::OneShotOutcome;
use drover::plan::{Plan, RunState, StepStatus};
use drover::registry::TaskRegistry;
use drover::runs::{self, RunHandle, StartOptions, StatusReport};
use drover::shell_completion;
use drover::tmux;
use drover::workspace::{self, Workspace};

fn evaluator_mode_label(mode: EvaluatorMode) -> &'static str {
    match mode {
        EvaluatorMode::PromptIdle => "prompt-idle",
        EvaluatorMode::Judge => "judge",
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults; no .drover/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn render_config_human(config: &DroverConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Agent\n");
    push_kv(&mut output, "program", &config.agent.program);
    push_kv(
        &mut output,
        "startup_delay",
        format!("{}s", config.agent.startup_delay_secs),
    );
    if config.agent.rules.is_empty() {
        push_kv(&mut output, "rules", "(none)");
    } else {
        push_kv(&mut output, "rules", &config.agent.rules);
    }
    output.push('\n');

    output.push_str("Monitor\n");
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}s", config.monitor.poll_interval_secs),
    );
    push_kv(
        &mut output,
        "step_timeout",
        format!("{}s", config.monitor.step_timeout_secs),
    );
    push_kv(
        &mut output,
        "stall_threshold",
        format!("{}s", config.monitor.stall_threshold_secs),
    );
    push_kv(&mut output, "capture_lines", config.monitor.capture_lines);
    output.push('\n');

    output.push_str("Run\n");
    push_kv(&mut output, "max_retries", config.run.max_retries);
    output.push('\n');

    output.push_str("Evaluator\n");
    push_kv(&mut output, "mode", evaluator_mode_label(config.evaluator.mode));
    push_kv(&mut output, "judge_program", &config.evaluator.judge_program);
    output.push('\n');

    output.push_str("One-shot\n");
    push_kv(&mut output, "program", &config.oneshot.program);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &DroverConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "agent": {
            "program": &config.agent.program,
            "startup_delay_secs": config.agent.startup_delay_secs,
            "rules": &config.agent.rules
        },
        "monitor": {
            "poll_interval_secs": config.monitor.poll_interval_secs,
            "step_timeout_secs": config.monitor.step_timeout_secs,
            "stall_threshold_secs": config.monitor.stall_threshold_secs,
            "capture_lines": config.monitor.capture_lines
        },
        "run": {
            "max_retries": config.run.max_retries
        },
        "evaluator": {
            "mode": evaluator_mode_label(config.evaluator.mode),
            "judge_program": &config.evaluator.judge_program
        },
        "oneshot": {
            "program": &config.oneshot.program
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn step_marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Done => "[x]",
        StepStatus::InProgress => "[>]",
        StepStatus::Pending => "[ ]",
    }
}

fn render_status(report: &StatusReport) -> String {
    let mut output = String::new();
    output.push_str("Workspace\n");
    push_kv(&mut output, "root", report.root.display());
    let session = if report.session_alive {
        format!("{} (alive)", report.session)
    } else {
        format!("{} (not running)", report.session)
    };
    push_kv(&mut output, "session", session);
    let worker = match report.detached_pid {
        Some(pid) if report.worker_alive => format!("pid {pid} (alive)"),
        Some(pid) => format!("pid {pid} (dead)"),
        None => "(none)".to_string(),
    };
    push_kv(&mut output, "worker", worker);
    push_kv(&mut output, "messages", report.message_count);
    output.push('\n');

    output.push_str("Run\n");
    push_kv(&mut output, "state", report.state.as_str());
    if let Some(ref reason) = report.escalation {
        push_kv(&mut output, "escalation", reason);
    }
    let done = report
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Done)
        .count();
    push_kv(
        &mut output,
        "progress",
        format!("{done}/{} steps done", report.steps.len()),
    );
    output.push('\n');

    output.push_str("Steps\n");
    if report.steps.is_empty() {
        output.push_str("  (none)\n");
    } else {
        for (i, step) in report.steps.iter().enumerate() {
            let current = if Some(i) == report.current_step {
                "  <- current"
            } else {
                ""
            };
            output.push_str(&format!(
                "  {} {}{current}\n",
                step_marker(step.status),
                step.title
            ));
        }
    }

    if !report.last_capture.is_empty() {
        output.push('\n');
        output.push_str("Last output\n");
        for line in report.last_capture.lines() {
            output.push_str(&format!("  | {line}\n"));
        }
    }

    output
}

fn load_config(start: &Path) -> Result<DroverConfig> {
    let (config, config_path) = DroverConfig::load(start)?;
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .drover/config.toml found, using defaults"),
    }
    Ok(config)
}

/// Spawn a background worker running the same subcommand with
/// `--foreground`, stdout and stderr redirected to a log file.
fn spawn_detached(subcommand: &str, root: &Path, workspace: &Workspace) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg(subcommand).arg(root).arg("--foreground");

    let log_dir = workspace.logs_dir();
    std::fs::create_dir_all(&log_dir)?;
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let detached_log = log_dir.join(format!("detached-{ts}.log"));
    let stdout_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&detached_log)?;
    let stderr_log = stdout_log.try_clone()?;

    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log))
        .spawn()?;

    println!(
        "[drover] started detached in background (pid: {})",
        child.id()
    );
    println!("[drover] attach with: drover attach {}", root.display());
    println!("[drover] detached log: {}", detached_log.display());
    Ok(())
}

/// Drive the control loop on this process, stopping cooperatively on
/// Ctrl-C. Writes the pid file so `drover stop` can find the worker.
fn run_foreground(workspace: Workspace, config: DroverConfig, resume: bool) -> Result<()> {
    let registry = Arc::new(TaskRegistry::new());
    let stop_registry = Arc::clone(&registry);
    let stop_key = workspace.key();
    ctrlc::set_handler(move || {
        stop_registry.cancel(&stop_key);
    })
    .ok();

    workspace.write_pid(std::process::id())?;
    let options = StartOptions {
        workspace: workspace.clone(),
        config,
    };
    let started = if resume {
        runs::resume_run(&registry, options)
    } else {
        runs::start_run(&registry, options)
    };
    let result = started.and_then(RunHandle::join);
    workspace.clear_pid();

    match result? {
        RunOutcome::Completed => println!("[drover] run complete"),
        RunOutcome::Escalated { step_index, reason } => {
            println!("[drover] escalated at step {}: {reason}", step_index + 1);
            println!(
                "[drover] resume after fixing with: drover resume {}",
                workspace.root().display()
            );
        }
        RunOutcome::Stopped => {
            println!(
                "[drover] run paused; resume with: drover resume {}",
                workspace.root().display()
            );
        }
    }
    Ok(())
}

#[cfg(unix)]
fn terminate_worker(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).context("pid out of range")?;
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        anyhow::bail!(
            "failed to signal pid {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate_worker(_pid: u32) -> Result<()> {
    anyhow::bail!("stopping a detached worker is not supported on this platform")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "drover=warn",
        0 => "drover=info",
        1 => "drover=debug",
        _ => "drover=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::New {
            name,
            description,
            architecture,
            plan,
            dir,
        } => {
            let slug = workspace::slugify(&name);
            if slug.is_empty() {
                anyhow::bail!("invalid project name: {name:?} produces an empty slug");
            }
            let root = dir.join(&slug);
            if root.exists() {
                anyhow::bail!("{} already exists", root.display());
            }
            let workspace = Workspace::new(&root);
            workspace.scaffold(&name, &description, architecture.as_deref())?;

            let plan_doc = match plan {
                Some(ref path) => {
                    let contents = std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read plan file {}", path.display()))?;
                    Plan::from_titles(contents.lines().map(str::trim).filter(|l| !l.is_empty()))
                }
                None => Plan::from_titles(Vec::<String>::new()),
            };
            plan_doc.save(&workspace.plan_path())?;

            println!("Created workspace {}", root.display());
            println!("  identity:  {}", workspace.identity_path().display());
            println!(
                "  plan:      {} ({} steps)",
                workspace.plan_path().display(),
                plan_doc.steps.len()
            );
            if plan_doc.steps.is_empty() {
                println!("Add steps to the plan, then run: drover run {}", root.display());
            } else {
                println!("Run the plan with: drover run {}", root.display());
            }
        }
        Command::Run {
            workspace,
            foreground,
        } => {
            let root = std::fs::canonicalize(&workspace)
                .with_context(|| format!("workspace {} does not exist", workspace.display()))?;
            let workspace = Workspace::new(&root);
            let plan_path = workspace.plan_path();
            if !plan_path.exists() {
                anyhow::bail!(
                    "no plan found at {}; scaffold the workspace with `drover new` first",
                    plan_path.display()
                );
            }

            if foreground {
                let config = load_config(workspace.root())?;
                run_foreground(workspace, config, false)?;
            } else {
                // The worker runs with --foreground to avoid recursive
                // spawning.
                spawn_detached("run", &root, &workspace)?;
            }
        }
        Command::Resume {
            workspace,
            foreground,
        } => {
            let root = std::fs::canonicalize(&workspace)
                .with_context(|| format!("workspace {} does not exist", workspace.display()))?;
            let workspace = Workspace::new(&root);
            let plan = Plan::load(&workspace.plan_path())?;
            if plan.is_complete() {
                anyhow::bail!("nothing to resume: every step is already done");
            }

            if foreground {
                let config = load_config(workspace.root())?;
                run_foreground(workspace, config, true)?;
            } else {
                spawn_detached("resume", &root, &workspace)?;
            }
        }
        Command::Stop {
            workspace,
            keep_session,
        } => {
            let workspace = Workspace::new(&workspace);
            let mut found = false;

            if let Some(pid) = workspace.read_pid() {
                if runs::process_alive(pid) {
                    match terminate_worker(pid) {
                        Ok(()) => {
                            println!("[drover] sent SIGTERM to worker (pid: {pid})");
                            found = true;
                        }
                        Err(e) => warn!("failed to stop worker {pid}: {e:#}"),
                    }
                }
                workspace.clear_pid();
            }

            let session = workspace.session_name();
            if tmux::session_exists(&session) {
                if keep_session {
                    println!("[drover] leaving session '{session}' alive");
                } else {
                    tmux::kill_session(&session);
                    println!("[drover] killed session '{session}'");
                }
                found = true;
            }

            // A SIGTERM'd worker exits without marking the plan, so the
            // state fixup happens here.
            let plan_path = workspace.plan_path();
            if plan_path.exists() {
                let mut plan = Plan::load(&plan_path)?;
                if plan.state == RunState::Running {
                    plan.state = RunState::Paused;
                    plan.save(&plan_path)?;
                    println!(
                        "[drover] run paused; resume with: drover resume {}",
                        workspace.root().display()
                    );
                }
            }

            if !found {
                println!("[drover] nothing to stop for {}", workspace.root().display());
            }
        }
        Command::Send {
            workspace,
            message,
            new_conversation,
        } => {
            let workspace = Workspace::new(&workspace);
            if !workspace.root().is_dir() {
                anyhow::bail!("workspace {} does not exist", workspace.root().display());
            }
            if let Some(pid) = workspace.read_pid() {
                if runs::process_alive(pid) {
                    anyhow::bail!(
                        "a run worker (pid {pid}) is active for this workspace; stop it first with `drover stop`"
                    );
                }
            }
            let config = load_config(workspace.root())?;

            let registry = Arc::new(TaskRegistry::new());
            let cancel_registry = Arc::clone(&registry);
            let cancel_key = workspace.key();
            ctrlc::set_handler(move || {
                cancel_registry.cancel(&cancel_key);
            })
            .ok();

            let is_continuation = !new_conversation && workspace.has_history();
            match runs::send_one_shot(&registry, &workspace, &message, is_continuation, &config)? {
                OneShotOutcome::Completed(reply) => println!("{}", reply.text),
                OneShotOutcome::Cancelled => println!("[drover] cancelled"),
            }
        }
        Command::Status { workspace } => {
            let workspace = Workspace::new(&workspace);
            let config = load_config(workspace.root())?;
            let report = runs::status(&workspace, &config)?;
            print!("{}", render_status(&report));
        }
        Command::Sessions => {
            let sessions = runs::list_run_sessions();
            if sessions.is_empty() {
                println!("no live drover sessions");
            } else {
                for session in &sessions {
                    println!("{session}");
                }
            }
        }
        Command::Attach { workspace } => {
            let workspace = Workspace::new(&workspace);
            let session = workspace.session_name();
            if !tmux::session_exists(&session) {
                anyhow::bail!(
                    "no live session '{session}' for {}; start one with `drover run`",
                    workspace.root().display()
                );
            }
            tmux::attach(&session)?;
        }
        Command::Config { json } => {
            let cwd =
                std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
            let (config, config_path) = DroverConfig::load(&cwd)?;
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::Completions { shell } => {
            shell_completion::print(shell)?;
        }
    }

    Ok(())
}
