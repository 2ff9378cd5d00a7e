//! Run facade: start, stop, resume, one-shot messages, and status.
//!
//! Everything here is keyed by the workspace directory. Control-loop
//! runs execute on their own worker thread; one-shot messages run
//! synchronously on the caller's thread. Both register with the
//! [`TaskRegistry`] so the workspace only ever has one unit of work in
//! flight, and so a later stop request can find it.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Result, bail};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify;
use crate::config::DroverConfig;
use crate::control::{ControlLoop, RunOutcome, SessionDriver, TmuxDriver};
use crate::oneshot::{self, InvokeRequest, OneShotOutcome};
use crate::plan::{Plan, RunState, Step};
use crate::registry::{TaskKind, TaskRegistry};
use crate::tmux;
use crate::workspace::{Role, Workspace};

/// Pane lines shown in a status report.
const STATUS_SNIPPET_LINES: usize = 15;

pub struct StartOptions {
    pub workspace: Workspace,
    pub config: DroverConfig,
}

/// Handle to a control-loop run executing on a worker thread.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub workspace_key: String,
    handle: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    /// Wait for the worker to finish and return how the run ended.
    pub fn join(self) -> Result<RunOutcome> {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => bail!("run worker thread panicked"),
        }
    }
}

/// Start the control loop for a workspace on a worker thread.
///
/// Fails with `AlreadyRunning` when the workspace has an active task,
/// and before that when the workspace has no plan to drive.
pub fn start_run(registry: &Arc<TaskRegistry>, options: StartOptions) -> Result<RunHandle> {
    start_run_with(registry, options, TmuxDriver)
}

fn start_run_with<D: SessionDriver>(
    registry: &Arc<TaskRegistry>,
    options: StartOptions,
    driver: D,
) -> Result<RunHandle> {
    let StartOptions { workspace, config } = options;

    let plan_path = workspace.plan_path();
    if !plan_path.exists() {
        bail!(
            "no plan found at {}; scaffold the workspace with `drover new` first",
            plan_path.display()
        );
    }

    let key = workspace.key();
    let task = registry.register(&key, TaskKind::ControlRun)?;
    let run_id = task.run_id;

    let control = match ControlLoop::new(workspace, &config, run_id, task.cancel, driver) {
        Ok(control) => control,
        Err(e) => {
            registry.complete(&key, run_id);
            return Err(e);
        }
    };

    info!(key = %key, run_id = %run_id, "starting run");

    let worker_registry = Arc::clone(registry);
    let worker_key = key.clone();
    let handle = thread::spawn(move || {
        let outcome = control.run();
        worker_registry.complete(&worker_key, run_id);
        outcome
    });

    Ok(RunHandle {
        run_id,
        workspace_key: key,
        handle,
    })
}

/// Request cooperative cancellation of whatever is active for the
/// workspace. Returns `false` when nothing was running.
pub fn stop_run(registry: &TaskRegistry, workspace: &Workspace) -> bool {
    registry.cancel(&workspace.key())
}

/// Resume a paused or escalated run at its first unfinished step.
pub fn resume_run(registry: &Arc<TaskRegistry>, options: StartOptions) -> Result<RunHandle> {
    let plan = Plan::load(&options.workspace.plan_path())?;
    if plan.is_complete() {
        bail!("nothing to resume: every step is already done");
    }
    start_run(registry, options)
}

/// Send one message through the non-interactive assistant and record
/// the exchange in the workspace transcript.
///
/// Runs synchronously; a concurrent [`TaskRegistry::cancel`] kills the
/// child process. A cancelled exchange leaves no trace in the
/// transcript. Failures are recorded as a visible `Error:` reply and
/// are never retried.
pub fn send_one_shot(
    registry: &TaskRegistry,
    workspace: &Workspace,
    message: &str,
    is_continuation: bool,
    config: &DroverConfig,
) -> Result<OneShotOutcome> {
    let key = workspace.key();
    let task = registry.register(&key, TaskKind::OneShot)?;
    let run_id = task.run_id;

    let request = InvokeRequest {
        program: config.oneshot.program.clone(),
        message: message.to_string(),
        workspace: workspace.root().to_path_buf(),
        continue_conversation: is_continuation,
    };

    info!(key = %key, continuation = is_continuation, "sending one-shot message");
    let result = oneshot::invoke_cancellable(&request, &task.cancel, &task.child_slot);
    registry.complete(&key, run_id);

    match result {
        Ok(OneShotOutcome::Completed(reply)) => {
            workspace.append_message(Role::User, message)?;
            workspace.append_message(Role::Assistant, &reply.text)?;
            Ok(OneShotOutcome::Completed(reply))
        }
        Ok(OneShotOutcome::Cancelled) => {
            info!(key = %key, "one-shot cancelled");
            Ok(OneShotOutcome::Cancelled)
        }
        Err(e) => {
            warn!(key = %key, "one-shot failed: {e:#}");
            workspace.append_message(Role::User, message)?;
            workspace.append_message(Role::Assistant, &format!("Error: {e:#}"))?;
            Err(e)
        }
    }
}

/// Snapshot of a workspace's run, readable at any time from any
/// process.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub root: PathBuf,
    pub session: String,
    pub session_alive: bool,
    pub state: RunState,
    pub escalation: Option<String>,
    pub steps: Vec<Step>,
    pub current_step: Option<usize>,
    pub message_count: usize,
    pub detached_pid: Option<u32>,
    pub worker_alive: bool,
    pub last_capture: String,
}

pub fn status(workspace: &Workspace, config: &DroverConfig) -> Result<StatusReport> {
    if !workspace.drover_dir().exists() {
        bail!(
            "{} is not a drover workspace; scaffold one with `drover new`",
            workspace.root().display()
        );
    }

    let plan_path = workspace.plan_path();
    let plan = if plan_path.exists() {
        Plan::load(&plan_path)?
    } else {
        Plan::from_titles(Vec::<String>::new())
    };

    let session = workspace.session_name();
    let session_alive = tmux::session_exists(&session);
    let last_capture = if session_alive {
        let stripped =
            classify::strip_ansi(&tmux::capture_pane(&session, config.monitor.capture_lines));
        let lines: Vec<&str> = stripped.lines().collect();
        let tail = lines.len().saturating_sub(STATUS_SNIPPET_LINES);
        lines[tail..].join("\n").trim_end().to_string()
    } else {
        String::new()
    };

    let detached_pid = workspace.read_pid();
    let worker_alive = detached_pid.is_some_and(process_alive);

    Ok(StatusReport {
        root: workspace.root().to_path_buf(),
        session,
        session_alive,
        current_step: plan.current_index(),
        state: plan.state,
        escalation: plan.escalation,
        steps: plan.steps,
        message_count: workspace.load_messages()?.len(),
        detached_pid,
        worker_alive,
        last_capture,
    })
}

/// Live `drover-*` tmux sessions.
pub fn list_run_sessions() -> Vec<String> {
    tmux::list_sessions()
        .into_iter()
        .filter(|name| name.starts_with("drover-"))
        .collect()
}

/// Check whether a process exists, without signalling it.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // A pid that wraps negative as i32 would probe a process group.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(raw, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}
