//! One-shot invocations of the assistant CLI.
//!
//! Each call runs the tool once from the workspace directory and returns
//! the reply text parsed from its JSON output. Failures are never
//! retried here; callers decide what a failure means.

use anyhow::{Context, Result, bail};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::error::DroverError;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed for one invocation of the assistant.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub program: String,
    pub message: String,
    pub workspace: PathBuf,
    /// Continue the workspace's prior conversation instead of starting
    /// a fresh one.
    pub continue_conversation: bool,
}

impl InvokeRequest {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-p")
            .arg(&self.message)
            .arg("--dangerously-skip-permissions")
            .args(["--output-format", "json"]);
        if self.continue_conversation {
            command.arg("-c");
        }
        command.current_dir(&self.workspace);
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub text: String,
}

#[derive(Debug)]
pub enum OneShotOutcome {
    Completed(InvocationResult),
    Cancelled,
}

enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
    PollFailed(std::io::Error),
}

/// Blocking invocation. Runs the tool to completion and returns its
/// reply text.
pub fn invoke(request: &InvokeRequest) -> Result<InvocationResult> {
    let cancel = AtomicBool::new(false);
    let child_slot = Mutex::new(None);
    match invoke_cancellable(request, &cancel, &child_slot)? {
        OneShotOutcome::Completed(result) => Ok(result),
        // The local flag above is never set.
        OneShotOutcome::Cancelled => bail!("invocation cancelled without a cancel request"),
    }
}

/// Cancellable invocation. The spawned child is published into
/// `child_slot` so another thread may kill it; setting `cancel` stops
/// the wait and reports `Cancelled` instead of a result.
pub fn invoke_cancellable(
    request: &InvokeRequest,
    cancel: &AtomicBool,
    child_slot: &Mutex<Option<Child>>,
) -> Result<OneShotOutcome> {
    debug!(
        program = %request.program,
        continuation = request.continue_conversation,
        "invoking assistant"
    );

    let mut child = request
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch '{}'", request.program))?;

    // Drain both pipes on their own threads so a chatty tool cannot
    // fill a pipe and block while we wait on the other one.
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = thread::spawn(move || drain(stdout_pipe));
    let stderr_reader = thread::spawn(move || drain(stderr_pipe));

    *child_slot.lock().unwrap() = Some(child);

    let outcome = loop {
        if cancel.load(Ordering::SeqCst) {
            reap(child_slot);
            break WaitOutcome::Cancelled;
        }
        {
            let mut slot = child_slot.lock().unwrap();
            match slot.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.take();
                        break WaitOutcome::Exited(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        drop(slot);
                        reap(child_slot);
                        break WaitOutcome::PollFailed(e);
                    }
                },
                // Someone emptied the slot out from under us; treat it
                // like a cancellation.
                None => break WaitOutcome::Cancelled,
            }
        }
        thread::sleep(CANCEL_POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    match outcome {
        WaitOutcome::Cancelled => {
            debug!("invocation cancelled");
            Ok(OneShotOutcome::Cancelled)
        }
        WaitOutcome::PollFailed(e) => {
            Err(e).context("failed to poll the assistant process")
        }
        WaitOutcome::Exited(status) if !status.success() => Err(DroverError::Invocation {
            exit_code: status.code().unwrap_or(-1),
            stderr: stderr.trim_end().to_string(),
        }
        .into()),
        WaitOutcome::Exited(_) => {
            let result = parse_result(&stdout)?;
            debug!(chars = result.text.len(), "assistant replied");
            Ok(OneShotOutcome::Completed(result))
        }
    }
}

fn reap(child_slot: &Mutex<Option<Child>>) {
    let taken = child_slot.lock().unwrap().take();
    if let Some(mut child) = taken {
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn drain<R: Read>(stream: Option<R>) -> String {
    let mut text = String::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_string(&mut text);
    }
    text
}

/// The tool prints one JSON object; the reply lives in its `result`
/// string field.
fn parse_result(stdout: &str) -> Result<InvocationResult, DroverError> {
    let value: serde_json::Value =
        serde_json::from_str(stdout).map_err(|e| DroverError::MalformedOutput {
            detail: format!("invalid JSON: {e}"),
        })?;
    match value.get("result").and_then(|v| v.as_str()) {
        Some(text) => Ok(InvocationResult {
            text: text.to_string(),
        }),
        None => Err(DroverError::MalformedOutput {
            detail: "missing string field 'result'".to_string(),
        }),
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    /// Write an executable shell script standing in for the assistant.
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-tool");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn request(tmp: &Path, body: &str) -> InvokeRequest {
        let tool = fake_tool(tmp, body);
        InvokeRequest {
            program: tool.to_string_lossy().into_owned(),
            message: "do the thing".to_string(),
            workspace: tmp.to_path_buf(),
            continue_conversation: false,
        }
    }

    #[test]
    fn invoke_returns_result_text() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(tmp.path(), r#"echo '{"result":"hello from tool"}'"#);
        let result = invoke(&req).unwrap();
        assert_eq!(result.text, "hello from tool");
    }

    #[test]
    fn invoke_failure_carries_exit_code_and_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(tmp.path(), "echo boom >&2; exit 3");
        let err = invoke(&req).unwrap_err();
        let drover_err = err.downcast::<DroverError>().unwrap();
        match drover_err {
            DroverError::Invocation { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invoke_failure_runs_the_tool_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("calls");
        let body = format!("echo ran >> {}; exit 1", marker.display());
        let req = request(tmp.path(), &body);

        assert!(invoke(&req).is_err());
        let calls = fs::read_to_string(&marker).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[test]
    fn invoke_rejects_malformed_output() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(tmp.path(), "echo not json at all");
        let err = invoke(&req).unwrap_err();
        let drover_err = err.downcast::<DroverError>().unwrap();
        assert!(matches!(drover_err, DroverError::MalformedOutput { .. }));
    }

    #[test]
    fn invoke_passes_normative_argv() {
        let tmp = tempfile::tempdir().unwrap();
        // Reflect the received argv back through the result field.
        let mut req = request(tmp.path(), r#"printf '{"result":"%s"}' "$*""#);
        req.continue_conversation = true;
        let result = invoke(&req).unwrap();
        assert_eq!(
            result.text,
            "-p do the thing --dangerously-skip-permissions --output-format json -c"
        );
    }

    #[test]
    fn invoke_runs_from_the_workspace_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(tmp.path(), r#"printf '{"result":"%s"}' "$PWD""#);
        let result = invoke(&req).unwrap();
        let dir_name = tmp.path().file_name().unwrap().to_string_lossy();
        assert!(result.text.contains(dir_name.as_ref()));
    }

    #[test]
    fn cancel_kills_a_running_invocation() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(tmp.path(), r#"sleep 30; echo '{"result":"late"}'"#);
        let cancel = Arc::new(AtomicBool::new(false));
        let child_slot = Arc::new(Mutex::new(None));

        let worker = {
            let cancel = Arc::clone(&cancel);
            let child_slot = Arc::clone(&child_slot);
            thread::spawn(move || invoke_cancellable(&req, &cancel, &child_slot))
        };

        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        cancel.store(true, Ordering::SeqCst);

        let outcome = worker.join().unwrap().unwrap();
        assert!(matches!(outcome, OneShotOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(child_slot.lock().unwrap().is_none());
    }
}
