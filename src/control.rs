//! The control loop: drive a workspace's plan through a terminal
//! session, one step at a time.
//!
//! Each step runs as send → monitor → evaluate. The monitor phase polls
//! the captured pane until the classifier reports a decision point (or
//! the step stalls or times out), then the configured [`StepEvaluator`]
//! decides whether to advance, retry with a fix prompt, reframe the
//! step, or escalate to a human. Session operations go through the
//! [`SessionDriver`] trait so the whole loop is testable without a tmux
//! server.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{self, Classification};
use crate::config::DroverConfig;
use crate::error::DroverError;
use crate::evaluate::{self, EvalDecision, MonitorSignal, StepEvaluator};
use crate::plan::{Plan, RunState, Step};
use crate::prompt::{self, StepPromptContext};
use crate::runlog::{RunEvent, RunLog};
use crate::tmux;
use crate::workspace::Workspace;

/// Session operations the loop needs. The default implementation talks
/// to tmux; tests substitute a scripted fake.
pub trait SessionDriver: Send + Sync + 'static {
    fn create(&self, session: &str, work_dir: &Path) -> Result<(), DroverError>;
    fn exists(&self, session: &str) -> bool;
    fn send_line(&self, session: &str, text: &str) -> Result<(), DroverError>;
    fn send_interrupt(&self, session: &str) -> Result<(), DroverError>;
    fn capture(&self, session: &str, lines: u32) -> String;
    fn kill(&self, session: &str);
}

#[derive(Debug, Default, Clone)]
pub struct TmuxDriver;

impl SessionDriver for TmuxDriver {
    fn create(&self, session: &str, work_dir: &Path) -> Result<(), DroverError> {
        tmux::create_session(session, work_dir)
    }

    fn exists(&self, session: &str) -> bool {
        tmux::session_exists(session)
    }

    fn send_line(&self, session: &str, text: &str) -> Result<(), DroverError> {
        tmux::send_line(session, text)
    }

    fn send_interrupt(&self, session: &str) -> Result<(), DroverError> {
        tmux::send_interrupt(session)
    }

    fn capture(&self, session: &str, lines: u32) -> String {
        tmux::capture_pane(session, lines)
    }

    fn kill(&self, session: &str) {
        tmux::kill_session(session)
    }
}

/// Loop timings, lifted out of the config so tests can shrink them to
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct LoopTimings {
    pub poll_interval: Duration,
    pub step_timeout: Duration,
    pub stall_threshold: Duration,
    pub startup_delay: Duration,
}

impl LoopTimings {
    pub fn from_config(config: &DroverConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.monitor.poll_interval_secs),
            step_timeout: Duration::from_secs(config.monitor.step_timeout_secs),
            stall_threshold: Duration::from_secs(config.monitor.stall_threshold_secs),
            startup_delay: Duration::from_secs(config.agent.startup_delay_secs),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step is done.
    Completed,
    /// The loop gave up on a step and wants a human.
    Escalated { step_index: usize, reason: String },
    /// A stop request was observed; the plan is paused.
    Stopped,
}

enum StepOutcome {
    Completed,
    Escalated(String),
    Stopped,
}

pub struct ControlLoop<D: SessionDriver = TmuxDriver> {
    driver: D,
    workspace: Workspace,
    config: DroverConfig,
    timings: LoopTimings,
    evaluator: Box<dyn StepEvaluator>,
    stop: Arc<AtomicBool>,
    run_id: Uuid,
    log: RunLog,
}

impl<D: SessionDriver> ControlLoop<D> {
    pub fn new(
        workspace: Workspace,
        config: &DroverConfig,
        run_id: Uuid,
        stop: Arc<AtomicBool>,
        driver: D,
    ) -> Result<Self> {
        let log = RunLog::create_in(&workspace.logs_dir())?;
        Ok(Self {
            driver,
            timings: LoopTimings::from_config(config),
            evaluator: evaluate::from_config(config),
            config: config.clone(),
            workspace,
            stop,
            run_id,
            log,
        })
    }

    pub fn with_timings(mut self, timings: LoopTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn StepEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Drive the workspace's plan to a terminal state. On an
    /// infrastructure error the plan is marked failed before the error
    /// propagates.
    pub fn run(&self) -> Result<RunOutcome> {
        match self.run_inner() {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let _ = self.log.log(RunEvent::RunFailed {
                    reason: format!("{e:#}"),
                });
                if let Ok(mut plan) = Plan::load(&self.workspace.plan_path()) {
                    plan.state = RunState::Failed;
                    let _ = plan.save(&self.workspace.plan_path());
                }
                Err(e)
            }
        }
    }

    fn run_inner(&self) -> Result<RunOutcome> {
        let plan_path = self.workspace.plan_path();
        let mut plan = Plan::load(&plan_path)?;
        if plan.steps.is_empty() {
            bail!(
                "plan at {} has no steps; add steps before running",
                plan_path.display()
            );
        }
        if plan.is_complete() {
            plan.state = RunState::Completed;
            plan.save(&plan_path)?;
            info!("plan already complete, nothing to run");
            return Ok(RunOutcome::Completed);
        }

        plan.state = RunState::Running;
        plan.escalation = None;
        plan.save(&plan_path)?;

        let session = self.workspace.session_name();
        self.log.log(RunEvent::RunStarted {
            run_id: self.run_id.to_string(),
            session: session.clone(),
            steps: plan.steps.len(),
            evaluator: self.evaluator.name().to_string(),
        })?;

        if self.stopped() {
            let index = plan.current_index().unwrap_or(0);
            return self.pause_run(&mut plan, index);
        }

        if self.driver.exists(&session) {
            info!(session = %session, "reusing live session");
        } else {
            self.launch(&session)?;
        }

        while let Some(index) = plan.current_index() {
            if self.stopped() {
                return self.pause_run(&mut plan, index);
            }

            plan.begin_step(index)?;
            plan.save(&plan_path)?;
            let step = plan.steps[index].clone();
            info!(step = index, title = %step.title, "step started");
            self.log.log(RunEvent::StepStarted {
                index,
                title: step.title.clone(),
            })?;

            match self.drive_step(&session, index, &step)? {
                StepOutcome::Completed => {
                    plan.complete_step(index)?;
                    plan.save(&plan_path)?;
                    info!(step = index, title = %step.title, "step completed");
                    self.log.log(RunEvent::StepCompleted {
                        index,
                        title: step.title.clone(),
                    })?;
                }
                StepOutcome::Escalated(reason) => {
                    plan.state = RunState::Escalated;
                    plan.escalation = Some(reason.clone());
                    plan.save(&plan_path)?;
                    warn!(step = index, reason = %reason, "run escalated");
                    self.log.log(RunEvent::RunEscalated {
                        index,
                        reason: reason.clone(),
                    })?;
                    return Ok(RunOutcome::Escalated {
                        step_index: index,
                        reason,
                    });
                }
                StepOutcome::Stopped => return self.pause_run(&mut plan, index),
            }
        }

        plan.state = RunState::Completed;
        plan.save(&plan_path)?;
        info!(steps = plan.done_count(), "run completed");
        self.log.log(RunEvent::RunCompleted {
            steps_done: plan.done_count(),
        })?;
        Ok(RunOutcome::Completed)
    }

    /// One step, through as many attempts as the retry policy allows.
    fn drive_step(&self, session: &str, index: usize, step: &Step) -> Result<StepOutcome> {
        let ctx = StepPromptContext {
            step_title: &step.title,
            rules: &self.config.agent.rules,
            has_identity_file: self.workspace.has_identity(),
        };

        let mut consecutive_errors = 0u32;
        let mut reframed = false;
        let mut prompt = prompt::initial_prompt(&ctx);
        let mut kind = "initial";

        loop {
            if self.stopped() {
                return Ok(StepOutcome::Stopped);
            }

            self.send_prompt(session, index, kind, &prompt)?;

            let Some((signal, output)) = self.monitor(session, index, &prompt)? else {
                return Ok(StepOutcome::Stopped);
            };
            self.log.log(RunEvent::MonitorEnded {
                index,
                signal: signal_label(signal).to_string(),
            })?;

            if self.stopped() {
                return Ok(StepOutcome::Stopped);
            }

            let decision = self
                .evaluator
                .evaluate(self.workspace.root(), step, &output, signal);
            debug!(step = index, decision = ?decision, "evaluated");
            self.log.log(RunEvent::Evaluated {
                index,
                decision: decision_label(&decision).to_string(),
                detail: decision_detail(&decision),
            })?;

            match decision {
                EvalDecision::Complete => return Ok(StepOutcome::Completed),
                EvalDecision::NeedsFix(detail) => {
                    consecutive_errors += 1;
                    if consecutive_errors < self.config.run.max_retries {
                        prompt = prompt::fix_prompt(&ctx, &detail);
                        kind = "fix";
                        continue;
                    }
                    if reframed {
                        return Ok(StepOutcome::Escalated(
                            "the step failed repeatedly even after a fresh approach".to_string(),
                        ));
                    }
                    reframed = true;
                    consecutive_errors = 0;
                    prompt = prompt::reframe_prompt(&ctx);
                    kind = "reframe";
                }
                EvalDecision::NeedsNewApproach => {
                    if reframed {
                        return Ok(StepOutcome::Escalated(
                            "the step failed repeatedly even after a fresh approach".to_string(),
                        ));
                    }
                    reframed = true;
                    consecutive_errors = 0;
                    prompt = prompt::reframe_prompt(&ctx);
                    kind = "reframe";
                }
                EvalDecision::Escalate(reason) => return Ok(StepOutcome::Escalated(reason)),
            }
        }
    }

    /// Poll the pane until something decidable happens. Returns `None`
    /// when a stop request interrupts the phase.
    ///
    /// A dead session is recreated in place: relaunch the agent, resend
    /// only the last-sent prompt, reset the timers. The plan never sees
    /// the crash.
    fn monitor(
        &self,
        session: &str,
        index: usize,
        last_prompt: &str,
    ) -> Result<Option<(MonitorSignal, String)>> {
        let mut last_capture = String::new();
        let mut monitor_start = Instant::now();
        let mut last_change = Instant::now();

        loop {
            if self.stopped() {
                return Ok(None);
            }

            if !self.driver.exists(session) {
                warn!(session = session, "session died mid-step, recovering");
                self.launch(session)?;
                self.driver.send_line(session, last_prompt)?;
                self.log.log(RunEvent::SessionRestarted {
                    session: session.to_string(),
                    prompt_resent: true,
                })?;
                last_capture.clear();
                monitor_start = Instant::now();
                last_change = Instant::now();
                continue;
            }

            let current = self.driver.capture(session, self.config.monitor.capture_lines);
            match classify::classify(&last_capture, &current) {
                Classification::AwaitingInput => {
                    return Ok(Some((MonitorSignal::AwaitingInput, current)));
                }
                Classification::ErrorDetected => {
                    return Ok(Some((MonitorSignal::ErrorDetected, current)));
                }
                Classification::Changed => {
                    last_change = Instant::now();
                    last_capture = current.clone();
                }
                Classification::Unchanged => {
                    if last_change.elapsed() >= self.timings.stall_threshold {
                        // Break whatever is wedged before the evaluator sees the output.
                        let _ = self.driver.send_interrupt(session);
                        self.log.log(RunEvent::StallInterrupted { index })?;
                        return Ok(Some((MonitorSignal::Stalled, current)));
                    }
                }
            }

            if monitor_start.elapsed() >= self.timings.step_timeout {
                return Ok(Some((MonitorSignal::TimedOut, current)));
            }

            self.pause(self.timings.poll_interval);
        }
    }

    fn send_prompt(&self, session: &str, index: usize, kind: &str, prompt: &str) -> Result<()> {
        match self.driver.send_line(session, prompt) {
            Ok(()) => {}
            Err(DroverError::SessionNotFound { .. }) => {
                warn!(session = session, "session vanished before the prompt went out, recovering");
                self.launch(session)?;
                self.log.log(RunEvent::SessionRestarted {
                    session: session.to_string(),
                    prompt_resent: false,
                })?;
                self.driver.send_line(session, prompt)?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(step = index, kind = kind, chars = prompt.len(), "prompt sent");
        self.log.log(RunEvent::PromptSent {
            index,
            kind: kind.to_string(),
            prompt: prompt.to_string(),
        })?;
        Ok(())
    }

    /// Create the session, launch the interactive assistant in it, and
    /// give it time to draw its UI before anything is sent.
    fn launch(&self, session: &str) -> Result<()> {
        self.driver
            .create(session, self.workspace.root())
            .with_context(|| format!("failed to create session '{session}'"))?;
        self.driver
            .send_line(session, &self.config.agent.program)
            .with_context(|| format!("failed to launch '{}'", self.config.agent.program))?;
        self.log.log(RunEvent::AgentLaunched {
            session: session.to_string(),
            program: self.config.agent.program.clone(),
        })?;
        self.pause(self.timings.startup_delay);
        Ok(())
    }

    fn pause_run(&self, plan: &mut Plan, index: usize) -> Result<RunOutcome> {
        plan.state = RunState::Paused;
        plan.save(&self.workspace.plan_path())?;
        info!(step = index, "run stopped");
        self.log.log(RunEvent::RunStopped { index })?;
        Ok(RunOutcome::Stopped)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep in small slices so a stop request does not wait out a full
    /// poll interval or startup delay.
    fn pause(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() && !self.stopped() {
            let slice = remaining.min(Duration::from_millis(50));
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

fn signal_label(signal: MonitorSignal) -> &'static str {
    match signal {
        MonitorSignal::AwaitingInput => "awaiting_input",
        MonitorSignal::ErrorDetected => "error_detected",
        MonitorSignal::Stalled => "stalled",
        MonitorSignal::TimedOut => "timed_out",
    }
}

fn decision_label(decision: &EvalDecision) -> &'static str {
    match decision {
        EvalDecision::Complete => "complete",
        EvalDecision::NeedsFix(_) => "needs_fix",
        EvalDecision::NeedsNewApproach => "needs_new_approach",
        EvalDecision::Escalate(_) => "escalate",
    }
}

fn decision_detail(decision: &EvalDecision) -> String {
    match decision {
        EvalDecision::NeedsFix(detail) => detail.clone(),
        EvalDecision::Escalate(reason) => reason.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const AWAITING: &str = "step looks finished\n\u{276f}";
    const WORKING: &str = "compiling module one of three";

    /// Scripted session driver. Captures come from a queue; the last
    /// one repeats once the queue drains. `die_after_captures` flips
    /// the session dead after the Nth capture to exercise recovery.
    struct FakeDriver {
        state: Mutex<FakeState>,
    }

    struct FakeState {
        alive: bool,
        creates: u32,
        interrupts: u32,
        sent: Vec<String>,
        captures: VecDeque<String>,
        last_capture: String,
        capture_count: u32,
        die_after_captures: Option<u32>,
    }

    impl FakeDriver {
        fn new(captures: Vec<&str>) -> Self {
            Self {
                state: Mutex::new(FakeState {
                    alive: false,
                    creates: 0,
                    interrupts: 0,
                    sent: Vec::new(),
                    captures: captures.into_iter().map(String::from).collect(),
                    last_capture: String::new(),
                    capture_count: 0,
                    die_after_captures: None,
                }),
            }
        }

        fn dying_after(captures: Vec<&str>, n: u32) -> Self {
            let driver = Self::new(captures);
            driver.state.lock().unwrap().die_after_captures = Some(n);
            driver
        }

        fn sent(&self) -> Vec<String> {
            self.state.lock().unwrap().sent.clone()
        }

        fn creates(&self) -> u32 {
            self.state.lock().unwrap().creates
        }

        fn interrupts(&self) -> u32 {
            self.state.lock().unwrap().interrupts
        }

        fn alive(&self) -> bool {
            self.state.lock().unwrap().alive
        }
    }

    impl SessionDriver for Arc<FakeDriver> {
        fn create(&self, _session: &str, _work_dir: &Path) -> Result<(), DroverError> {
            let mut state = self.state.lock().unwrap();
            state.alive = true;
            state.creates += 1;
            Ok(())
        }

        fn exists(&self, _session: &str) -> bool {
            self.state.lock().unwrap().alive
        }

        fn send_line(&self, session: &str, text: &str) -> Result<(), DroverError> {
            let mut state = self.state.lock().unwrap();
            if !state.alive {
                return Err(DroverError::SessionNotFound {
                    name: session.to_string(),
                });
            }
            state.sent.push(text.to_string());
            Ok(())
        }

        fn send_interrupt(&self, _session: &str) -> Result<(), DroverError> {
            self.state.lock().unwrap().interrupts += 1;
            Ok(())
        }

        fn capture(&self, _session: &str, _lines: u32) -> String {
            let mut state = self.state.lock().unwrap();
            if let Some(next) = state.captures.pop_front() {
                state.last_capture = next;
            }
            state.capture_count += 1;
            if let Some(n) = state.die_after_captures {
                if state.capture_count >= n {
                    state.alive = false;
                    state.die_after_captures = None;
                }
            }
            state.last_capture.clone()
        }

        fn kill(&self, _session: &str) {
            self.state.lock().unwrap().alive = false;
        }
    }

    /// Evaluator that replays a script of decisions and records the
    /// monitor signals it was shown.
    struct ScriptedEvaluator {
        decisions: Mutex<VecDeque<EvalDecision>>,
        signals: Mutex<Vec<MonitorSignal>>,
    }

    impl ScriptedEvaluator {
        fn new(decisions: Vec<EvalDecision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: Mutex::new(decisions.into()),
                signals: Mutex::new(Vec::new()),
            })
        }

        fn signals(&self) -> Vec<MonitorSignal> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl StepEvaluator for Arc<ScriptedEvaluator> {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn evaluate(
            &self,
            _workspace: &Path,
            _step: &Step,
            _output: &str,
            signal: MonitorSignal,
        ) -> EvalDecision {
            self.signals.lock().unwrap().push(signal);
            self.decisions
                .lock()
                .unwrap()
                .pop_front()
                .expect("evaluator script exhausted")
        }
    }

    fn fast_timings() -> LoopTimings {
        LoopTimings {
            poll_interval: Duration::from_millis(2),
            step_timeout: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(10),
            startup_delay: Duration::ZERO,
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        workspace: Workspace,
        driver: Arc<FakeDriver>,
        evaluator: Arc<ScriptedEvaluator>,
        stop: Arc<AtomicBool>,
    }

    impl Harness {
        fn new(titles: Vec<&str>, driver: FakeDriver, decisions: Vec<EvalDecision>) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let workspace = Workspace::new(tmp.path());
            let plan = Plan::from_titles(titles);
            plan.save(&workspace.plan_path()).unwrap();
            Self {
                _tmp: tmp,
                workspace,
                driver: Arc::new(driver),
                evaluator: ScriptedEvaluator::new(decisions),
                stop: Arc::new(AtomicBool::new(false)),
            }
        }

        fn control_loop(&self) -> ControlLoop<Arc<FakeDriver>> {
            self.control_loop_with(fast_timings(), DroverConfig::default())
        }

        fn control_loop_with(
            &self,
            timings: LoopTimings,
            config: DroverConfig,
        ) -> ControlLoop<Arc<FakeDriver>> {
            ControlLoop::new(
                self.workspace.clone(),
                &config,
                Uuid::new_v4(),
                Arc::clone(&self.stop),
                Arc::clone(&self.driver),
            )
            .unwrap()
            .with_timings(timings)
            .with_evaluator(Box::new(Arc::clone(&self.evaluator)))
        }

        fn plan(&self) -> Plan {
            Plan::load(&self.workspace.plan_path()).unwrap()
        }
    }

    #[test]
    fn three_step_plan_runs_to_completion() {
        let harness = Harness::new(
            vec!["scaffold", "implement", "test"],
            FakeDriver::new(vec![AWAITING]),
            vec![
                EvalDecision::Complete,
                EvalDecision::Complete,
                EvalDecision::Complete,
            ],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let plan = harness.plan();
        assert_eq!(plan.state, RunState::Completed);
        assert!(plan.is_complete());
        assert_eq!(plan.done_count(), 3);

        // One launch of the agent program, then one prompt per step.
        let sent = harness.driver.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], "claude");
        assert!(sent[1].contains("scaffold"));
        assert!(sent[2].contains("implement"));
        assert!(sent[3].contains("test"));
        assert_eq!(harness.driver.creates(), 1);
    }

    #[test]
    fn retries_then_reframes_then_completes() {
        let harness = Harness::new(
            vec!["make the tests pass"],
            FakeDriver::new(vec![AWAITING]),
            vec![
                EvalDecision::NeedsFix("tests fail".to_string()),
                EvalDecision::NeedsFix("tests fail".to_string()),
                EvalDecision::NeedsFix("tests fail".to_string()),
                EvalDecision::Complete,
            ],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        // launch, initial, two fixes inside the retry ceiling, then the
        // reframe that finally lands.
        let sent = harness.driver.sent();
        assert_eq!(sent.len(), 5);
        assert!(sent[1].contains("Work on this step"));
        assert!(sent[2].contains("did not complete cleanly: tests fail"));
        assert!(sent[3].contains("did not complete cleanly: tests fail"));
        assert!(sent[4].contains("rethink the step from scratch"));

        assert_eq!(harness.plan().state, RunState::Completed);
    }

    #[test]
    fn reframe_exhausted_escalates_and_leaves_session_alive() {
        let harness = Harness::new(
            vec!["port the parser"],
            FakeDriver::new(vec![AWAITING]),
            vec![EvalDecision::NeedsNewApproach, EvalDecision::NeedsNewApproach],
        );

        let outcome = harness.control_loop().run().unwrap();
        match outcome {
            RunOutcome::Escalated { step_index, reason } => {
                assert_eq!(step_index, 0);
                assert!(reason.contains("fresh approach"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let plan = harness.plan();
        assert_eq!(plan.state, RunState::Escalated);
        assert!(plan.escalation.is_some());
        assert_eq!(plan.done_count(), 0);
        assert!(harness.driver.alive());
    }

    #[test]
    fn evaluator_escalation_stops_without_advancing() {
        let harness = Harness::new(
            vec!["deploy"],
            FakeDriver::new(vec![AWAITING]),
            vec![EvalDecision::Escalate("needs credentials".to_string())],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Escalated {
                step_index: 0,
                reason: "needs credentials".to_string()
            }
        );

        let plan = harness.plan();
        assert_eq!(plan.done_count(), 0);
        assert_eq!(plan.escalation.as_deref(), Some("needs credentials"));
    }

    #[test]
    fn stall_sends_interrupt_without_recreating_the_session() {
        let harness = Harness::new(
            vec!["long build"],
            FakeDriver::new(vec![WORKING]),
            vec![EvalDecision::Complete],
        );

        let timings = LoopTimings {
            poll_interval: Duration::from_millis(2),
            step_timeout: Duration::from_secs(10),
            stall_threshold: Duration::from_millis(30),
            startup_delay: Duration::ZERO,
        };
        let outcome = harness
            .control_loop_with(timings, DroverConfig::default())
            .run()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(harness.driver.interrupts(), 1);
        assert_eq!(harness.driver.creates(), 1);
        assert_eq!(harness.evaluator.signals(), vec![MonitorSignal::Stalled]);
    }

    #[test]
    fn timeout_signal_reaches_the_evaluator() {
        let harness = Harness::new(
            vec!["slow step"],
            FakeDriver::new(vec![WORKING]),
            vec![EvalDecision::Complete],
        );

        let timings = LoopTimings {
            poll_interval: Duration::from_millis(2),
            step_timeout: Duration::from_millis(30),
            stall_threshold: Duration::from_secs(10),
            startup_delay: Duration::ZERO,
        };
        let outcome = harness
            .control_loop_with(timings, DroverConfig::default())
            .run()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(harness.driver.interrupts(), 0);
        assert_eq!(harness.evaluator.signals(), vec![MonitorSignal::TimedOut]);
    }

    #[test]
    fn error_output_reaches_the_evaluator_as_an_error_signal() {
        let harness = Harness::new(
            vec!["wire the parser"],
            FakeDriver::new(vec!["error: no such file", AWAITING]),
            vec![
                EvalDecision::NeedsFix("the terminal shows an error".to_string()),
                EvalDecision::Complete,
            ],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(
            harness.evaluator.signals(),
            vec![MonitorSignal::ErrorDetected, MonitorSignal::AwaitingInput]
        );
        let sent = harness.driver.sent();
        assert!(sent[2].contains("did not complete cleanly"));
    }

    #[test]
    fn dead_session_mid_monitor_is_recreated_and_prompt_resent() {
        let harness = Harness::new(
            vec!["refactor"],
            FakeDriver::dying_after(vec![WORKING, WORKING, AWAITING], 2),
            vec![EvalDecision::Complete],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let sent = harness.driver.sent();
        // launch, prompt, relaunch after the crash, the same prompt again.
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], "claude");
        assert_eq!(sent[2], "claude");
        assert_eq!(sent[3], sent[1]);
        assert_eq!(harness.driver.creates(), 2);

        // Transparent to the plan.
        assert_eq!(harness.plan().done_count(), 1);
    }

    #[test]
    fn dead_session_at_send_time_resends_the_pending_prompt() {
        // The session dies right after the first capture, so the fix
        // prompt hits a missing session and must trigger a relaunch.
        let harness = Harness::new(
            vec!["refactor"],
            FakeDriver::dying_after(vec![AWAITING], 1),
            vec![
                EvalDecision::NeedsFix("half done".to_string()),
                EvalDecision::Complete,
            ],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let sent = harness.driver.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], "claude");
        assert!(sent[1].contains("Work on this step"));
        assert_eq!(sent[2], "claude");
        assert!(sent[3].contains("half done"), "resent prompt must be the fix");
        assert_eq!(harness.driver.creates(), 2);
    }

    #[test]
    fn stop_flag_pauses_before_any_prompt() {
        let harness = Harness::new(
            vec!["step one"],
            FakeDriver::new(vec![AWAITING]),
            vec![],
        );
        harness.stop.store(true, Ordering::SeqCst);

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        let plan = harness.plan();
        assert_eq!(plan.state, RunState::Paused);
        assert_eq!(plan.done_count(), 0);
        assert!(harness.driver.sent().is_empty());
    }

    #[test]
    fn stop_after_evaluation_pauses_instead_of_retrying() {
        let harness = Harness::new(
            vec!["step one"],
            FakeDriver::new(vec![AWAITING]),
            vec![EvalDecision::NeedsFix("not yet".to_string())],
        );

        struct StopAfterFirst {
            inner: Arc<ScriptedEvaluator>,
            stop: Arc<AtomicBool>,
        }
        impl StepEvaluator for StopAfterFirst {
            fn name(&self) -> &'static str {
                "scripted"
            }
            fn evaluate(
                &self,
                workspace: &Path,
                step: &Step,
                output: &str,
                signal: MonitorSignal,
            ) -> EvalDecision {
                let decision = self.inner.evaluate(workspace, step, output, signal);
                self.stop.store(true, Ordering::SeqCst);
                decision
            }
        }

        let control = harness.control_loop().with_evaluator(Box::new(StopAfterFirst {
            inner: Arc::clone(&harness.evaluator),
            stop: Arc::clone(&harness.stop),
        }));

        let outcome = control.run().unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        // launch plus the initial prompt only; the fix was never sent.
        assert_eq!(harness.driver.sent().len(), 2);
        assert_eq!(harness.plan().state, RunState::Paused);
    }

    #[test]
    fn completed_plan_returns_immediately_without_a_session() {
        let harness = Harness::new(vec!["only step"], FakeDriver::new(vec![]), vec![]);
        {
            let mut plan = harness.plan();
            plan.begin_step(0).unwrap();
            plan.complete_step(0).unwrap();
            plan.save(&harness.workspace.plan_path()).unwrap();
        }

        let outcome = harness.control_loop().run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(harness.driver.creates(), 0);
        assert_eq!(harness.plan().state, RunState::Completed);
    }

    #[test]
    fn empty_plan_is_an_error_and_marks_the_plan_failed() {
        let harness = Harness::new(vec![], FakeDriver::new(vec![]), vec![]);

        let err = harness.control_loop().run().unwrap_err();
        assert!(err.to_string().contains("has no steps"));
        assert_eq!(harness.plan().state, RunState::Failed);
    }

    #[test]
    fn escalated_run_resumes_at_the_same_step() {
        let harness = Harness::new(
            vec!["first", "second"],
            FakeDriver::new(vec![AWAITING]),
            vec![EvalDecision::Escalate("stuck".to_string())],
        );

        let outcome = harness.control_loop().run().unwrap();
        assert!(matches!(outcome, RunOutcome::Escalated { step_index: 0, .. }));

        // Resume with a cooperative evaluator: both steps finish and
        // the stale escalation reason is cleared.
        let resumed = ScriptedEvaluator::new(vec![EvalDecision::Complete, EvalDecision::Complete]);
        let control = harness
            .control_loop()
            .with_evaluator(Box::new(Arc::clone(&resumed)));
        let outcome = control.run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let plan = harness.plan();
        assert_eq!(plan.state, RunState::Completed);
        assert!(plan.escalation.is_none());
        assert_eq!(plan.done_count(), 2);
    }

    #[test]
    fn run_log_records_the_lifecycle() {
        let harness = Harness::new(
            vec!["one step"],
            FakeDriver::new(vec![AWAITING]),
            vec![EvalDecision::Complete],
        );

        let control = harness.control_loop();
        let log_path = control.log_path().to_path_buf();
        control.run().unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("\"event\":\"run_started\""));
        assert!(content.contains("\"event\":\"agent_launched\""));
        assert!(content.contains("\"event\":\"prompt_sent\""));
        assert!(content.contains("\"event\":\"monitor_ended\""));
        assert!(content.contains("\"event\":\"evaluated\""));
        assert!(content.contains("\"event\":\"step_completed\""));
        assert!(content.contains("\"event\":\"run_completed\""));
    }

    #[test]
    fn timings_come_from_the_config() {
        let mut config = DroverConfig::default();
        config.monitor.poll_interval_secs = 7;
        config.monitor.step_timeout_secs = 120;
        config.monitor.stall_threshold_secs = 90;
        config.agent.startup_delay_secs = 3;

        let timings = LoopTimings::from_config(&config);
        assert_eq!(timings.poll_interval, Duration::from_secs(7));
        assert_eq!(timings.step_timeout, Duration::from_secs(120));
        assert_eq!(timings.stall_threshold, Duration::from_secs(90));
        assert_eq!(timings.startup_delay, Duration::from_secs(3));
    }
}
