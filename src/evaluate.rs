//! Step evaluation: decide what the control loop does after each
//! monitoring phase.
//!
//! Two built-in evaluators. `PromptIdleEvaluator` trusts the terminal:
//! a step is complete when the assistant is back at its prompt.
//! `OneShotJudge` makes a single stateless call to the assistant CLI
//! with the captured output and asks it for a verdict.

use std::path::Path;
use tracing::{debug, warn};

use crate::config::{DroverConfig, EvaluatorMode};
use crate::oneshot::{self, InvokeRequest};
use crate::plan::Step;

/// How the monitoring phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    AwaitingInput,
    ErrorDetected,
    Stalled,
    TimedOut,
}

impl MonitorSignal {
    pub fn describe(&self) -> &'static str {
        match self {
            MonitorSignal::AwaitingInput => "the assistant is idle at its input prompt",
            MonitorSignal::ErrorDetected => "the terminal shows an error",
            MonitorSignal::Stalled => "the terminal stopped changing before the step finished",
            MonitorSignal::TimedOut => "the step ran past its time limit",
        }
    }
}

/// Verdict on one attempt at a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalDecision {
    /// The step is done; advance the plan.
    Complete,
    /// Not done; send a fix prompt carrying this detail.
    NeedsFix(String),
    /// Patching is not working; reframe the step from scratch.
    NeedsNewApproach,
    /// Stop the run and hand the step to a human.
    Escalate(String),
}

pub trait StepEvaluator: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(
        &self,
        workspace: &Path,
        step: &Step,
        output: &str,
        signal: MonitorSignal,
    ) -> EvalDecision;
}

/// Pick the evaluator the configuration asks for.
pub fn from_config(config: &DroverConfig) -> Box<dyn StepEvaluator> {
    match config.evaluator.mode {
        EvaluatorMode::PromptIdle => Box::new(PromptIdleEvaluator),
        EvaluatorMode::Judge => Box::new(OneShotJudge::new(&config.evaluator.judge_program)),
    }
}

/// The default evaluator: back-at-the-prompt means done, everything
/// else needs fixing. Inherits the accuracy limits of the
/// awaiting-input heuristic.
pub struct PromptIdleEvaluator;

impl StepEvaluator for PromptIdleEvaluator {
    fn name(&self) -> &'static str {
        "prompt-idle"
    }

    fn evaluate(
        &self,
        _workspace: &Path,
        _step: &Step,
        _output: &str,
        signal: MonitorSignal,
    ) -> EvalDecision {
        match signal {
            MonitorSignal::AwaitingInput => EvalDecision::Complete,
            MonitorSignal::ErrorDetected => {
                EvalDecision::NeedsFix("the terminal shows an error".to_string())
            }
            MonitorSignal::Stalled => {
                EvalDecision::NeedsFix("the session went quiet without finishing".to_string())
            }
            MonitorSignal::TimedOut => {
                EvalDecision::NeedsFix("the step ran out of time without finishing".to_string())
            }
        }
    }
}

const OUTPUT_SNIPPET_MAX: usize = 4000;

/// Evaluator that asks the assistant CLI itself. One stateless call per
/// evaluation, run from the workspace so the judge can read project
/// files; the reply must lead with a fixed verdict keyword.
pub struct OneShotJudge {
    program: String,
}

impl OneShotJudge {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl StepEvaluator for OneShotJudge {
    fn name(&self) -> &'static str {
        "judge"
    }

    fn evaluate(
        &self,
        workspace: &Path,
        step: &Step,
        output: &str,
        signal: MonitorSignal,
    ) -> EvalDecision {
        let prompt = compose_judge_prompt(&step.title, output, signal);
        let request = InvokeRequest {
            program: self.program.clone(),
            message: prompt,
            workspace: workspace.to_path_buf(),
            continue_conversation: false,
        };
        match oneshot::invoke(&request) {
            Ok(result) => {
                debug!(verdict = %result.text.lines().next().unwrap_or(""), "judge replied");
                parse_verdict(&result.text)
            }
            Err(e) => {
                warn!("judge invocation failed: {e:#}");
                EvalDecision::Escalate(format!("judge invocation failed: {e}"))
            }
        }
    }
}

/// Compose the verdict request sent to the judge.
fn compose_judge_prompt(step_title: &str, output: &str, signal: MonitorSignal) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are reviewing one step of an automated coding run. A terminal-driven \
         assistant was asked to complete the step below; you see the tail of its \
         terminal output and how the monitoring phase ended.\n\n",
    );
    prompt.push_str(&format!("## Step\n\n{step_title}\n\n"));
    prompt.push_str(&format!("## Monitor outcome\n\n{}\n\n", signal.describe()));
    prompt.push_str("## Terminal output (tail)\n\n");
    prompt.push_str(tail(output, OUTPUT_SNIPPET_MAX));
    prompt.push_str("\n\n");
    prompt.push_str(
        "Respond with EXACTLY one of:\n\
         DONE\n\
         RETRY: <one line describing what to fix>\n\
         REFRAME\n\
         ESCALATE: <one line reason a human is needed>",
    );
    prompt
}

/// Map the judge's reply onto a decision. Anything that does not lead
/// with a known verdict escalates; guessing here would let a chatty
/// judge drive the loop.
fn parse_verdict(reply: &str) -> EvalDecision {
    let first = reply
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_matches('*')
        .trim_matches('`')
        .trim();

    if first == "DONE" {
        return EvalDecision::Complete;
    }
    if let Some(rest) = first.strip_prefix("RETRY:") {
        return EvalDecision::NeedsFix(rest.trim().to_string());
    }
    if first == "RETRY" {
        return EvalDecision::NeedsFix(String::new());
    }
    if first == "REFRAME" {
        return EvalDecision::NeedsNewApproach;
    }
    if let Some(rest) = first.strip_prefix("ESCALATE:") {
        return EvalDecision::Escalate(rest.trim().to_string());
    }
    EvalDecision::Escalate(format!("unrecognized judge verdict: {first}"))
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
