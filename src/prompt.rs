//! Prompt composition for control-loop steps.
//!
//! Everything produced here is sent to the assistant through the
//! terminal as one literal line, so every composer collapses whitespace
//! down to single spaces before returning.

/// Inputs shared by all step prompts.
#[derive(Debug, Clone)]
pub struct StepPromptContext<'a> {
    pub step_title: &'a str,
    /// House rules from configuration; may be empty.
    pub rules: &'a str,
    /// Whether the workspace has a CLAUDE.md the assistant will read.
    pub has_identity_file: bool,
}

/// First prompt for a step.
pub fn initial_prompt(ctx: &StepPromptContext) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Work on this step of the implementation plan: {}.",
        ctx.step_title
    ));
    push_context_clauses(&mut prompt, ctx);
    prompt.push_str(" Say explicitly when the step is fully done.");
    single_line(&prompt)
}

/// Follow-up after a failed evaluation. `detail` is the evaluator's
/// description of what went wrong; it may be empty.
pub fn fix_prompt(ctx: &StepPromptContext, detail: &str) -> String {
    let mut prompt = String::new();
    if detail.trim().is_empty() {
        prompt.push_str(&format!(
            "The last attempt at step '{}' did not complete cleanly.",
            ctx.step_title
        ));
    } else {
        prompt.push_str(&format!(
            "The last attempt at step '{}' did not complete cleanly: {}.",
            ctx.step_title, detail
        ));
    }
    prompt.push_str(" Fix what is broken and finish the step.");
    single_line(&prompt)
}

/// Alternative framing once repeated fixes have not worked. Worded as a
/// restart of the step rather than another patch on the failed attempt.
pub fn reframe_prompt(ctx: &StepPromptContext) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Step '{}' keeps failing. Set the current approach aside, rethink the step from \
         scratch, and implement it a different way.",
        ctx.step_title
    ));
    push_context_clauses(&mut prompt, ctx);
    prompt.push_str(" Say explicitly when the step is fully done.");
    single_line(&prompt)
}

fn push_context_clauses(prompt: &mut String, ctx: &StepPromptContext) {
    if ctx.has_identity_file {
        prompt.push_str(" Follow the project notes in CLAUDE.md.");
    }
    if !ctx.rules.trim().is_empty() {
        prompt.push_str(&format!(" House rules: {}.", ctx.rules));
    }
}

/// Collapse all whitespace runs (including newlines from multi-line
/// rules) into single spaces.
fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
