//! Prompt text shared by both backends.

use serde::{Deserialize, Serialize};

use crate::spec::{StepSpec, TestSpec};

/// Fixed system prompt describing the Android control surface.
pub const SYSTEM_PROMPT: &str = "You control an Android device screen. Use the computer tool to progress. \
Actions map to Android input: click => tap(x,y), drag/scroll => swipe, type => input text, \
key => hardware key codes (HOME=3, BACK=4, ENTER=66). After each action you will receive a fresh screenshot. \
You will receive context that includes 'Goal', optional 'Hints', optional 'Suggestions', \
optional 'Negative prompt', and optional 'Success criteria'. Treat 'Suggestions' as strict guidance. \
Treat 'Negative prompt' as hard constraints and never perform forbidden actions.";

/// Closing instruction of every step context.
pub const END_TEST_INSTRUCTION: &str = "Instruction: Only when the Success criteria are satisfied, call the \
function tool end_test with {success: true}. If the goal is clearly impossible, call end_test with \
{success: false} and a reason. Otherwise continue working and do not call end_test.";

/// Sent with a new screenshot when the previous turn produced no tool call.
pub const CONTINUE_NOTE: &str = "No action was executed. Observe the screen and continue toward the goal.";

/// Name of the termination tool exposed to both backends.
pub const END_TEST_TOOL: &str = "end_test";

pub const END_TEST_DESCRIPTION: &str = "Signal the end of the current step. Call with success=true only \
after the goal and success criteria are satisfied; success=false gives up on the step.";

/// Guidance for the step currently being worked on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub goal: String,
    pub hints: Vec<String>,
    pub suggestions: String,
    pub negative_prompt: String,
    pub success_criteria: String,
}

impl TaskContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }

    /// Context for one step, with the test's shared hints.
    pub fn for_step(spec: &TestSpec, step: &StepSpec) -> Self {
        Self {
            goal: step.goal.trim().to_string(),
            hints: spec.hints.clone(),
            suggestions: step.suggestions.trim().to_string(),
            negative_prompt: step.negative_prompt.trim().to_string(),
            success_criteria: step.success_criteria.trim().to_string(),
        }
    }

    pub fn success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    /// The user-facing context block. Empty sections are omitted.
    pub fn render(&self) -> String {
        let mut text = format!("Goal: {}", self.goal);
        if !self.hints.is_empty() {
            text.push_str("\nHints: ");
            text.push_str(&self.hints.join(" | "));
        }
        if !self.suggestions.is_empty() {
            text.push_str("\nSuggestions: ");
            text.push_str(&self.suggestions);
        }
        if !self.negative_prompt.is_empty() {
            text.push_str("\nNegative prompt (DO NOT do): ");
            text.push_str(&self.negative_prompt);
        }
        if !self.success_criteria.is_empty() {
            text.push_str("\nSuccess criteria: ");
            text.push_str(&self.success_criteria);
        }
        text.push('\n');
        text.push_str(END_TEST_INSTRUCTION);
        text
    }
}

/// Summary of recent turns for backends that keep no transcript.
pub fn recent_turns_block(recent: &[String]) -> Option<String> {
    if recent.is_empty() {
        return None;
    }
    let mut text = String::from("Recent turns (oldest first):");
    for line in recent {
        text.push_str("\n- ");
        text.push_str(line);
    }
    Some(text)
}
