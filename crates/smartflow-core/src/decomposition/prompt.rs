//! Prompt rendering for decomposition requests
//!
//! Pure and deterministic: the same request always renders to the same
//! bytes. Nothing time- or session-dependent goes into a prompt.

use std::fmt::Write as _;

use super::error::DecompositionError;
use super::request::{DecompositionRequest, Granularity};
use super::result::MAX_TITLE_CHARS;
use crate::llm::Message;

/// Longest slice of a bad response echoed back in a strict re-request
const MAX_ECHOED_OUTPUT_CHARS: usize = 2_000;

const SYSTEM_PROMPT: &str = "\
You are an expert task planner. Break the user's task into executable subtasks.

Rules:
1. Every subtask must be independent, concrete, and actionable.
2. Subtask titles must be specific and must not repeat the main task.
3. List subtasks in the order they should be executed.
4. Estimate durations in whole minutes.
5. Respond with a single JSON object and nothing else: no prose, no markdown fences.

JSON schema:
{
  \"main_task\": string,            // one-line summary of the whole task
  \"description\": string,          // what done looks like
  \"estimated_duration\": integer,  // total minutes
  \"priority\": number,             // 0 (trivial) to 10 (urgent)
  \"subtasks\": [
    {\"title\": string, \"description\": string, \"order\": integer, \"estimated_minutes\": integer}
  ]
}";

/// A rendered model prompt: system instructions plus the user turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Renders decomposition requests into model prompts
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Render the prompt for a request
    pub fn build(&self, request: &DecompositionRequest) -> Result<Prompt, DecompositionError> {
        request.preferences().validate()?;

        Ok(Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user: self.render_task(request),
        })
    }

    /// Render the single repair prompt sent after malformed output
    pub fn build_strict(
        &self,
        request: &DecompositionRequest,
        previous_output: &str,
    ) -> Result<Prompt, DecompositionError> {
        let mut prompt = self.build(request)?;

        let echoed: String = previous_output
            .chars()
            .take(MAX_ECHOED_OUTPUT_CHARS)
            .collect();
        let _ = write!(
            prompt.user,
            "\n\nYour previous answer could not be parsed:\n---\n{}\n---\n\
             Answer again with ONLY the JSON object described in the schema. \
             Do not wrap it in markdown, do not add commentary, and make sure \
             it is valid JSON with double-quoted keys and no trailing commas.",
            echoed.trim()
        );
        Ok(prompt)
    }

    fn render_task(&self, request: &DecompositionRequest) -> String {
        let prefs = request.preferences();
        let mut user = String::new();

        let _ = writeln!(user, "Task: {}", request.description().trim());
        let _ = writeln!(user);
        let _ = writeln!(
            user,
            "Produce at most {} ordered subtasks. Never exceed {}.",
            prefs.max_subtasks, prefs.max_subtasks
        );
        let _ = writeln!(
            user,
            "Keep each subtask title under {} characters.",
            MAX_TITLE_CHARS
        );
        let _ = writeln!(user, "{}", granularity_instruction(prefs.granularity));

        if !prefs.focus_areas.is_empty() {
            let areas = prefs
                .focus_areas
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                user,
                "Where it fits naturally, give extra attention to: {}. \
                 These are preferences, not requirements.",
                areas
            );
        }

        user.trim_end().to_string()
    }
}

fn granularity_instruction(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Coarse => {
            "Granularity: coarse. Merge similar or closely related steps into a few larger milestones."
        }
        Granularity::Balanced => {
            "Granularity: balanced. Each subtask should be a meaningful unit of work of roughly similar size."
        }
        Granularity::Fine => {
            "Granularity: fine. Expand the work into small, concrete actions that can each be done in one sitting."
        }
    }
}
