//! Prompt rendering for agent and validator runs.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::completion::marker_for;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");
const VALIDATOR_TEMPLATE: &str = include_str!("prompts/validator.md");

/// Inputs for one iteration's prompt.
#[derive(Debug, Clone, Default)]
pub struct IterationPrompt<'a> {
    pub task: &'a str,
    pub workdir: &'a str,
    pub iteration: u32,
    /// Shown only when the caller set a maximum.
    pub ceiling: Option<u32>,
    pub notes_path: &'a str,
    pub marker_text: &'a str,
    pub fresh_start: bool,
    pub pending_context: Option<&'a str>,
    pub validator_feedback: Option<&'a str>,
    pub hints: &'a [String],
}

/// Inputs for a validator pass: the task and the agent's own notes only.
#[derive(Debug, Clone, Default)]
pub struct ValidatorPrompt<'a> {
    pub task: &'a str,
    pub workdir: &'a str,
    pub notes: &'a str,
    pub marker_text: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("iteration", ITERATION_TEMPLATE)
            .expect("iteration template should be valid");
        env.add_template("validator", VALIDATOR_TEMPLATE)
            .expect("validator template should be valid");
        Self { env }
    }

    pub fn render_iteration(&self, input: &IterationPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("iteration")?;
        let rendered = template.render(context! {
            task => input.task.trim(),
            workdir => input.workdir,
            iteration => input.iteration,
            ceiling => input.ceiling,
            notes_path => input.notes_path,
            marker => marker_for(input.marker_text),
            fresh_start => input.fresh_start,
            pending_context => non_blank(input.pending_context),
            validator_feedback => non_blank(input.validator_feedback),
            hints => input.hints,
        })?;
        Ok(rendered)
    }

    pub fn render_validator(&self, input: &ValidatorPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("validator")?;
        let rendered = template.render(context! {
            task => input.task.trim(),
            workdir => input.workdir,
            notes => non_blank(Some(input.notes)),
            marker => marker_for(input.marker_text),
        })?;
        Ok(rendered)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base<'a>(hints: &'a [String]) -> IterationPrompt<'a> {
        IterationPrompt {
            task: "Fix the flaky test",
            workdir: "/repo",
            iteration: 2,
            ceiling: Some(10),
            notes_path: "/state/sessions/s1/notes.md",
            marker_text: "COMPLETE",
            hints,
            ..IterationPrompt::default()
        }
    }

    #[test]
    fn iteration_prompt_carries_task_marker_and_notes() {
        let prompt = PromptEngine::new()
            .render_iteration(&base(&[]))
            .expect("render");
        assert!(prompt.contains("Fix the flaky test"));
        assert!(prompt.contains("iteration 2 of at most 10"));
        assert!(prompt.contains("<promise>COMPLETE</promise>"));
        assert!(prompt.contains("/state/sessions/s1/notes.md"));
        assert!(!prompt.contains("Operator note"));
        assert!(!prompt.contains("Reviewer feedback"));
        assert!(!prompt.contains("cleared"));
    }

    #[test]
    fn optional_sections_appear_in_order() {
        let hints = vec!["The last 3 iterations changed no files.".to_string()];
        let mut input = base(&hints);
        input.pending_context = Some("use the staging db");
        input.validator_feedback = Some("tests still fail");
        input.fresh_start = true;
        let prompt = PromptEngine::new().render_iteration(&input).expect("render");

        let op = prompt.find("use the staging db").expect("operator note");
        let review = prompt.find("tests still fail").expect("feedback");
        let hint = prompt.find("changed no files").expect("hint");
        let done = prompt.find("## Completion").expect("completion");
        assert!(op < review && review < hint && hint < done);
        assert!(prompt.contains("cleared"));
    }

    #[test]
    fn validator_prompt_uses_notes_and_custom_marker() {
        let prompt = PromptEngine::new()
            .render_validator(&ValidatorPrompt {
                task: "Ship it",
                workdir: "/repo",
                notes: "  ",
                marker_text: "DONE",
            })
            .expect("render");
        assert!(prompt.contains("Ship it"));
        assert!(prompt.contains("left no notes"));
        assert!(prompt.contains("<promise>DONE</promise>"));
    }
}
