//! Prompt rendering for the worker's first input.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::Project;

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");

#[derive(Debug, Serialize)]
struct ProjectContext<'a> {
    name: &'a str,
    next_action: &'a str,
    deadline: Option<&'a str>,
}

/// Render the prompt handed to the agent when work on `project` begins.
pub fn render_worker_prompt(project: &Project) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("worker", WORKER_TEMPLATE)
        .context("load worker prompt template")?;
    let template = env.get_template("worker")?;
    let rendered = template
        .render(context! {
            project => ProjectContext {
                name: &project.name,
                next_action: project.next_action.trim(),
                deadline: project
                    .deadline
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty()),
            },
        })
        .with_context(|| format!("render worker prompt for {}", project.name))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::project;

    #[test]
    fn prompt_names_project_action_and_deadline() {
        let mut p = project("Alpha", 1);
        p.next_action = "Write the migration".to_string();
        p.deadline = Some("2026-11-01".to_string());

        let prompt = render_worker_prompt(&p).expect("render");
        assert_eq!(
            prompt,
            "Project: Alpha\n\nNext Action: Write the migration\nDeadline: 2026-11-01\n\n\
             Please work on the next action. When complete, provide a summary of what \
             was done and suggest the next action.\n"
        );
    }

    #[test]
    fn blank_deadline_is_omitted() {
        let mut p = project("Beta", 2);
        p.deadline = Some("  ".to_string());

        let prompt = render_worker_prompt(&p).expect("render");
        assert!(!prompt.contains("Deadline"));
        assert!(prompt.starts_with("Project: Beta\n\nNext Action: Do something\n\nPlease"));
    }
}
