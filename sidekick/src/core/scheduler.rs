//! Deterministic priority selection and preemption checks.

use tracing::{debug, info};

use crate::core::types::Project;

/// Pick the ready project with the lowest priority value.
///
/// Ties resolve to the project that appears first in feed order. Returns
/// `None` when nothing is ready.
pub fn select_next(projects: &[Project]) -> Option<&Project> {
    // `min_by_key` returns the first of several equal minima.
    let selected = projects
        .iter()
        .filter(|p| p.is_ready())
        .min_by_key(|p| p.priority);

    match selected {
        Some(project) => debug!(
            name = %project.name,
            priority = project.priority,
            "selected next project"
        ),
        None => debug!("no ready projects"),
    }
    selected
}

/// True if a ready project outranks `current` strictly.
///
/// Equal priority never preempts, so equally ranked projects do not oscillate.
pub fn should_preempt(current: &Project, projects: &[Project]) -> bool {
    let Some(next) = select_next(projects) else {
        return false;
    };
    if next.priority < current.priority {
        info!(
            next = %next.name,
            next_priority = next.priority,
            current = %current.name,
            current_priority = current.priority,
            "higher priority project ready"
        );
        return true;
    }
    false
}
