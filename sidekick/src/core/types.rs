//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between the scheduler, the worker
//! controller and the state store. They must not depend on external state or
//! I/O so they stay deterministic across runs.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority assigned to rows whose priority is missing or unparseable.
///
/// Malformed rows sink to the bottom of the queue instead of failing selection.
pub const DEFAULT_PRIORITY: i64 = 999;

/// Lifecycle status of a project, as labelled in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectStatus {
    Pending,
    Queued,
    #[serde(rename = "In Progress")]
    InProgress,
    Blocked,
    Completed,
    Paused,
}

impl ProjectStatus {
    /// Feed label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Pending => "Pending",
            ProjectStatus::Queued => "Queued",
            ProjectStatus::InProgress => "In Progress",
            ProjectStatus::Blocked => "Blocked",
            ProjectStatus::Completed => "Completed",
            ProjectStatus::Paused => "Paused",
        }
    }

    /// Parse a feed label. Unknown labels fall back to `Pending`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Queued" => ProjectStatus::Queued,
            "In Progress" => ProjectStatus::InProgress,
            "Blocked" => ProjectStatus::Blocked,
            "Completed" => ProjectStatus::Completed,
            "Paused" => ProjectStatus::Paused,
            _ => ProjectStatus::Pending,
        }
    }

    /// Statuses from which a project may be picked up.
    pub fn is_schedulable(self) -> bool {
        matches!(self, ProjectStatus::Pending | ProjectStatus::Queued)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work, built fresh from the feed on every poll.
///
/// The orchestrator never mutates a project in place; status changes go back
/// to the feed and show up on the next poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Join key against the feed. Unique within one poll.
    pub name: String,
    /// Lower is more urgent.
    pub priority: i64,
    pub status: ProjectStatus,
    /// Instruction handed to the worker. Empty means not actionable.
    pub next_action: String,
    /// Working directory for the worker. `None` means not actionable.
    pub directory: Option<PathBuf>,
    pub deadline: Option<String>,
    pub agent: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Project {
    /// True if the project may be handed to the worker this cycle.
    pub fn is_ready(&self) -> bool {
        self.status.is_schedulable()
            && self
                .directory
                .as_ref()
                .is_some_and(|dir| !dir.as_os_str().is_empty())
            && !self.next_action.trim().is_empty()
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (P{}): {}", self.name, self.priority, self.next_action)
    }
}

/// Kind of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryEventKind {
    Start,
    Completion,
    Error,
}

impl HistoryEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryEventKind::Start => "start",
            HistoryEventKind::Completion => "completion",
            HistoryEventKind::Error => "error",
        }
    }
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Serde readers for persisted timestamps that accept anything
/// [`parse_timestamp`] does. Writing stays RFC 3339.
pub mod lenient_timestamp {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(de)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}")))
    }

    pub fn deserialize_option<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(de)? {
            Some(raw) if !raw.trim().is_empty() => super::parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}"))),
            _ => Ok(None),
        }
    }
}

/// Entry in the bounded history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    #[serde(deserialize_with = "lenient_timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: HistoryEventKind,
    pub message: String,
    #[serde(default)]
    pub details: String,
}

/// Outcome of one worker session (success, failure or preemption).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub name: String,
    pub priority: i64,
    #[serde(deserialize_with = "lenient_timestamp::deserialize")]
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub details: String,
}

/// Persisted pointer to the project the worker was last started on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProject {
    pub name: String,
    pub priority: i64,
    #[serde(deserialize_with = "lenient_timestamp::deserialize")]
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::project;

    #[test]
    fn ready_requires_schedulable_status_directory_and_action() {
        assert!(project("a", 1).is_ready());

        let mut queued = project("q", 1);
        queued.status = ProjectStatus::Queued;
        assert!(queued.is_ready());

        for status in [
            ProjectStatus::InProgress,
            ProjectStatus::Blocked,
            ProjectStatus::Completed,
            ProjectStatus::Paused,
        ] {
            let mut p = project("s", 1);
            p.status = status;
            assert!(!p.is_ready(), "{status} must not be ready");
        }

        let mut no_dir = project("d", 1);
        no_dir.directory = None;
        assert!(!no_dir.is_ready());

        let mut empty_dir = project("e", 1);
        empty_dir.directory = Some(PathBuf::new());
        assert!(!empty_dir.is_ready());

        let mut blank_action = project("b", 1);
        blank_action.next_action = "   ".to_string();
        assert!(!blank_action.is_ready());
    }

    #[test]
    fn status_labels_round_trip_and_unknown_falls_back_to_pending() {
        for status in [
            ProjectStatus::Pending,
            ProjectStatus::Queued,
            ProjectStatus::InProgress,
            ProjectStatus::Blocked,
            ProjectStatus::Completed,
            ProjectStatus::Paused,
        ] {
            assert_eq!(ProjectStatus::from_label(status.as_str()), status);
        }
        assert_eq!(ProjectStatus::from_label("Someday"), ProjectStatus::Pending);
        assert_eq!(
            serde_json::to_string(&ProjectStatus::InProgress).expect("serialize"),
            "\"In Progress\""
        );
    }

    #[test]
    fn history_event_serializes_kind_as_type() {
        let event = HistoryEvent {
            timestamp: DateTime::from_timestamp(0, 0).expect("epoch"),
            kind: HistoryEventKind::Completion,
            message: "Completed: a".to_string(),
            details: String::new(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "completion");
    }

    #[test]
    fn timestamps_without_offset_are_utc() {
        let expected = DateTime::parse_from_rfc3339("2026-10-01T08:30:00Z")
            .expect("rfc3339")
            .with_timezone(&Utc);
        assert_eq!(parse_timestamp("2026-10-01T08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-10-01 08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-10-01T10:30:00+02:00"), Some(expected));
        assert!(parse_timestamp("2026-10-01T08:30:00.250000").is_some());
        assert_eq!(parse_timestamp("  "), None);
        assert_eq!(parse_timestamp("soon"), None);

        let event: HistoryEvent = serde_json::from_str(
            r#"{"timestamp":"2026-10-01T08:30:00","type":"start","message":"m"}"#,
        )
        .expect("naive timestamp accepted");
        assert_eq!(event.timestamp, expected);
        assert_eq!(
            serde_json::to_value(&event).expect("serialize")["timestamp"],
            "2026-10-01T08:30:00Z"
        );
    }
}
