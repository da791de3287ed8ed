//! Session phase machine and outcome.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a run session.
///
/// State machine:
/// ```text
/// Init ──► Building ──► Running ──► Succeeded
///   │         │            │
///   │         ├────────────┴──────► Failed
///   │         └────────────┴──────► Cancelled
///   └──────────────────────────────► Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Init,
    Building,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionPhase {
    /// No further transitions happen from a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Succeeded | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }

    /// Check if transition to target phase is valid.
    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, target),
            (Init, Building)
                | (Init, Running)
                | (Init, Failed)
                | (Init, Cancelled)
                | (Building, Running)
                | (Building, Failed)
                | (Building, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Init => "init",
            SessionPhase::Building => "building",
            SessionPhase::Running => "running",
            SessionPhase::Succeeded => "succeeded",
            SessionPhase::Failed => "failed",
            SessionPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a session, published exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    /// Terminal phase.
    pub phase: SessionPhase,
    /// 0 when no failure was latched, 1 otherwise.
    pub exit_code: i32,
    /// First failure recorded during the session.
    pub failure: Option<String>,
    pub build_exit_code: Option<i32>,
    pub run_exit_code: Option<i32>,
    pub run_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Wall time from start to the published outcome.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionPhase::*;

    const ALL: [SessionPhase; 6] = [Init, Building, Running, Succeeded, Failed, Cancelled];

    #[test]
    fn test_terminal_phases_have_no_transitions() {
        for from in ALL.iter().filter(|p| p.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_build_never_follows_run() {
        assert!(!Running.can_transition_to(Building));
        assert!(Building.can_transition_to(Running));
        assert!(Init.can_transition_to(Running));
    }

    #[test]
    fn test_cancelled_only_from_non_terminal() {
        assert!(Building.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Succeeded.can_transition_to(Cancelled));
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(Building.to_string(), "building");
    }
}
