// Execution Unit Phases
// Lifecycle states reported for a submitted unit, and the reference used to observe it

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[serde(alias = "STARTING")]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    SchedulingFailed,
    Aborted,
    Canceled,
    Unknown,
}

impl Phase {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Succeeded
                | Phase::Failed
                | Phase::TimedOut
                | Phase::SchedulingFailed
                | Phase::Aborted
                | Phase::Canceled
        )
    }

    /// Map a Kubernetes pod phase string
    pub fn from_pod_phase(phase: &str) -> Self {
        match phase {
            "Pending" => Phase::Pending,
            "Running" => Phase::Running,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            _ => Phase::Unknown,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::TimedOut => "TimedOut",
            Phase::SchedulingFailed => "SchedulingFailed",
            Phase::Aborted => "Aborted",
            Phase::Canceled => "Canceled",
            Phase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Reference to a submitted execution unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitRef {
    /// Namespace the unit lives in
    pub namespace: String,
    /// Resource name of the unit (pod name, or job name for the worker API)
    pub name: String,
    /// Job name, also the primary container name
    pub job: String,
    /// Event (run) the unit belongs to
    pub event_id: String,
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(!Phase::Unknown.is_terminal());
        assert!(Phase::Succeeded.is_terminal());
        assert!(Phase::SchedulingFailed.is_terminal());
        assert!(Phase::Canceled.is_terminal());
    }

    #[test]
    fn test_api_phase_wire_format() {
        let phase: Phase = serde_json::from_str("\"TIMED_OUT\"").unwrap();
        assert_eq!(phase, Phase::TimedOut);

        let starting: Phase = serde_json::from_str("\"STARTING\"").unwrap();
        assert_eq!(starting, Phase::Pending);
    }

    #[test]
    fn test_pod_phase_mapping() {
        assert_eq!(Phase::from_pod_phase("Succeeded"), Phase::Succeeded);
        assert_eq!(Phase::from_pod_phase("Evicted"), Phase::Unknown);
    }
}
