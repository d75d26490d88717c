// Execution Events
// Progress reporting for jobs and lifecycle events of a worker run

use crate::models::Phase;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for run progress events
pub type ProgressSender = mpsc::UnboundedSender<JobEvent>;

/// Receiver for run progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<JobEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a run executes
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// An event (primary, after or error) was dispatched to its handler
    EventFired { source: String, event_type: String },

    /// Job execution started
    JobStarted { job_name: String },

    /// The job's execution unit was accepted by the orchestrator
    JobSubmitted { job_name: String, unit: String },

    /// Job reached a successful terminal phase
    JobCompleted {
        job_name: String,
        phase: Phase,
        duration: Duration,
    },

    /// Job failed, timed out or could not be submitted
    JobFailed {
        job_name: String,
        error: String,
        duration: Duration,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_name: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl JobEvent {
    pub fn event_fired(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self::EventFired {
            source: source.into(),
            event_type: event_type.into(),
        }
    }

    pub fn job_started(job_name: impl Into<String>) -> Self {
        Self::JobStarted {
            job_name: job_name.into(),
        }
    }

    pub fn job_submitted(job_name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::JobSubmitted {
            job_name: job_name.into(),
            unit: unit.into(),
        }
    }

    pub fn job_completed(job_name: impl Into<String>, phase: Phase, duration: Duration) -> Self {
        Self::JobCompleted {
            job_name: job_name.into(),
            phase,
            duration,
        }
    }

    pub fn job_failed(
        job_name: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::JobFailed {
            job_name: job_name.into(),
            error: error.into(),
            duration,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_name,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: JobEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: JobEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: JobEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
