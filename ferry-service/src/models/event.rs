// Event Models
// The triggering event a worker run is driven by, plus the synthetic after/error causes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Event type fired exactly once after the primary handler completes
pub const AFTER_EVENT: &str = "after";

/// Event type fired at most once when handler code fails
pub const ERROR_EVENT: &str = "error";

/// An event received from the upstream trigger system.
///
/// Events are immutable once received; the controller consumes exactly one per run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event id, also used as the run id
    pub id: String,

    /// Event source (e.g. "github", "cron")
    pub source: String,

    /// Event type (e.g. "push", "pull_request")
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub short_title: Option<String>,

    #[serde(default)]
    pub long_title: Option<String>,

    /// Opaque payload as delivered by the trigger
    #[serde(default)]
    pub payload: Option<String>,

    /// Source revision the event refers to
    #[serde(default)]
    pub revision: Option<Revision>,

    /// Worker descriptor
    #[serde(default)]
    pub worker: Worker,

    /// Set only on synthetic after/error events
    #[serde(skip)]
    pub cause: Option<Cause>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_revision(mut self, commit: Option<String>, git_ref: Option<String>) -> Self {
        self.revision = Some(Revision { commit, git_ref });
        self
    }

    /// Run id used to name per-run resources
    pub fn run_id(&self) -> &str {
        &self.id
    }

    /// Commit id of the revision, if any
    pub fn commit(&self) -> Option<&str> {
        self.revision.as_ref().and_then(|r| r.commit.as_deref())
    }

    /// Derive a synthetic lifecycle event (after/error) from this event
    pub fn derive(&self, event_type: &str, cause: Cause) -> Event {
        let mut derived = self.clone();
        derived.event_type = event_type.to_string();
        derived.cause = Some(cause);
        derived
    }
}

/// Source revision information
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Revision {
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
}

/// Worker block of the event descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Worker {
    pub api_address: Option<String>,
    pub api_token: Option<String>,
    pub config_files_directory: String,
    pub default_config_files: HashMap<String, String>,
    pub log_level: LogLevel,
}

impl Default for Worker {
    fn default() -> Self {
        Self {
            api_address: None,
            api_token: None,
            config_files_directory: ".ferry".to_string(),
            default_config_files: HashMap::new(),
            log_level: LogLevel::Info,
        }
    }
}

/// Worker log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "DEBUG")]
    Debug,
    #[default]
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARN")]
    Warn,
    #[serde(alias = "ERROR")]
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// What caused a synthetic after/error event
#[derive(Debug, Clone, PartialEq)]
pub struct Cause {
    /// The original triggering event
    pub event: Box<Event>,
    /// Failure reason (None on success)
    pub reason: Option<String>,
    pub trigger: Trigger,
}

/// Mechanism that produced a cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Primary handler work completed successfully
    Success,
    /// Handler returned an error or panicked
    Handler,
    /// A background task spawned through the run context failed
    Background,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Success => write!(f, "success"),
            Trigger::Handler => write!(f, "handler"),
            Trigger::Background => write!(f, "background"),
        }
    }
}
