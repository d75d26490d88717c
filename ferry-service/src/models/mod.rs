// Worker Data Models
// Events, projects, job declarations and execution-unit phases

pub mod event;
pub mod job;
pub mod phase;
pub mod project;

// Re-export key types
pub use event::{Cause, Event, LogLevel, Revision, Trigger, Worker, AFTER_EVENT, ERROR_EVENT};
pub use job::{
    validate_job_name, CacheConfig, Container, EnvValue, HostSpec, ImagePullPolicy, Job,
    ResourceSpec, Resources, StorageConfig, DEFAULT_SHELL, DEFAULT_TIMEOUT, MAX_JOB_NAME_LEN,
};
pub use phase::{Phase, UnitRef};
pub use project::{Project, Repository, SidecarConfig};
