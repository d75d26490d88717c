// Error Types
// One error enum per layer: construction, cluster access, observation, jobs, controller, config

use crate::models::Phase;

use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning a job declaration into cluster resources.
///
/// All of these are fatal and happen before anything is submitted.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid job name '{name}': {reason}")]
    InvalidJobName { name: String, reason: String },

    #[error("job '{job}': volume mount '{mount}' does not match any declared volume")]
    UnmatchedVolumeMount { job: String, mount: String },

    #[error("job '{job}': host path volume '{volume}' requires a project that allows host mounts")]
    HostMountDisallowed { job: String, volume: String },

    #[error("job '{job}': service account '{account}' does not match pattern '{pattern}'")]
    ServiceAccountRejected {
        job: String,
        account: String,
        pattern: String,
    },
}

/// Errors returned by the orchestrator or the worker API
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("cluster request failed: {0}")]
    Request(String),

    #[error("status stream failed: {0}")]
    Stream(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Errors from checking or creating a job cache volume
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("checking cache volume '{claim}' failed: {source}")]
    Check {
        claim: String,
        #[source]
        source: ClusterError,
    },

    #[error("creating cache volume '{claim}' failed: {source}")]
    Create {
        claim: String,
        #[source]
        source: ClusterError,
    },
}

/// Errors while observing a unit's status
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("status stream for '{unit}' was disrupted {attempts} times, giving up")]
    Disrupted { unit: String, attempts: u32 },

    #[error("status task for '{unit}' failed: {reason}")]
    Task { unit: String, reason: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Errors from running a job. Every variant names the job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("job '{job}': {source}")]
    Cache {
        job: String,
        #[source]
        source: CacheError,
    },

    #[error("job '{job}': orchestrator rejected the execution unit: {source}")]
    Scheduling {
        job: String,
        #[source]
        source: ClusterError,
    },

    #[error("job '{job}' finished in phase {phase}")]
    Failed { job: String, phase: Phase },

    #[error("job '{job}' timed out after {timeout:?}")]
    TimedOut { job: String, timeout: Duration },

    #[error("job '{job}': {source}")]
    Watch {
        job: String,
        #[source]
        source: WatchError,
    },

    #[error("job '{job}' has not been started")]
    NotStarted { job: String },
}

/// Run-level failures that abort before the event fires
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("loading project '{project}' failed: {source}")]
    ProjectLoad {
        project: String,
        #[source]
        source: ClusterError,
    },

    #[error("provisioning build volume for run '{run}' failed: {source}")]
    StorageProvision {
        run: String,
        #[source]
        source: ClusterError,
    },
}

/// Startup configuration and handler file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("invalid handler file: {0}")]
    Handlers(#[from] serde_yaml::Error),

    #[error(transparent)]
    InvalidJob(#[from] BuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_errors_name_the_job() {
        let errors = vec![
            JobError::Failed {
                job: "build".to_string(),
                phase: Phase::Failed,
            },
            JobError::TimedOut {
                job: "build".to_string(),
                timeout: Duration::from_secs(1),
            },
            JobError::Scheduling {
                job: "build".to_string(),
                source: ClusterError::Rejected("quota".to_string()),
            },
            JobError::Build(BuildError::UnmatchedVolumeMount {
                job: "build".to_string(),
                mount: "data".to_string(),
            }),
        ];

        for err in errors {
            assert!(err.to_string().contains("'build'"), "{}", err);
        }
    }
}
