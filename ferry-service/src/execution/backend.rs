// Job Backends
// Where jobs are submitted and observed: cluster pods, the worker API, or nowhere

use crate::api::WorkerApiClient;
use crate::builder::ExecutionUnitBuilder;
use crate::cache::{CacheStatus, CacheVolumeManager};
use crate::cluster::Cluster;
use crate::error::{JobError, WatchError};
use crate::models::{Event, Job, Phase, Project, UnitRef};
use crate::watcher::StatusWatcher;

use async_trait::async_trait;
use std::sync::Arc;

/// Event and project a run's jobs are scheduled for
#[derive(Debug, Clone)]
pub struct RunScope {
    pub event: Event,
    pub project: Project,
}

impl RunScope {
    pub fn new(event: Event, project: Project) -> Self {
        Self { event, project }
    }
}

/// Submits jobs and observes them to completion
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Create everything the job needs and start it
    async fn submit(&self, job: &Job, scope: &RunScope) -> Result<UnitRef, JobError>;

    /// Wait for the job's final phase (or [`Phase::TimedOut`])
    async fn observe(&self, job: &Job, unit: &UnitRef) -> Result<Phase, JobError>;

    async fn logs(&self, unit: &UnitRef) -> Result<String, JobError>;
}

fn watch_error(job: &str) -> impl FnOnce(WatchError) -> JobError + '_ {
    move |source| JobError::Watch {
        job: job.to_string(),
        source,
    }
}

/// Runs jobs as pods on the cluster
pub struct PodBackend {
    builder: ExecutionUnitBuilder,
    cluster: Arc<dyn Cluster>,
    caches: CacheVolumeManager,
    watcher: Arc<dyn StatusWatcher>,
}

impl PodBackend {
    pub fn new(
        builder: ExecutionUnitBuilder,
        cluster: Arc<dyn Cluster>,
        watcher: Arc<dyn StatusWatcher>,
    ) -> Self {
        Self {
            builder,
            caches: CacheVolumeManager::new(cluster.clone()),
            cluster,
            watcher,
        }
    }
}

#[async_trait]
impl JobBackend for PodBackend {
    async fn submit(&self, job: &Job, scope: &RunScope) -> Result<UnitRef, JobError> {
        let unit = self.builder.build(job, &scope.event, &scope.project)?;

        // Cache claims must exist before any of the unit's resources
        if let Some(claim) = &unit.cache_claim {
            let status = self
                .caches
                .ensure(claim)
                .await
                .map_err(|source| JobError::Cache {
                    job: job.name.clone(),
                    source,
                })?;
            if status == CacheStatus::Created {
                tracing::info!(job = %job.name, "created cache volume for job");
            }
        }

        let scheduling = |source| JobError::Scheduling {
            job: job.name.clone(),
            source,
        };
        self.cluster
            .create_secret(&unit.secret)
            .await
            .map_err(scheduling)?;
        self.cluster.create_pod(&unit.pod).await.map_err(scheduling)?;

        tracing::info!(job = %job.name, unit = %unit.name, "submitted execution unit");
        Ok(unit.unit_ref())
    }

    async fn observe(&self, job: &Job, unit: &UnitRef) -> Result<Phase, JobError> {
        self.watcher
            .observe(unit, job.timeout, job.fallible)
            .await
            .map_err(watch_error(&job.name))
    }

    async fn logs(&self, unit: &UnitRef) -> Result<String, JobError> {
        self.watcher
            .fetch_logs(unit)
            .await
            .map_err(watch_error(&unit.job))
    }
}

/// Delegates jobs to the worker API, which owns the cluster resources
pub struct ApiBackend {
    client: Arc<WorkerApiClient>,
    watcher: Arc<dyn StatusWatcher>,
}

impl ApiBackend {
    pub fn new(client: Arc<WorkerApiClient>, watcher: Arc<dyn StatusWatcher>) -> Self {
        Self { client, watcher }
    }
}

#[async_trait]
impl JobBackend for ApiBackend {
    async fn submit(&self, job: &Job, scope: &RunScope) -> Result<UnitRef, JobError> {
        job.validate()?;
        self.client
            .create_job(&scope.event.id, job)
            .await
            .map_err(|source| JobError::Scheduling {
                job: job.name.clone(),
                source,
            })?;

        Ok(UnitRef {
            namespace: scope.project.namespace.clone(),
            name: job.name.clone(),
            job: job.name.clone(),
            event_id: scope.event.id.clone(),
        })
    }

    async fn observe(&self, job: &Job, unit: &UnitRef) -> Result<Phase, JobError> {
        self.watcher
            .observe(unit, job.timeout, job.fallible)
            .await
            .map_err(watch_error(&job.name))
    }

    async fn logs(&self, unit: &UnitRef) -> Result<String, JobError> {
        self.watcher
            .fetch_logs(unit)
            .await
            .map_err(watch_error(&unit.job))
    }
}

/// Accepts every valid job and reports it succeeded without running it
#[derive(Debug, Default)]
pub struct NoopBackend;

#[async_trait]
impl JobBackend for NoopBackend {
    async fn submit(&self, job: &Job, scope: &RunScope) -> Result<UnitRef, JobError> {
        job.validate()?;
        tracing::info!(job = %job.name, "noop backend: skipping submission");
        Ok(UnitRef {
            namespace: scope.project.namespace.clone(),
            name: job.name.clone(),
            job: job.name.clone(),
            event_id: scope.event.id.clone(),
        })
    }

    async fn observe(&self, _job: &Job, _unit: &UnitRef) -> Result<Phase, JobError> {
        Ok(Phase::Succeeded)
    }

    async fn logs(&self, _unit: &UnitRef) -> Result<String, JobError> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildOptions;
    use crate::cluster::MemoryCluster;
    use crate::error::CacheError;
    use crate::watcher::PollWatcher;
    use std::time::Duration;

    fn scope() -> RunScope {
        RunScope::new(
            Event::new("run1", "github", "push"),
            Project::new("p1", "org/repo").with_namespace("ci"),
        )
    }

    fn backend(cluster: &Arc<MemoryCluster>) -> PodBackend {
        let watcher = PollWatcher::new(cluster.clone(), cluster.clone())
            .with_interval(Duration::from_millis(5));
        PodBackend::new(
            ExecutionUnitBuilder::new(BuildOptions::default()),
            cluster.clone(),
            Arc::new(watcher),
        )
    }

    fn cached_job() -> Job {
        let mut job = Job::new("build", "alpine").with_tasks(["make"]);
        job.cache.enabled = true;
        job
    }

    #[tokio::test]
    async fn test_submit_creates_cache_before_unit() {
        let cluster = Arc::new(MemoryCluster::succeeding());
        let unit = backend(&cluster).submit(&cached_job(), &scope()).await.unwrap();

        assert_eq!(unit.name, "build-run1");
        assert_eq!(
            cluster.operations(),
            vec![
                "claim:org-repo-build".to_string(),
                "secret:build-run1".to_string(),
                "pod:build-run1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cache_check_failure_creates_nothing() {
        let cluster = Arc::new(MemoryCluster::succeeding());
        cluster.fail_claim_reads("apiserver unavailable");

        let err = backend(&cluster)
            .submit(&cached_job(), &scope())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Cache {
                source: CacheError::Check { .. },
                ..
            }
        ));
        assert!(cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_pod_is_scheduling_error() {
        let cluster = Arc::new(MemoryCluster::succeeding());
        cluster.reject_pods("exceeded quota");

        let err = backend(&cluster)
            .submit(&Job::new("build", "alpine"), &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Scheduling { ref job, .. } if job == "build"));
    }

    #[tokio::test]
    async fn test_noop_backend_validates_names() {
        let err = NoopBackend
            .submit(&Job::new("Bad_Name", "alpine"), &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Build(_)));
    }
}
