// Runnables
// The unit of work handlers compose: a scheduled job, or a group of runnables

use super::backend::{JobBackend, RunScope};
use super::events::{EventSender, JobEvent, ProgressSender};
use crate::error::JobError;
use crate::models::{Job, Phase, UnitRef};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Anything that can be run to completion as part of a handler
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), JobError>;
}

/// A job bound to the run it belongs to and the backend that executes it
pub struct ScheduledJob {
    job: Job,
    scope: Arc<RunScope>,
    backend: Arc<dyn JobBackend>,
    progress: Option<ProgressSender>,
    unit: Mutex<Option<UnitRef>>,
}

impl ScheduledJob {
    pub fn new(job: Job, scope: Arc<RunScope>, backend: Arc<dyn JobBackend>) -> Self {
        Self {
            job,
            scope,
            backend,
            progress: None,
            unit: Mutex::new(None),
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSender>) -> Self {
        self.progress = progress;
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The submitted unit, once `run` got that far
    pub fn unit(&self) -> Option<UnitRef> {
        self.unit.lock().ok().and_then(|unit| unit.clone())
    }

    /// Logs of the submitted unit
    pub async fn logs(&self) -> Result<String, JobError> {
        let unit = self.unit().ok_or_else(|| JobError::NotStarted {
            job: self.job.name.clone(),
        })?;
        self.backend.logs(&unit).await
    }

    async fn execute(&self) -> Result<Phase, JobError> {
        let unit = self.backend.submit(&self.job, &self.scope).await?;
        if let Ok(mut slot) = self.unit.lock() {
            *slot = Some(unit.clone());
        }
        self.progress
            .send_event(JobEvent::job_submitted(&self.job.name, unit.to_string()));

        match self.backend.observe(&self.job, &unit).await? {
            Phase::Succeeded => Ok(Phase::Succeeded),
            Phase::TimedOut => Err(JobError::TimedOut {
                job: self.job.name.clone(),
                timeout: self.job.timeout,
            }),
            phase => Err(JobError::Failed {
                job: self.job.name.clone(),
                phase,
            }),
        }
    }
}

#[async_trait]
impl Runnable for ScheduledJob {
    fn name(&self) -> &str {
        &self.job.name
    }

    async fn run(&self) -> Result<(), JobError> {
        let start = Instant::now();
        tracing::info!(job = %self.job.name, image = %self.job.container.image, "starting job");
        self.progress.send_event(JobEvent::job_started(&self.job.name));

        match self.execute().await {
            Ok(phase) => {
                tracing::info!(job = %self.job.name, "job succeeded");
                self.progress
                    .send_event(JobEvent::job_completed(&self.job.name, phase, start.elapsed()));
                Ok(())
            }
            Err(err) => {
                tracing::error!(job = %self.job.name, error = %err, "job failed");
                self.progress.send_event(JobEvent::job_failed(
                    &self.job.name,
                    err.to_string(),
                    start.elapsed(),
                ));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::execution::backend::NoopBackend;
    use crate::execution::events::progress_channel;
    use crate::execution::PodBackend;
    use crate::builder::ExecutionUnitBuilder;
    use crate::models::{Event, Project};
    use crate::watcher::PollWatcher;
    use std::time::Duration;

    fn scope() -> Arc<RunScope> {
        Arc::new(RunScope::new(
            Event::new("run1", "github", "push"),
            Project::new("p1", "org/repo"),
        ))
    }

    fn pod_backend(cluster: &Arc<MemoryCluster>) -> Arc<dyn JobBackend> {
        let watcher = PollWatcher::new(cluster.clone(), cluster.clone())
            .with_interval(Duration::from_millis(5));
        Arc::new(PodBackend::new(
            ExecutionUnitBuilder::default(),
            cluster.clone(),
            Arc::new(watcher),
        ))
    }

    #[tokio::test]
    async fn test_successful_job_reports_progress() {
        let (tx, mut rx) = progress_channel();
        let job = ScheduledJob::new(Job::new("build", "alpine"), scope(), Arc::new(NoopBackend))
            .with_progress(Some(tx));

        job.run().await.unwrap();
        assert!(job.unit().is_some());

        assert!(matches!(rx.recv().await, Some(JobEvent::JobStarted { .. })));
        assert!(matches!(rx.recv().await, Some(JobEvent::JobSubmitted { .. })));
        assert!(matches!(rx.recv().await, Some(JobEvent::JobCompleted { .. })));
    }

    #[tokio::test]
    async fn test_failed_phase_is_error() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.script_phases("build-run1", [Phase::Running, Phase::Failed]);
        let job = ScheduledJob::new(Job::new("build", "alpine"), scope(), pod_backend(&cluster));

        let err = job.run().await.unwrap_err();
        assert!(matches!(err, JobError::Failed { phase: Phase::Failed, .. }));
    }

    #[tokio::test]
    async fn test_timeout_fails_even_when_fallible() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.script_phases("build-run1", [Phase::Running]);
        let spec = Job::new("build", "alpine")
            .with_timeout(Duration::from_millis(30))
            .fallible();
        let job = ScheduledJob::new(spec, scope(), pod_backend(&cluster));

        let err = job.run().await.unwrap_err();
        assert!(matches!(err, JobError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_logs_require_a_started_job() {
        let cluster = Arc::new(MemoryCluster::succeeding());
        cluster.set_logs("build-run1", "ok\n");
        let job = ScheduledJob::new(Job::new("build", "alpine"), scope(), pod_backend(&cluster));

        assert!(matches!(job.logs().await, Err(JobError::NotStarted { .. })));
        job.run().await.unwrap();
        assert_eq!(job.logs().await.unwrap(), "ok\n");
    }
}
