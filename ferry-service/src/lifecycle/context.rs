// Run Context
// What a handler sees of the run: the event, the project, job scheduling and tracked background work

use crate::execution::{JobBackend, ProgressSender, RunScope, ScheduledJob};
use crate::models::{Event, Job, Project};

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Handle given to every handler invocation of a run
#[derive(Clone)]
pub struct RunContext {
    scope: Arc<RunScope>,
    backend: Arc<dyn JobBackend>,
    progress: Option<ProgressSender>,
    background: Arc<Mutex<Vec<JoinHandle<anyhow::Result<()>>>>>,
}

impl RunContext {
    pub fn new(
        scope: Arc<RunScope>,
        backend: Arc<dyn JobBackend>,
        progress: Option<ProgressSender>,
    ) -> Self {
        Self {
            scope,
            backend,
            progress,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn event(&self) -> &Event {
        &self.scope.event
    }

    pub fn project(&self) -> &Project {
        &self.scope.project
    }

    /// Bind a job to this run
    pub fn job(&self, job: Job) -> Arc<ScheduledJob> {
        Arc::new(
            ScheduledJob::new(job, self.scope.clone(), self.backend.clone())
                .with_progress(self.progress.clone()),
        )
    }

    /// Run `work` in the background; the run waits for it and treats its failure as a handler error
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        match self.background.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Wait for all background work, including work spawned while waiting.
    ///
    /// Returns one message per failed task.
    pub async fn join_background(&self) -> Vec<String> {
        let mut failures = Vec::new();
        loop {
            let batch: Vec<_> = match self.background.lock() {
                Ok(mut tasks) => tasks.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            };
            if batch.is_empty() {
                return failures;
            }

            for handle in batch {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failures.push(format!("{:#}", err)),
                    Err(join) if join.is_panic() => {
                        failures.push(format!("background task panicked: {}", panic_message(join)))
                    }
                    Err(join) => failures.push(join.to_string()),
                }
            }
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(join: tokio::task::JoinError) -> String {
    let payload = join.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::NoopBackend;

    fn context() -> RunContext {
        RunContext::new(
            Arc::new(RunScope::new(
                Event::new("run1", "github", "push"),
                Project::new("p1", "org/repo"),
            )),
            Arc::new(NoopBackend),
            None,
        )
    }

    #[tokio::test]
    async fn test_join_background_collects_failures() {
        let ctx = context();
        ctx.spawn(async { Ok(()) });
        ctx.spawn(async { anyhow::bail!("upload failed") });

        let failures = ctx.join_background().await;
        assert_eq!(failures, vec!["upload failed".to_string()]);
        assert!(ctx.join_background().await.is_empty());
    }

    #[tokio::test]
    async fn test_join_background_waits_for_nested_spawns() {
        let ctx = context();
        let inner = ctx.clone();
        ctx.spawn(async move {
            inner.spawn(async { anyhow::bail!("nested") });
            Ok(())
        });

        let failures = ctx.join_background().await;
        assert_eq!(failures, vec!["nested".to_string()]);
    }

    #[tokio::test]
    async fn test_job_binds_to_run() {
        let ctx = context();
        let job = ctx.job(Job::new("build", "alpine"));
        assert_eq!(job.job().name, "build");
        assert_eq!(ctx.event().id, "run1");
        assert_eq!(ctx.project().name, "org/repo");
    }
}
