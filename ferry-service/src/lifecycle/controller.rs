// Event Lifecycle Controller
// Drives one worker run: project, build volume, event, after/error notifications, teardown

use super::bus::EventBus;
use super::context::{panic_message, RunContext};
use super::project::ProjectLoader;
use crate::cache::BuildStorage;
use crate::error::ControllerError;
use crate::execution::{EventSender, JobBackend, JobEvent, ProgressSender, RunScope};
use crate::models::{Cause, Event, Trigger, AFTER_EVENT, ERROR_EVENT};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Run-level behavior switches
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Terminate the process with the exit code instead of only reporting it
    pub exit_on_error: bool,
}

/// Where a run got to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    ProjectLoaded,
    StorageProvisioned,
    EventFired,
    AfterFired,
    NoHandlerBookkept,
    StorageTornDown,
    Exited,
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit_code: i32,
    /// An `after` event was emitted
    pub after_fired: bool,
    /// The `error` event was emitted
    pub error_fired: bool,
    pub error_reason: Option<String>,
    pub states: Vec<LifecycleState>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// At-most-once switches for a single run
#[derive(Default)]
struct Latches {
    after: AtomicBool,
    error: AtomicBool,
    torn_down: AtomicBool,
    first_error: Mutex<Option<(String, Trigger)>>,
}

impl Latches {
    fn first_error(&self) -> Option<(String, Trigger)> {
        match self.first_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_first_error(&self, reason: &str, trigger: Trigger) {
        let mut guard = match self.first_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some((reason.to_string(), trigger));
    }
}

pub struct EventLifecycleController {
    bus: Arc<EventBus>,
    loader: Arc<dyn ProjectLoader>,
    storage: Arc<dyn BuildStorage>,
    backend: Arc<dyn JobBackend>,
    progress: Option<ProgressSender>,
    config: ControllerConfig,
}

impl EventLifecycleController {
    pub fn new(
        bus: Arc<EventBus>,
        loader: Arc<dyn ProjectLoader>,
        storage: Arc<dyn BuildStorage>,
        backend: Arc<dyn JobBackend>,
    ) -> Self {
        Self {
            bus,
            loader,
            storage,
            backend,
            progress: None,
            config: ControllerConfig::default(),
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSender>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `event` for project `project_id` to completion.
    ///
    /// Only failures before the event fires are returned as errors. Handler
    /// failures are reported through the `error` event and the exit code.
    pub async fn run(&self, project_id: &str, event: Event) -> Result<RunReport, ControllerError> {
        let mut states = vec![LifecycleState::Idle];
        let latches = Latches::default();

        let project = self
            .loader
            .load(project_id)
            .await
            .map_err(|source| ControllerError::ProjectLoad {
                project: project_id.to_string(),
                source,
            })?;
        states.push(LifecycleState::ProjectLoaded);
        tracing::info!(project = %project.name, event = %event.id, "project loaded");

        self.storage
            .provision(&event, &project)
            .await
            .map_err(|source| ControllerError::StorageProvision {
                run: event.run_id().to_string(),
                source,
            })?;
        states.push(LifecycleState::StorageProvisioned);

        let scope = Arc::new(RunScope::new(event.clone(), project.clone()));
        let ctx = RunContext::new(scope, self.backend.clone(), self.progress.clone());
        let handled = self.bus.has_handler(&event.source, &event.event_type);

        states.push(LifecycleState::EventFired);
        if let Some(Err(reason)) = self.dispatch(&event, &ctx).await {
            self.raise_error(&event, &ctx, &latches, &reason, Trigger::Handler)
                .await;
        }
        self.drain_background(&event, &ctx, &latches).await;

        let mut after_fired = false;
        if !latches.after.swap(true, Ordering::SeqCst) {
            if handled {
                let cause = match latches.first_error() {
                    Some((reason, trigger)) => Cause {
                        event: Box::new(event.clone()),
                        reason: Some(reason),
                        trigger,
                    },
                    None => Cause {
                        event: Box::new(event.clone()),
                        reason: None,
                        trigger: Trigger::Success,
                    },
                };
                let after = event.derive(AFTER_EVENT, cause);
                after_fired = true;
                if let Some(Err(reason)) = self.dispatch(&after, &ctx).await {
                    self.raise_error(&event, &ctx, &latches, &reason, Trigger::Handler)
                        .await;
                }
                self.drain_background(&event, &ctx, &latches).await;
                states.push(LifecycleState::AfterFired);
            } else {
                tracing::debug!(
                    source = %event.source,
                    event_type = %event.event_type,
                    "no handler registered"
                );
                states.push(LifecycleState::NoHandlerBookkept);
            }
        }

        if !latches.torn_down.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.storage.destroy(&event, &project).await {
                tracing::error!(run = %event.run_id(), error = %err, "destroying build volume failed");
            }
            states.push(LifecycleState::StorageTornDown);
        }

        let error_fired = latches.error.load(Ordering::SeqCst);
        let exit_code = if error_fired { 1 } else { 0 };
        states.push(LifecycleState::Exited);

        if self.config.exit_on_error && exit_code != 0 {
            tracing::error!(exit_code, "run failed, exiting");
            std::process::exit(exit_code);
        }

        Ok(RunReport {
            exit_code,
            after_fired,
            error_fired,
            error_reason: latches.first_error().map(|(reason, _)| reason),
            states,
        })
    }

    /// Invoke the handler for `event`, if any. Panics are caught and turned into errors.
    async fn dispatch(&self, event: &Event, ctx: &RunContext) -> Option<Result<(), String>> {
        let handler = self.bus.handler(&event.source, &event.event_type)?;
        self.progress
            .send_event(JobEvent::event_fired(&event.source, &event.event_type));
        tracing::info!(source = %event.source, event_type = %event.event_type, "firing event");

        let task = tokio::spawn(handler(event.clone(), ctx.clone()));
        let outcome = match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(join) if join.is_panic() => {
                Err(format!("handler panicked: {}", panic_message(join)))
            }
            Err(join) => Err(join.to_string()),
        };
        Some(outcome)
    }

    async fn drain_background(&self, event: &Event, ctx: &RunContext, latches: &Latches) {
        for reason in ctx.join_background().await {
            self.raise_error(event, ctx, latches, &reason, Trigger::Background)
                .await;
        }
    }

    /// Fire the `error` event for the first failure only; later failures are logged
    async fn raise_error(
        &self,
        event: &Event,
        ctx: &RunContext,
        latches: &Latches,
        reason: &str,
        trigger: Trigger,
    ) {
        self.progress.send_event(JobEvent::error(reason, None));
        if latches.error.swap(true, Ordering::SeqCst) {
            tracing::warn!(%trigger, reason, "additional failure after error event");
            return;
        }
        latches.set_first_error(reason, trigger);
        tracing::error!(%trigger, reason, "run failed");

        let cause = Cause {
            event: Box::new(event.clone()),
            reason: Some(reason.to_string()),
            trigger,
        };
        let error_event = event.derive(ERROR_EVENT, cause);
        if let Some(Err(err)) = self.dispatch(&error_event, ctx).await {
            tracing::error!(error = %err, "error handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ClaimBuildStorage, NoBuildStorage};
    use crate::cluster::MemoryCluster;
    use crate::execution::NoopBackend;
    use crate::models::Project;
    use std::sync::atomic::AtomicUsize;

    fn event() -> Event {
        Event::new("run1", "github", "push")
    }

    fn cluster() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::succeeding());
        cluster.add_project(Project::new("p1", "org/repo").with_namespace("ci"));
        cluster
    }

    fn controller(bus: EventBus, cluster: &Arc<MemoryCluster>) -> EventLifecycleController {
        EventLifecycleController::new(
            Arc::new(bus),
            cluster.clone(),
            Arc::new(ClaimBuildStorage::new(cluster.clone())),
            Arc::new(NoopBackend),
        )
    }

    fn counter_handler(
        bus: &mut EventBus,
        event_type: &str,
        causes: Arc<Mutex<Vec<Cause>>>,
    ) {
        bus.on("github", event_type, move |event: Event, _ctx| {
            let causes = causes.clone();
            async move {
                if let Some(cause) = event.cause {
                    causes.lock().unwrap().push(cause);
                }
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn test_successful_run() {
        let cluster = cluster();
        let afters = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, _ctx| async { Ok(()) });
        counter_handler(&mut bus, AFTER_EVENT, afters.clone());
        counter_handler(&mut bus, ERROR_EVENT, errors.clone());

        let report = controller(bus, &cluster).run("p1", event()).await.unwrap();

        assert_eq!(report.exit_code, 0);
        assert!(report.after_fired);
        assert!(!report.error_fired);
        assert_eq!(
            report.states,
            vec![
                LifecycleState::Idle,
                LifecycleState::ProjectLoaded,
                LifecycleState::StorageProvisioned,
                LifecycleState::EventFired,
                LifecycleState::AfterFired,
                LifecycleState::StorageTornDown,
                LifecycleState::Exited,
            ]
        );

        let afters = afters.lock().unwrap();
        assert_eq!(afters.len(), 1);
        assert_eq!(afters[0].trigger, Trigger::Success);
        assert_eq!(afters[0].event.id, "run1");
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(cluster.claim_deletes(), 1);
    }

    #[tokio::test]
    async fn test_error_latch_fires_once() {
        let cluster = cluster();
        let afters = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, ctx: RunContext| async move {
            ctx.spawn(async { anyhow::bail!("upload failed") });
            ctx.spawn(async { anyhow::bail!("notify failed") });
            anyhow::bail!("tests failed")
        });
        counter_handler(&mut bus, AFTER_EVENT, afters.clone());
        counter_handler(&mut bus, ERROR_EVENT, errors.clone());

        let report = controller(bus, &cluster).run("p1", event()).await.unwrap();

        assert_eq!(report.exit_code, 1);
        assert!(report.error_fired);
        assert_eq!(report.error_reason.as_deref(), Some("tests failed"));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].trigger, Trigger::Handler);

        let afters = afters.lock().unwrap();
        assert_eq!(afters.len(), 1);
        assert_eq!(afters[0].trigger, Trigger::Handler);
        assert_eq!(cluster.claim_deletes(), 1);
    }

    #[tokio::test]
    async fn test_background_failure_raises_error() {
        let cluster = cluster();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, ctx: RunContext| async move {
            ctx.spawn(async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                anyhow::bail!("late failure")
            });
            Ok(())
        });
        counter_handler(&mut bus, ERROR_EVENT, errors.clone());

        let report = controller(bus, &cluster).run("p1", event()).await.unwrap();

        assert_eq!(report.exit_code, 1);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].trigger, Trigger::Background);
        assert_eq!(errors[0].reason.as_deref(), Some("late failure"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let cluster = cluster();
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, _ctx| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });

        let report = controller(bus, &cluster).run("p1", event()).await.unwrap();

        assert_eq!(report.exit_code, 1);
        assert!(report.error_reason.unwrap().contains("boom"));
        assert_eq!(cluster.claim_deletes(), 1);
    }

    #[tokio::test]
    async fn test_no_handler_bookkeeps_without_after() {
        let cluster = cluster();
        let afters = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        counter_handler(&mut bus, AFTER_EVENT, afters.clone());

        let report = controller(bus, &cluster).run("p1", event()).await.unwrap();

        assert_eq!(report.exit_code, 0);
        assert!(!report.after_fired);
        assert!(report.states.contains(&LifecycleState::NoHandlerBookkept));
        assert!(afters.lock().unwrap().is_empty());
        assert_eq!(cluster.claim_deletes(), 1);
    }

    #[tokio::test]
    async fn test_project_load_failure_aborts() {
        let cluster = cluster();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut bus = EventBus::new();
        bus.on("github", "push", move |_event, _ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let err = controller(bus, &cluster)
            .run("missing", event())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::ProjectLoad { ref project, .. } if project == "missing"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_failure_is_not_raised() {
        let cluster = cluster();
        cluster.fail_claim_deletes("storage busy");
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, _ctx| async { Ok(()) });

        let report = controller(bus, &cluster).run("p1", event()).await.unwrap();

        assert_eq!(report.exit_code, 0);
        assert_eq!(cluster.claim_deletes(), 1);
    }

    #[tokio::test]
    async fn test_handler_runs_jobs() {
        let cluster = cluster();
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, ctx: RunContext| async move {
            use crate::execution::Runnable;
            use crate::models::Job;
            ctx.job(Job::new("build", "alpine")).run().await?;
            Ok(())
        });

        let report = EventLifecycleController::new(
            Arc::new(bus),
            cluster.clone(),
            Arc::new(NoBuildStorage),
            Arc::new(NoopBackend),
        )
        .run("p1", event())
        .await
        .unwrap();

        assert!(report.succeeded());
    }
}
