use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use ferry_service::cluster::{KubeCluster, KubeProjectLoader, MemoryCluster};
use ferry_service::execution::events::LogLevel;
use ferry_service::watcher::{LogReader, PhaseReader, PhaseSubscriber};
use ferry_service::{
    progress_channel, ApiBackend, BuildStorage, ClaimBuildStorage, Cluster, EventBus,
    EventLifecycleController, ExecutionUnitBuilder, HandlerFile, JobBackend, JobEvent,
    NoBuildStorage, NoopBackend, PodBackend, PollWatcher, Project, ProjectLoader,
    StaticProjectLoader, StatusWatcher, StreamWatcher, WatchConfig, WatchMode, WorkerApiClient,
    WorkerConfig,
};

/// Handle the configured event
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Handler file declaring the jobs to run per event
    #[arg(long, value_name = "FILE")]
    pub handlers: PathBuf,

    /// JSON event descriptor (default: read FERRY_* environment keys)
    #[arg(long, value_name = "FILE")]
    pub descriptor: Option<PathBuf>,

    /// Where jobs are executed
    #[arg(long, value_enum, default_value_t = BackendMode::Pod)]
    pub mode: BackendMode,

    /// How job status is observed in pod mode
    #[arg(long, value_enum, default_value_t = WatchArg::Poll)]
    pub watch: WatchArg,

    /// Seconds between status polls
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Submit against an in-memory cluster where every job succeeds
    #[arg(long)]
    pub dry_run: bool,

    /// Exit with the run's code as soon as a failed run is torn down (also FERRY_EXIT_ON_ERROR)
    #[arg(long)]
    pub exit_on_error: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendMode {
    /// Pods submitted directly to the cluster
    Pod,
    /// Jobs created through the worker API
    Api,
    /// Validate jobs without running them
    Noop,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchArg {
    Poll,
    Stream,
}

/// Backend pieces chosen for this run
struct Wiring {
    loader: Arc<dyn ProjectLoader>,
    storage: Arc<dyn BuildStorage>,
    backend: Arc<dyn JobBackend>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let config = match &args.descriptor {
        Some(path) => WorkerConfig::from_descriptor(path)
            .wrap_err_with(|| format!("loading descriptor {}", path.display()))?,
        None => WorkerConfig::from_env().wrap_err("reading worker environment")?,
    };
    super::init_logging(config.log_level.as_filter());
    tracing::debug!(
        project = %config.project_id,
        event = %config.event.id,
        mode = ?args.mode,
        dry_run = args.dry_run,
        "worker configured"
    );

    if !args.handlers.exists() {
        bail!("Handler file not found: {}", args.handlers.display());
    }
    output::status("Loading", &format!("{}", args.handlers.display()));
    let handlers = HandlerFile::load(&args.handlers)?;
    output::info(&format!(
        "{} handler(s), {} job(s)",
        handlers.handlers.len(),
        handlers.job_count()
    ));

    let mut bus = EventBus::new();
    handlers.register(&mut bus);

    let watch = WatchConfig {
        mode: match args.watch {
            WatchArg::Poll => WatchMode::Poll,
            WatchArg::Stream => WatchMode::Stream,
        },
        poll_interval: args
            .poll_interval
            .map(Duration::from_secs)
            .unwrap_or(WatchConfig::default().poll_interval),
        ..Default::default()
    };

    let wiring = if args.dry_run {
        if args.mode != BackendMode::Pod {
            output::warning("--dry-run always uses pod mode");
        }
        let cluster = Arc::new(MemoryCluster::succeeding());
        cluster.add_project(inline_project(&config));
        let loader: Arc<dyn ProjectLoader> = cluster.clone();
        pod_wiring(cluster, loader, &config, &watch)
    } else {
        match args.mode {
            BackendMode::Pod => {
                let cluster = Arc::new(KubeCluster::connect().await?);
                let loader: Arc<dyn ProjectLoader> = match config.project {
                    Some(_) => Arc::new(StaticProjectLoader::new(inline_project(&config))),
                    None => Arc::new(KubeProjectLoader::new(
                        cluster.client(),
                        config
                            .project_namespace
                            .clone()
                            .unwrap_or_else(|| "default".to_string()),
                    )),
                };
                pod_wiring(cluster, loader, &config, &watch)
            }
            BackendMode::Api => {
                let Some(address) = config.event.worker.api_address.clone() else {
                    bail!("api mode needs worker.apiAddress in the descriptor");
                };
                let client = Arc::new(WorkerApiClient::new(
                    address,
                    config.event.worker.api_token.clone(),
                )?);
                let watcher = Arc::new(
                    StreamWatcher::new(client.clone(), client.clone())
                        .with_config(watch.stream.clone()),
                );
                Wiring {
                    loader: Arc::new(StaticProjectLoader::new(inline_project(&config))),
                    storage: Arc::new(NoBuildStorage),
                    backend: Arc::new(ApiBackend::new(client, watcher)),
                }
            }
            BackendMode::Noop => Wiring {
                loader: Arc::new(StaticProjectLoader::new(inline_project(&config))),
                storage: Arc::new(NoBuildStorage),
                backend: Arc::new(NoopBackend),
            },
        }
    };

    let event = config.event();
    output::header(&format!(
        "Event {}/{} ({})",
        event.source, event.event_type, event.id
    ));

    let mut controller_config = config.controller_config();
    controller_config.exit_on_error |= args.exit_on_error;

    let (tx, mut rx) = progress_channel();
    let controller = EventLifecycleController::new(
        Arc::new(bus),
        wiring.loader,
        wiring.storage,
        wiring.backend,
    )
    .with_progress(Some(tx))
    .with_config(controller_config);

    let project_id = config.project_id.clone();
    let run = tokio::spawn(async move { controller.run(&project_id, event).await });

    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    let report = run.await??;
    println!();
    if report.succeeded() {
        output::success("Run completed successfully");
    } else {
        output::failure(&format!(
            "Run failed: {}",
            report.error_reason.as_deref().unwrap_or("unknown error")
        ));
        std::process::exit(report.exit_code);
    }

    Ok(())
}

/// Project from the descriptor, or a bare one named after the configured id
fn inline_project(config: &WorkerConfig) -> Project {
    let project = config
        .project
        .clone()
        .unwrap_or_else(|| Project::new(config.project_id.clone(), config.project_id.clone()));
    config.scope_project(project)
}

fn pod_wiring<C>(
    cluster: Arc<C>,
    loader: Arc<dyn ProjectLoader>,
    config: &WorkerConfig,
    watch: &WatchConfig,
) -> Wiring
where
    C: Cluster + PhaseReader + PhaseSubscriber + LogReader + 'static,
{
    let watcher: Arc<dyn StatusWatcher> = match watch.mode {
        WatchMode::Poll => Arc::new(
            PollWatcher::new(cluster.clone(), cluster.clone()).with_interval(watch.poll_interval),
        ),
        WatchMode::Stream => Arc::new(
            StreamWatcher::new(cluster.clone(), cluster.clone()).with_config(watch.stream.clone()),
        ),
    };
    let storage = ClaimBuildStorage::new(cluster.clone())
        .with_size(config.build_storage_size.clone())
        .with_default_storage_class(config.default_build_storage_class.clone());
    let builder = ExecutionUnitBuilder::new(config.build_options());

    Wiring {
        loader,
        storage: Arc::new(storage),
        backend: Arc::new(PodBackend::new(builder, cluster, watcher)),
    }
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::EventFired { source, event_type } => {
            output::status("Firing", &format!("{}/{}", source, event_type));
        }

        JobEvent::JobStarted { job_name } => {
            println!("    Job '{}' starting", job_name);
        }

        JobEvent::JobSubmitted { job_name, unit } => {
            output::dim(&format!("    Job '{}' submitted as {}", job_name, unit));
        }

        JobEvent::JobCompleted {
            job_name,
            phase,
            duration,
        } => {
            output::dim_success(&format!(
                "    Job '{}' {} ({:.2}s)",
                job_name,
                phase,
                duration.as_secs_f64()
            ));
        }

        JobEvent::JobFailed {
            job_name,
            error,
            duration,
        } => {
            output::dim_failure(&format!(
                "    Job '{}' FAIL ({:.2}s)",
                job_name,
                duration.as_secs_f64()
            ));
            output::step_error(error);
        }

        JobEvent::Log {
            level,
            message,
            job_name,
        } => {
            let message = match job_name {
                Some(job) => format!("[{}] {}", job, message),
                None => message.clone(),
            };
            match level {
                LogLevel::Error => output::error(&message),
                LogLevel::Warning => output::warning(&message),
                LogLevel::Info => output::dim(&message),
            }
        }
    }
}
