// Ferry Service Library
// Job orchestration and event-lifecycle engine for ferry workers

pub mod api;
pub mod builder;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod models;
pub mod script;
pub mod watcher;

// Re-export error types
pub use error::{
    BuildError, CacheError, ClusterError, ConfigError, ControllerError, JobError, WatchError,
};

// Re-export model types
pub use models::{Cause, Event, Job, Phase, Project, Trigger, UnitRef};

// Re-export building and cluster types
pub use builder::{BuildOptions, ExecutionUnit, ExecutionUnitBuilder, NamingMode};
pub use cache::{BuildStorage, CacheVolumeManager, ClaimBuildStorage, NoBuildStorage};
pub use cluster::{Cluster, KubeCluster, KubeProjectLoader, MemoryCluster};

// Re-export execution types
pub use execution::{
    progress_channel, ApiBackend, BatchedGroup, ConcurrentGroup, JobBackend, JobEvent,
    NoopBackend, PodBackend, ProgressReceiver, ProgressSender, RunScope, Runnable, ScheduledJob,
    SerialGroup,
};

// Re-export lifecycle types
pub use config::{WatchConfig, WatchMode, WorkerConfig};
pub use lifecycle::{
    ControllerConfig, EventBus, EventLifecycleController, ProjectLoader, RunContext, RunReport,
    StaticProjectLoader,
};
pub use script::{HandlerFile, Step};
pub use watcher::{PollWatcher, StatusWatcher, StreamConfig, StreamWatcher};
pub use api::WorkerApiClient;
