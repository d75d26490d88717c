// Execution Module
// Runnables, groups and the backends that submit and observe jobs

pub mod backend;
pub mod events;
pub mod group;
pub mod runnable;

// Re-export key types
pub use backend::{ApiBackend, JobBackend, NoopBackend, PodBackend, RunScope};
pub use events::{progress_channel, EventSender, JobEvent, ProgressReceiver, ProgressSender};
pub use group::{BatchedGroup, ConcurrentGroup, SerialGroup};
pub use runnable::{Runnable, ScheduledJob};
