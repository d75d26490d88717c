// Lifecycle Module
// Event bus, run context, project loading and the controller tying a run together

pub mod bus;
pub mod context;
pub mod controller;
pub mod project;

pub use bus::{EventBus, Handler, HandlerFuture};
pub use context::RunContext;
pub use controller::{ControllerConfig, EventLifecycleController, LifecycleState, RunReport};
pub use project::{ProjectLoader, StaticProjectLoader};
