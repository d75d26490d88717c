// Event Bus
// Handlers registered per (source, type); one bus is built per worker and handed to the controller

use super::context::RunContext;
use crate::models::Event;

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a handler
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A registered handler
pub type Handler = Arc<dyn Fn(Event, RunContext) -> HandlerFuture + Send + Sync>;

/// Maps `(source, type)` to the handler that runs for it
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: HashMap<(String, String), Handler>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `event_type` from `source`, replacing any earlier one
    pub fn on<F, Fut>(&mut self, source: impl Into<String>, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Event, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |event: Event, ctx: RunContext| -> HandlerFuture {
                Box::pin(handler(event, ctx))
            });
        self.handlers
            .insert((source.into(), event_type.into()), handler);
    }

    pub fn has_handler(&self, source: &str, event_type: &str) -> bool {
        self.handlers
            .contains_key(&(source.to_string(), event_type.to_string()))
    }

    pub fn handler(&self, source: &str, event_type: &str) -> Option<Handler> {
        self.handlers
            .get(&(source.to_string(), event_type.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_keyed_by_source_and_type() {
        let mut bus = EventBus::new();
        bus.on("github", "push", |_event, _ctx| async { Ok(()) });

        assert!(bus.has_handler("github", "push"));
        assert!(!bus.has_handler("github", "pull_request"));
        assert!(!bus.has_handler("gitlab", "push"));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_later_registration_replaces() {
        let mut bus = EventBus::new();
        bus.on("cron", "tick", |_event, _ctx| async { Ok(()) });
        bus.on("cron", "tick", |_event, _ctx| async { anyhow::bail!("second") });

        assert_eq!(bus.len(), 1);
        assert!(bus.handler("cron", "tick").is_some());
    }
}
