// Status Watching
// Observes a submitted unit until it reaches a terminal phase or its timeout elapses

pub mod poll;
pub mod stream;

pub use poll::PollWatcher;
pub use stream::{StreamConfig, StreamWatcher};

use crate::error::{ClusterError, WatchError};
use crate::models::{Phase, UnitRef};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Log text returned for units canceled before they were scheduled
pub const CANCELED_LOGS_PLACEHOLDER: &str =
    "Job was canceled before it was scheduled; no logs are available.";

/// Stream of phases reported for one unit
pub type PhaseStream = BoxStream<'static, Result<Phase, ClusterError>>;

/// One-shot phase lookup, used by polling
#[async_trait]
pub trait PhaseReader: Send + Sync {
    /// Current phase, or `None` while the unit is not visible yet
    async fn read_phase(&self, unit: &UnitRef) -> Result<Option<Phase>, ClusterError>;
}

/// Phase subscription, used by streaming
#[async_trait]
pub trait PhaseSubscriber: Send + Sync {
    async fn subscribe(&self, unit: &UnitRef) -> Result<PhaseStream, ClusterError>;
}

/// Log retrieval for the primary container of a unit
#[async_trait]
pub trait LogReader: Send + Sync {
    async fn read_logs(&self, unit: &UnitRef) -> Result<String, ClusterError>;
}

/// Observes units until they finish
#[async_trait]
pub trait StatusWatcher: Send + Sync {
    /// Resolve with the unit's final phase, or [`Phase::TimedOut`] once `timeout` elapses
    async fn observe(
        &self,
        unit: &UnitRef,
        timeout: Duration,
        fallible: bool,
    ) -> Result<Phase, WatchError>;

    async fn fetch_logs(&self, unit: &UnitRef) -> Result<String, WatchError>;
}

/// Last phase observed per unit, shared between observation and log retrieval
#[derive(Debug, Clone, Default)]
pub struct PhaseLedger {
    phases: Arc<Mutex<HashMap<UnitRef, Phase>>>,
}

impl PhaseLedger {
    pub fn record(&self, unit: &UnitRef, phase: Phase) {
        if let Ok(mut phases) = self.phases.lock() {
            phases.insert(unit.clone(), phase);
        }
    }

    pub fn last(&self, unit: &UnitRef) -> Option<Phase> {
        self.phases
            .lock()
            .ok()
            .and_then(|phases| phases.get(unit).copied())
    }
}

/// Shared log retrieval: canceled units get the placeholder instead of a cluster call
pub(crate) async fn logs_or_placeholder(
    ledger: &PhaseLedger,
    logs: &dyn LogReader,
    unit: &UnitRef,
) -> Result<String, WatchError> {
    if ledger.last(unit) == Some(Phase::Canceled) {
        return Ok(CANCELED_LOGS_PLACEHOLDER.to_string());
    }
    Ok(logs.read_logs(unit).await?)
}

#[cfg(test)]
pub(crate) fn test_unit(name: &str) -> UnitRef {
    UnitRef {
        namespace: "ci".to_string(),
        name: name.to_string(),
        job: name.to_string(),
        event_id: "run-1".to_string(),
    }
}
