// Stream Watcher
// Subscribes to a unit's phases, reconnecting on disruption until a terminal phase or timeout

use super::{logs_or_placeholder, LogReader, PhaseLedger, PhaseSubscriber, StatusWatcher};
use crate::error::WatchError;
use crate::models::{Phase, UnitRef};

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reconnection policy for status streams
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Reconnects attempted before giving up
    pub max_reconnects: u32,
    /// Fixed delay before each reconnect
    pub reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Status watcher backed by a phase subscription
pub struct StreamWatcher {
    subscriber: Arc<dyn PhaseSubscriber>,
    logs: Arc<dyn LogReader>,
    config: StreamConfig,
    ledger: PhaseLedger,
}

impl StreamWatcher {
    pub fn new(subscriber: Arc<dyn PhaseSubscriber>, logs: Arc<dyn LogReader>) -> Self {
        Self {
            subscriber,
            logs,
            config: StreamConfig::default(),
            ledger: PhaseLedger::default(),
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }
}

/// Keeps a subscription alive until it yields a terminal phase.
///
/// `closing` is set when the caller stops watching; once set, no reconnect happens.
async fn supervise(
    subscriber: Arc<dyn PhaseSubscriber>,
    ledger: PhaseLedger,
    unit: UnitRef,
    fallible: bool,
    config: StreamConfig,
    closing: CancellationToken,
) -> Result<Option<Phase>, WatchError> {
    let mut reconnects = 0u32;

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = closing.cancelled() => return Ok(None),
            subscribed = subscriber.subscribe(&unit) => subscribed,
        };

        let mut progressed = false;
        let disruption = match subscribed {
            Ok(mut phases) => loop {
                let next = tokio::select! {
                    biased;
                    _ = closing.cancelled() => return Ok(None),
                    next = phases.next() => next,
                };
                match next {
                    Some(Ok(phase)) => {
                        progressed = true;
                        ledger.record(&unit, phase);
                        if phase.is_terminal() {
                            return Ok(Some(phase));
                        }
                    }
                    Some(Err(err)) => break err.to_string(),
                    None => break "status stream ended".to_string(),
                }
            },
            Err(err) => err.to_string(),
        };

        if fallible {
            tracing::warn!(
                unit = %unit,
                reason = %disruption,
                "status stream disrupted for fallible job, treating as succeeded"
            );
            return Ok(Some(Phase::Succeeded));
        }

        // Budget covers consecutive disruptions only
        if progressed {
            reconnects = 0;
        }
        if reconnects >= config.max_reconnects {
            return Err(WatchError::Disrupted {
                unit: unit.to_string(),
                attempts: reconnects,
            });
        }
        reconnects += 1;
        tracing::warn!(
            unit = %unit,
            reason = %disruption,
            attempt = reconnects,
            "status stream disrupted, reconnecting"
        );

        tokio::select! {
            biased;
            _ = closing.cancelled() => return Ok(None),
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

#[async_trait]
impl StatusWatcher for StreamWatcher {
    async fn observe(
        &self,
        unit: &UnitRef,
        timeout: Duration,
        fallible: bool,
    ) -> Result<Phase, WatchError> {
        let closing = CancellationToken::new();
        let mut supervisor = tokio::spawn(supervise(
            self.subscriber.clone(),
            self.ledger.clone(),
            unit.clone(),
            fallible,
            self.config.clone(),
            closing.clone(),
        ));

        tokio::select! {
            joined = &mut supervisor => match joined {
                Ok(Ok(Some(phase))) => Ok(phase),
                Ok(Ok(None)) => Err(WatchError::Task {
                    unit: unit.to_string(),
                    reason: "status stream closed before a terminal phase".to_string(),
                }),
                Ok(Err(err)) => Err(err),
                Err(join) => Err(WatchError::Task {
                    unit: unit.to_string(),
                    reason: join.to_string(),
                }),
            },
            _ = tokio::time::sleep(timeout) => {
                closing.cancel();
                let _ = supervisor.await;
                self.ledger.record(unit, Phase::TimedOut);
                tracing::warn!(unit = %unit, timeout = ?timeout, "timed out waiting for unit");
                Ok(Phase::TimedOut)
            }
        }
    }

    async fn fetch_logs(&self, unit: &UnitRef) -> Result<String, WatchError> {
        logs_or_placeholder(&self.ledger, self.logs.as_ref(), unit).await
    }
}
