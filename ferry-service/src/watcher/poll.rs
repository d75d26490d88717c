// Poll Watcher
// Reads a unit's phase on an interval while a timeout timer races the poll task

use super::{logs_or_placeholder, LogReader, PhaseLedger, PhaseReader, StatusWatcher};
use crate::error::WatchError;
use crate::models::{Phase, UnitRef};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default delay between phase reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Status watcher that polls the orchestrator
pub struct PollWatcher {
    reader: Arc<dyn PhaseReader>,
    logs: Arc<dyn LogReader>,
    interval: Duration,
    ledger: PhaseLedger,
}

impl PollWatcher {
    pub fn new(reader: Arc<dyn PhaseReader>, logs: Arc<dyn LogReader>) -> Self {
        Self {
            reader,
            logs,
            interval: DEFAULT_POLL_INTERVAL,
            ledger: PhaseLedger::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl StatusWatcher for PollWatcher {
    async fn observe(
        &self,
        unit: &UnitRef,
        timeout: Duration,
        _fallible: bool,
    ) -> Result<Phase, WatchError> {
        let cancel = CancellationToken::new();

        let mut poll = {
            let cancel = cancel.clone();
            let reader = self.reader.clone();
            let ledger = self.ledger.clone();
            let unit = unit.clone();
            let period = self.interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        _ = ticker.tick() => {}
                    }

                    let read = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        read = reader.read_phase(&unit) => read,
                    };

                    match read {
                        Ok(Some(phase)) => {
                            ledger.record(&unit, phase);
                            if phase.is_terminal() {
                                return Ok(Some(phase));
                            }
                        }
                        Ok(None) => tracing::trace!(unit = %unit, "unit not visible yet"),
                        Err(err) if err.is_not_found() => {
                            tracing::trace!(unit = %unit, "unit not found yet")
                        }
                        Err(err) => return Err(WatchError::from(err)),
                    }
                }
            })
        };

        tokio::select! {
            joined = &mut poll => match joined {
                Ok(Ok(Some(phase))) => Ok(phase),
                Ok(Ok(None)) => Err(WatchError::Task {
                    unit: unit.to_string(),
                    reason: "poll stopped before a terminal phase".to_string(),
                }),
                Ok(Err(err)) => Err(err),
                Err(join) => Err(WatchError::Task {
                    unit: unit.to_string(),
                    reason: join.to_string(),
                }),
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                let _ = poll.await;
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
