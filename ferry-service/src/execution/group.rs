// Groups
// Serial, concurrent and batched composition of runnables

use super::runnable::Runnable;
use crate::error::JobError;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;

/// Run members together and wait for all of them.
///
/// Siblings are not cancelled when one fails; the first failure observed is returned.
async fn run_all(members: &[Arc<dyn Runnable>]) -> Result<(), JobError> {
    let mut pending: FuturesUnordered<_> = members.iter().map(|member| member.run()).collect();
    let mut first_failure = None;

    while let Some(result) = pending.next().await {
        if let Err(err) = result {
            if first_failure.is_none() {
                first_failure = Some(err);
            } else {
                tracing::debug!(error = %err, "additional failure in concurrent group");
            }
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Runs members one after another, stopping at the first failure
#[derive(Default)]
pub struct SerialGroup {
    members: Vec<Arc<dyn Runnable>>,
}

impl SerialGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, member: Arc<dyn Runnable>) -> Self {
        self.members.push(member);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl Runnable for SerialGroup {
    fn name(&self) -> &str {
        "serial"
    }

    async fn run(&self) -> Result<(), JobError> {
        for member in &self.members {
            member.run().await?;
        }
        Ok(())
    }
}

/// Starts every member at once; succeeds only if all succeed
#[derive(Default)]
pub struct ConcurrentGroup {
    members: Vec<Arc<dyn Runnable>>,
}

impl ConcurrentGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, member: Arc<dyn Runnable>) -> Self {
        self.members.push(member);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl Runnable for ConcurrentGroup {
    fn name(&self) -> &str {
        "concurrent"
    }

    async fn run(&self) -> Result<(), JobError> {
        run_all(&self.members).await
    }
}

/// Runs members in declaration-order chunks of at most `max_concurrent`.
///
/// Each chunk behaves like a [`ConcurrentGroup`]; a failing chunk stops later chunks.
pub struct BatchedGroup {
    max_concurrent: usize,
    members: Vec<Arc<dyn Runnable>>,
}

impl BatchedGroup {
    /// A limit of zero is treated as one
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            members: Vec::new(),
        }
    }

    pub fn add(mut self, member: Arc<dyn Runnable>) -> Self {
        self.members.push(member);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[async_trait]
impl Runnable for BatchedGroup {
    fn name(&self) -> &str {
        "batched"
    }

    async fn run(&self) -> Result<(), JobError> {
        for (index, chunk) in self.members.chunks(self.max_concurrent).enumerate() {
            tracing::debug!(batch = index, size = chunk.len(), "running batch");
            run_all(chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Sleeps, records its completion, then succeeds or fails
    struct Delayed {
        name: String,
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Runnable for Delayed {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self) -> Result<(), JobError> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(format!("end:{}", self.name));
            if self.fail {
                Err(JobError::Failed {
                    job: self.name.clone(),
                    phase: Phase::Failed,
                })
            } else {
                Ok(())
            }
        }
    }

    fn delayed(
        log: &Arc<Mutex<Vec<String>>>,
        name: &str,
        millis: u64,
        fail: bool,
    ) -> Arc<dyn Runnable> {
        Arc::new(Delayed {
            name: name.to_string(),
            delay: Duration::from_millis(millis),
            fail,
            log: log.clone(),
        })
    }

    fn ends(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|entry| entry.strip_prefix("end:").map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_group_waits_for_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = ConcurrentGroup::new()
            .add(delayed(&log, "a", 50, false))
            .add(delayed(&log, "b", 5, false))
            .add(delayed(&log, "c", 1, false));

        let start = Instant::now();
        group.run().await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(ends(&log), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_concurrent_group_fails_if_any_member_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = ConcurrentGroup::new()
            .add(delayed(&log, "a", 50, false))
            .add(delayed(&log, "b", 5, true))
            .add(delayed(&log, "c", 1, false));

        let err = group.run().await.unwrap_err();

        assert!(matches!(err, JobError::Failed { ref job, .. } if job == "b"));
        // The slow sibling still ran to completion
        assert_eq!(ends(&log), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_concurrent_group_reports_first_observed_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = ConcurrentGroup::new()
            .add(delayed(&log, "slow", 30, true))
            .add(delayed(&log, "fast", 1, true));

        let err = group.run().await.unwrap_err();
        assert!(matches!(err, JobError::Failed { ref job, .. } if job == "fast"));
    }

    #[tokio::test]
    async fn test_serial_group_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = SerialGroup::new()
            .add(delayed(&log, "first", 1, false))
            .add(delayed(&log, "second", 1, true))
            .add(delayed(&log, "third", 1, false));

        let err = group.run().await.unwrap_err();

        assert!(matches!(err, JobError::Failed { ref job, .. } if job == "second"));
        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec!["start:first", "end:first", "start:second", "end:second"]
        );
    }

    #[tokio::test]
    async fn test_batched_group_runs_chunks_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = BatchedGroup::new(2)
            .add(delayed(&log, "a", 10, false))
            .add(delayed(&log, "b", 1, false))
            .add(delayed(&log, "c", 1, false));

        group.run().await.unwrap();

        let entries = log.lock().unwrap().clone();
        let c_start = entries.iter().position(|e| e == "start:c").unwrap();
        let a_end = entries.iter().position(|e| e == "end:a").unwrap();
        assert!(a_end < c_start);
    }

    #[tokio::test]
    async fn test_batched_group_failing_chunk_stops_later_chunks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = BatchedGroup::new(1)
            .add(delayed(&log, "a", 1, true))
            .add(delayed(&log, "b", 1, false));

        assert!(group.run().await.is_err());
        assert_eq!(ends(&log), vec!["a"]);
    }

    #[test]
    fn test_batched_zero_is_one() {
        assert_eq!(BatchedGroup::new(0).max_concurrent(), 1);
    }
}
