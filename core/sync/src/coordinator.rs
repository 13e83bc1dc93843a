//! Sync coordinator: drains the pending mutation queue through the replay
//! handler, one mutation at a time, in enqueue order.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use offgrid_common::Result;
use offgrid_storage::MutationQueue;

use crate::handler::ReplayHandler;
use crate::limiter::{AllowAll, RateLimiter};
use crate::policy::{AbandonPolicy, NeverAbandon};
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;
use crate::state::{DrainFlag, DrainOutcome, DrainReport, DrainState, SyncStats};

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncConfig {
    /// Key passed to the rate limiter before each replay call.
    pub rate_limit_key: String,
    /// When the scheduler triggers drains on its own.
    pub sync_mode: SyncMode,
    /// Backoff between automatic drains after failing cycles.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_limit_key: "sync:replay".to_string(),
            sync_mode: SyncMode::OnConnectivity,
            retry: RetryConfig::default(),
        }
    }
}

/// Replays pending mutations against an application-supplied handler.
///
/// Each coordinator owns its drain state; two coordinators over different
/// queues never interfere.
pub struct SyncCoordinator {
    queue: MutationQueue,
    handler: Arc<dyn ReplayHandler>,
    limiter: Arc<dyn RateLimiter>,
    policy: Arc<dyn AbandonPolicy>,
    config: SyncConfig,
    flag: DrainFlag,
    stats: Mutex<SyncStats>,
}

impl SyncCoordinator {
    /// Create a coordinator with the default configuration, no rate limit
    /// and no abandonment.
    pub fn new(queue: MutationQueue, handler: impl ReplayHandler + 'static) -> Self {
        Self::from_arc(queue, Arc::new(handler))
    }

    /// Create a coordinator from a shared handler.
    pub fn from_arc(queue: MutationQueue, handler: Arc<dyn ReplayHandler>) -> Self {
        Self {
            queue,
            handler,
            limiter: Arc::new(AllowAll),
            policy: Arc::new(NeverAbandon),
            config: SyncConfig::default(),
            flag: DrainFlag::default(),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Consult `limiter` before every replay call.
    ///
    /// The limiter is typically shared with the rest of the application.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_abandon_policy(mut self, policy: impl AbandonPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Current drain state.
    pub fn state(&self) -> DrainState {
        self.flag.state()
    }

    /// Totals across all cycles so far.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run one drain cycle.
    ///
    /// If a cycle is already running this returns
    /// [`DrainOutcome::Coalesced`] immediately. Replay failures are recorded
    /// as retries and never returned as errors.
    ///
    /// # Errors
    /// - Storage errors from the queue; the cycle stops and the mutation
    ///   being processed stays queued
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let Some(_guard) = self.flag.try_begin() else {
            debug!("Drain already in progress; trigger coalesced");
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).coalesced += 1;
            return Ok(DrainOutcome::Coalesced);
        };

        let start = Instant::now();
        let pending = self.queue.list().await?;
        let total = pending.len();
        let mut report = DrainReport::default();

        if total > 0 {
            info!("Starting drain of {} pending mutations", total);
        }

        for mutation in pending {
            if self.policy.should_abandon(&mutation) {
                warn!(
                    "Abandoning mutation {} ({}) after {} retries",
                    mutation.id, mutation.kind, mutation.retries
                );
                self.queue.remove(mutation.id).await?;
                report.abandoned += 1;
                continue;
            }

            if !self.limiter.try_acquire(&self.config.rate_limit_key) {
                info!(
                    "Rate limit reached; leaving mutation {} and later ones for the next cycle",
                    mutation.id
                );
                report.rate_limited = true;
                break;
            }

            debug!("Replaying mutation {} ({})", mutation.id, mutation.kind);
            match self.handler.replay(&mutation).await {
                Ok(()) => {
                    self.queue.remove(mutation.id).await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    let retries = self.queue.increment_retries(mutation.id).await?;
                    warn!(
                        "Mutation {} ({}) failed, retries now {:?}: {}",
                        mutation.id, mutation.kind, retries, e
                    );
                    report.failed += 1;
                }
            }
        }

        report.remaining = total - report.replayed - report.abandoned;
        report.duration = start.elapsed();

        if total > 0 {
            info!(
                "Drain completed in {:?}: {} replayed, {} failed, {} abandoned, {} remaining",
                report.duration, report.replayed, report.failed, report.abandoned, report.remaining
            );
        }

        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(&report);

        Ok(DrainOutcome::Completed(report))
    }

    /// Drain repeatedly until the queue is empty, a cycle fails or is rate
    /// limited, or `max_cycles` is reached.
    ///
    /// Useful right after connectivity returns, when mutations may be
    /// enqueued while a cycle is running.
    pub async fn drain_until_idle(&self, max_cycles: usize) -> Result<Vec<DrainReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            let DrainOutcome::Completed(report) = self.drain().await? else {
                break;
            };
            let stop = !report.is_clean() || report.replayed + report.abandoned == 0;
            reports.push(report);
            if stop || self.queue.is_empty().await? {
                break;
            }
        }
        Ok(reports)
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{replay_fn, ReplayError};
    use crate::policy::RetryCeiling;
    use async_trait::async_trait;
    use offgrid_storage::{Database, PendingMutation};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    async fn queue() -> MutationQueue {
        MutationQueue::open(Arc::new(Database::in_memory().unwrap()))
            .await
            .unwrap()
    }

    /// Fails every mutation whose kind is in the set, records call order.
    #[derive(Default)]
    struct Recorder {
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn failing(kinds: &[&str]) -> Self {
            Self {
                failing: kinds.iter().map(|k| k.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplayHandler for Recorder {
        async fn replay(&self, mutation: &PendingMutation) -> std::result::Result<(), ReplayError> {
            self.calls.lock().unwrap().push(mutation.kind.clone());
            if self.failing.contains(&mutation.kind) {
                Err(ReplayError::new("server returned 503"))
            } else {
                Ok(())
            }
        }
    }

    /// Allows a fixed number of acquisitions.
    struct Budget(AtomicUsize);

    impl RateLimiter for Budget {
        fn try_acquire(&self, _key: &str) -> bool {
            self.0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[tokio::test]
    async fn test_success_removes_and_failure_retries() {
        let queue = queue().await;
        for kind in ["A", "B", "C"] {
            queue.enqueue(kind, Vec::new()).await.unwrap();
        }

        let handler = Arc::new(Recorder::failing(&["B"]));
        let coordinator = SyncCoordinator::from_arc(queue.clone(), handler.clone());

        let outcome = coordinator.drain().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(handler.calls(), vec!["A", "B", "C"]);

        let pending = queue.list().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, "B");
        assert_eq!(pending[0].retries, 1);
        assert_eq!(coordinator.state(), DrainState::Idle);
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_its_place() {
        let queue = queue().await;
        for kind in ["A", "B", "C"] {
            queue.enqueue(kind, Vec::new()).await.unwrap();
        }

        // A succeeds, B fails; C is never attempted because the limiter
        // only has two slots.
        let coordinator = SyncCoordinator::new(queue.clone(), Recorder::failing(&["B"]))
            .with_rate_limiter(Arc::new(Budget(AtomicUsize::new(2))));
        coordinator.drain().await.unwrap();

        let pending: Vec<_> = queue
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.kind, m.retries))
            .collect();
        assert_eq!(pending, vec![("B".to_string(), 1), ("C".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_checkin_scenario() {
        let queue = queue().await;
        let id = queue
            .enqueue_json("checkin", &json!({ "spotId": 42 }))
            .await
            .unwrap();
        assert_eq!(id, 1);

        let listed = queue.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].retries, 0);

        let online = Arc::new(AtomicBool::new(false));
        let flag = online.clone();
        let coordinator = SyncCoordinator::new(
            queue.clone(),
            replay_fn(move |mutation: PendingMutation| {
                let online = flag.load(Ordering::SeqCst);
                async move {
                    let payload: serde_json::Value = match mutation.payload_json() {
                        Ok(payload) => payload,
                        Err(e) => return Err(ReplayError::new(e.to_string())),
                    };
                    assert_eq!(payload["spotId"], 42);
                    if online {
                        Ok(())
                    } else {
                        Err(ReplayError::new("offline"))
                    }
                }
            }),
        );

        coordinator.drain().await.unwrap();
        let listed = queue.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].retries, 1);

        online.store(true, Ordering::SeqCst);
        coordinator.drain().await.unwrap();
        assert!(queue.list().await.unwrap().is_empty());

        let stats = coordinator.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.replayed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_stops_cycle() {
        let queue = queue().await;
        for kind in ["A", "B", "C"] {
            queue.enqueue(kind, Vec::new()).await.unwrap();
        }

        let handler = Arc::new(Recorder::default());
        let coordinator = SyncCoordinator::from_arc(queue.clone(), handler.clone())
            .with_rate_limiter(Arc::new(Budget(AtomicUsize::new(1))));

        let report = coordinator.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.replayed, 1);
        assert!(report.rate_limited);
        assert_eq!(report.remaining, 2);
        assert_eq!(handler.calls(), vec!["A"]);

        // Still denied: nothing happens, nothing is lost.
        let report = coordinator.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_abandon_policy_drops_without_replay() {
        let queue = queue().await;
        queue.enqueue("checkin", Vec::new()).await.unwrap();
        queue.enqueue("payment", Vec::new()).await.unwrap();

        let handler = Arc::new(Recorder::failing(&["checkin", "payment"]));
        let coordinator = SyncCoordinator::from_arc(queue.clone(), handler.clone())
            .with_abandon_policy(RetryCeiling::new().with_ceiling("checkin", 1));

        coordinator.drain().await.unwrap();
        coordinator.drain().await.unwrap();
        assert_eq!(handler.calls().len(), 4);

        // checkin now has 2 retries, past its ceiling of 1.
        let report = coordinator.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(handler.calls().len(), 5);

        let pending = queue.list().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, "payment");
        assert_eq!(pending[0].retries, 3);
    }

    struct Gate {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReplayHandler for Gate {
        async fn replay(&self, _mutation: &PendingMutation) -> std::result::Result<(), ReplayError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_triggers_coalesce() {
        let queue = queue().await;
        queue.enqueue("checkin", Vec::new()).await.unwrap();

        let gate = Arc::new(Gate {
            started: Notify::new(),
            release: Notify::new(),
        });
        let coordinator = Arc::new(SyncCoordinator::from_arc(queue.clone(), gate.clone()));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.drain().await })
        };

        gate.started.notified().await;
        assert_eq!(coordinator.state(), DrainState::Draining);

        let second = coordinator.drain().await.unwrap();
        assert_eq!(second, DrainOutcome::Coalesced);

        gate.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.report().unwrap().replayed, 1);
        assert_eq!(coordinator.state(), DrainState::Idle);
        assert_eq!(coordinator.stats().coalesced, 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_queue_drains_cleanly() {
        let coordinator = SyncCoordinator::new(queue().await, Recorder::default());
        let report = coordinator.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.remaining, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_drain_until_idle_stops_on_failure() {
        let queue = queue().await;
        queue.enqueue("A", Vec::new()).await.unwrap();
        queue.enqueue("B", Vec::new()).await.unwrap();

        let coordinator = SyncCoordinator::new(queue.clone(), Recorder::failing(&["B"]));
        let reports = coordinator.drain_until_idle(5).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("offgrid.db");

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let queue = MutationQueue::open(db).await.unwrap();
            queue.enqueue("A", Vec::new()).await.unwrap();
            queue.enqueue("B", Vec::new()).await.unwrap();

            let coordinator = SyncCoordinator::new(queue, Recorder::failing(&["A", "B"]));
            coordinator.drain().await.unwrap();
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let queue = MutationQueue::open(db).await.unwrap();
        let handler = Arc::new(Recorder::default());
        let coordinator = SyncCoordinator::from_arc(queue.clone(), handler.clone());

        let report = coordinator.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(handler.calls(), vec!["A", "B"]);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_loss_is_an_error_and_resets_state() {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = MutationQueue::open(db.clone()).await.unwrap();
        queue.enqueue("A", Vec::new()).await.unwrap();

        db.call("drop queue", |conn| conn.execute_batch("DROP TABLE pending_mutations"))
            .await
            .unwrap();

        let coordinator = SyncCoordinator::new(queue, Recorder::default());
        assert!(coordinator.drain().await.is_err());
        assert_eq!(coordinator.state(), DrainState::Idle);
    }
}
