//! Drain scheduling - explicit, connectivity and periodic triggers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use offgrid_common::{Error, Result};

use crate::coordinator::SyncCoordinator;
use crate::retry::Backoff;
use crate::state::DrainOutcome;

/// When the scheduler starts drain cycles on its own.
///
/// Explicit [`SyncScheduler::request_drain`] calls are honored in every mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only explicit requests.
    Manual,
    /// Drain whenever connectivity is restored.
    OnConnectivity,
    /// Drain at regular intervals.
    Periodic { interval: Duration },
    /// Both connectivity and periodic triggers.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn drains_on_connectivity(&self) -> bool {
        matches!(self, SyncMode::OnConnectivity | SyncMode::Hybrid { .. })
    }

    fn period(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }
}

/// Scheduler request types.
#[derive(Debug)]
enum SchedulerRequest {
    Drain(oneshot::Sender<Result<DrainOutcome>>),
    ConnectivityRestored,
    Shutdown,
}

/// Front end for triggering drains from anywhere in the application.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a scheduler for `coordinator`, starting in the coordinator's
    /// configured mode.
    ///
    /// Nothing happens until [`SyncSchedulerHandle::run`] is spawned.
    pub fn new(coordinator: Arc<SyncCoordinator>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(coordinator.config().sync_mode.clone()));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };

        let handle = SyncSchedulerHandle {
            coordinator,
            mode,
            request_rx,
            backoff: Backoff::default(),
        };

        (scheduler, handle)
    }

    /// Run a drain cycle and wait for its outcome.
    pub async fn request_drain(&self) -> Result<DrainOutcome> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerRequest::Drain(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| Error::Sync("Failed to receive drain result".to_string()))?
    }

    /// Tell the scheduler the network is back.
    ///
    /// Starts a cycle in [`SyncMode::OnConnectivity`] and
    /// [`SyncMode::Hybrid`]; ignored otherwise. Does not wait for the cycle.
    pub async fn notify_connectivity_restored(&self) -> Result<()> {
        self.send(SchedulerRequest::ConnectivityRestored).await
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    pub async fn mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the background task after the request in progress.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }

    async fn send(&self, request: SchedulerRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Sync("Scheduler not running".to_string()))
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    coordinator: Arc<SyncCoordinator>,
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<SchedulerRequest>,
    backoff: Backoff,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. Returns after
    /// [`SyncScheduler::shutdown`] or once every [`SyncScheduler`] is dropped.
    pub async fn run(mut self) {
        let mut period = self.mode.read().await.period();
        let mut periodic_interval = period.map(periodic);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        None | Some(SchedulerRequest::Shutdown) => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                        Some(SchedulerRequest::Drain(response_tx)) => {
                            debug!("Processing explicit drain request");
                            let result = self.drain().await;
                            let _ = response_tx.send(result);
                        }
                        Some(SchedulerRequest::ConnectivityRestored) => {
                            let mode = self.mode.read().await.clone();
                            if mode.drains_on_connectivity() {
                                info!("Connectivity restored; draining");
                                self.backoff.reset();
                                let _ = self.drain().await;
                            } else {
                                debug!("Connectivity notification ignored (mode: {:?})", mode);
                            }
                        }
                    }
                }

                _ = wait_for_periodic(&mut periodic_interval) => {
                    if self.backoff.allows_automatic(&self.coordinator.config().retry) {
                        debug!("Triggering periodic drain");
                        let _ = self.drain().await;
                    } else {
                        debug!(
                            "Skipping periodic drain after {} failed cycles",
                            self.backoff.failed_cycles()
                        );
                    }
                }
            }

            let expected = self.mode.read().await.period();
            if expected != period {
                period = expected;
                periodic_interval = period.map(periodic);
            }
        }
    }

    async fn drain(&mut self) -> Result<DrainOutcome> {
        let result = self.coordinator.drain().await;
        let retry = &self.coordinator.config().retry;
        match &result {
            Ok(DrainOutcome::Completed(report)) if report.failed > 0 => {
                self.backoff.record_failure(retry);
            }
            Ok(DrainOutcome::Completed(_)) => self.backoff.reset(),
            Ok(DrainOutcome::Coalesced) => {}
            Err(e) => {
                error!("Drain failed: {}", e);
                self.backoff.record_failure(retry);
            }
        }
        result
    }
}

/// Interval whose first tick is one full period away.
fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn wait_for_periodic(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
