//! Offgrid sync coordinator
//!
//! Replays mutations recorded while offline once the network is back:
//! - One drain cycle at a time; concurrent triggers coalesce
//! - Strict enqueue order, failed mutations keep their place
//! - Client-side rate limiting shared with the application
//! - Caller-defined abandonment of stale mutations
//! - Explicit, connectivity and periodic triggers with backoff

pub mod coordinator;
pub mod handler;
pub mod limiter;
pub mod policy;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use coordinator::{SyncConfig, SyncCoordinator};
pub use handler::{replay_fn, FnReplayHandler, ReplayError, ReplayHandler};
pub use limiter::{AllowAll, RateLimiter, SlidingWindowLimiter};
pub use policy::{AbandonPolicy, NeverAbandon, RetryCeiling};
pub use retry::{Backoff, RetryConfig};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use state::{DrainOutcome, DrainReport, DrainState, SyncStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let config = SyncConfig::default();
        assert_eq!(config.rate_limit_key, "sync:replay");
        assert_eq!(config.sync_mode, SyncMode::OnConnectivity);
        let _retry_config = RetryConfig::default();
        let _stats = SyncStats::default();
        assert!(AllowAll.try_acquire("sync:replay"));
    }

    #[test]
    fn test_config_from_json() {
        let config: SyncConfig = serde_json::from_str(
            r#"{
                "rate_limit_key": "api",
                "sync_mode": { "Periodic": { "interval": { "secs": 30, "nanos": 0 } } },
                "retry": {
                    "max_retries": 3,
                    "initial_delay": { "secs": 1, "nanos": 0 },
                    "max_delay": { "secs": 60, "nanos": 0 },
                    "backoff_multiplier": 2.0,
                    "jitter": false
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.rate_limit_key, "api");
        assert_eq!(
            config.sync_mode,
            SyncMode::Periodic {
                interval: std::time::Duration::from_secs(30)
            }
        );
        assert_eq!(config.retry.max_retries, 3);
    }
}
