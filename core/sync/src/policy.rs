//! Caller-supplied policy for giving up on a mutation.
//!
//! The coordinator never decides on its own that a mutation is hopeless.
//! Whether a stale mutation is safe to drop depends on what it does, so
//! the application provides the rule.

use std::collections::HashMap;

use offgrid_storage::PendingMutation;

/// Decides whether a mutation should be dropped without replaying it.
pub trait AbandonPolicy: Send + Sync {
    fn should_abandon(&self, mutation: &PendingMutation) -> bool;
}

/// Keep retrying forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAbandon;

impl AbandonPolicy for NeverAbandon {
    fn should_abandon(&self, _mutation: &PendingMutation) -> bool {
        false
    }
}

impl<F> AbandonPolicy for F
where
    F: Fn(&PendingMutation) -> bool + Send + Sync,
{
    fn should_abandon(&self, mutation: &PendingMutation) -> bool {
        self(mutation)
    }
}

/// Abandon once the retry counter exceeds a per-kind ceiling.
///
/// Kinds without a ceiling fall back to the default, and are kept forever
/// if there is none.
#[derive(Debug, Default, Clone)]
pub struct RetryCeiling {
    default: Option<u32>,
    per_kind: HashMap<String, u32>,
}

impl RetryCeiling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ceiling for kinds not listed explicitly.
    pub fn with_default(mut self, ceiling: u32) -> Self {
        self.default = Some(ceiling);
        self
    }

    /// Ceiling for one mutation kind.
    pub fn with_ceiling(mut self, kind: impl Into<String>, ceiling: u32) -> Self {
        self.per_kind.insert(kind.into(), ceiling);
        self
    }

    fn ceiling_for(&self, kind: &str) -> Option<u32> {
        self.per_kind.get(kind).copied().or(self.default)
    }
}

impl AbandonPolicy for RetryCeiling {
    fn should_abandon(&self, mutation: &PendingMutation) -> bool {
        self.ceiling_for(&mutation.kind)
            .map(|ceiling| mutation.retries > ceiling)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mutation(kind: &str, retries: u32) -> PendingMutation {
        PendingMutation {
            id: 1,
            kind: kind.to_string(),
            payload: Vec::new(),
            enqueued_at: Utc::now(),
            retries,
        }
    }

    #[test]
    fn test_never_abandon() {
        assert!(!NeverAbandon.should_abandon(&mutation("checkin", u32::MAX)));
    }

    #[test]
    fn test_retry_ceiling_per_kind() {
        let policy = RetryCeiling::new().with_ceiling("checkin", 3);

        assert!(!policy.should_abandon(&mutation("checkin", 3)));
        assert!(policy.should_abandon(&mutation("checkin", 4)));
        // No ceiling for payments, no default: keep forever.
        assert!(!policy.should_abandon(&mutation("payment", 1000)));
    }

    #[test]
    fn test_retry_ceiling_default() {
        let policy = RetryCeiling::new()
            .with_default(5)
            .with_ceiling("payment", u32::MAX);

        assert!(policy.should_abandon(&mutation("rating", 6)));
        assert!(!policy.should_abandon(&mutation("payment", 6)));
    }

    #[test]
    fn test_closure_policy() {
        let policy = |m: &PendingMutation| m.kind == "checkin" && m.retries >= 2;
        assert!(policy.should_abandon(&mutation("checkin", 2)));
        assert!(!policy.should_abandon(&mutation("checkin", 1)));
    }
}
