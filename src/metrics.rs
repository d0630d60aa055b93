use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Engine counters; one instance per engine, shared with its notification tasks
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub transitions: AtomicU64,
    pub decisions: AtomicU64,
    pub conflicts: AtomicU64,
    pub token_redemptions: AtomicU64,
    pub notification_failures: AtomicU64,
    pub timeouts: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_redemption(&self) {
        self.token_redemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_failure(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Notification delivery failed");
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            transitions: self.transitions.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            token_redemptions: self.token_redemptions.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.snapshot();
        info!(
            transitions = stats.transitions,
            decisions = stats.decisions,
            conflicts = stats.conflicts,
            token_redemptions = stats.token_redemptions,
            notification_failures = stats.notification_failures,
            timeouts = stats.timeouts,
            "Engine metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EngineStats {
    pub transitions: u64,
    pub decisions: u64,
    pub conflicts: u64,
    pub token_redemptions: u64,
    pub notification_failures: u64,
    pub timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = EngineMetrics::new();
        metrics.record_transition();
        metrics.record_transition();
        metrics.record_decision();
        metrics.record_conflict();

        let stats = metrics.snapshot();
        assert_eq!(stats.transitions, 2);
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.token_redemptions, 0);
    }
}
