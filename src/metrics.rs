//! Lock-free metrics aggregation for the cross-server event service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitState;

#[derive(Debug, Default)]
struct PerTypeCounts {
    processed: usize,
    failed: usize,
}

/// Aggregates counters across the lifetime of one
/// [`crate::event_service::CrossServerEventService`]. All mutating methods
/// are lock-free except the per-type breakdown, which uses a short-held
/// `RwLock`.
pub struct Metrics {
    start_time: DateTime<Utc>,
    events_processed: AtomicUsize,
    events_broadcast: AtomicUsize,
    broadcast_failures: AtomicUsize,
    retry_attempts: AtomicUsize,
    circuit_breaker_opens: AtomicUsize,
    processing_nanos_sum: AtomicU64,
    processing_nanos_count: AtomicU64,
    processing_nanos_min: AtomicU64,
    processing_nanos_max: AtomicU64,
    per_type: RwLock<HashMap<String, PerTypeCounts>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").field("snapshot", &self.snapshot(CircuitState::Closed)).finish()
    }
}

/// Immutable, internally-consistent point-in-time view of [`Metrics`] plus
/// the circuit breaker state reading taken at the same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub start_time: DateTime<Utc>,
    pub snapshot_time: DateTime<Utc>,
    pub events_processed: usize,
    pub events_broadcast: usize,
    pub broadcast_failures: usize,
    pub retry_attempts: usize,
    pub circuit_breaker_opens: usize,
    pub success_rate_percent: f64,
    pub avg_processing_nanos: u64,
    pub min_processing_nanos: u64,
    pub max_processing_nanos: u64,
    pub circuit_breaker_state: CircuitState,
    pub per_type: HashMap<String, (usize, usize)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            events_processed: AtomicUsize::new(0),
            events_broadcast: AtomicUsize::new(0),
            broadcast_failures: AtomicUsize::new(0),
            retry_attempts: AtomicUsize::new(0),
            circuit_breaker_opens: AtomicUsize::new(0),
            processing_nanos_sum: AtomicU64::new(0),
            processing_nanos_count: AtomicU64::new(0),
            processing_nanos_min: AtomicU64::new(u64::MAX),
            processing_nanos_max: AtomicU64::new(0),
            per_type: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_event_processed(&self, event_type: &str, processing_nanos: u64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos_sum.fetch_add(processing_nanos, Ordering::Relaxed);
        self.processing_nanos_count.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos_min.fetch_min(processing_nanos, Ordering::Relaxed);
        self.processing_nanos_max.fetch_max(processing_nanos, Ordering::Relaxed);

        let mut map = self.per_type.write().expect("Metrics.record_event_processed: lock poisoned");
        map.entry(event_type.to_string()).or_default().processed += 1;
    }

    pub fn record_event_processing_failed(&self, event_type: &str) {
        let mut map = self.per_type.write().expect("Metrics.record_event_processing_failed: lock poisoned");
        map.entry(event_type.to_string()).or_default().failed += 1;
    }

    pub fn record_broadcast_success(&self) {
        self.events_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast_failure(&self) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_attempt(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_open(&self) {
        self.circuit_breaker_opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Build a self-contained, internally-consistent snapshot. `breaker_state`
    /// is read by the caller (who owns the breaker) and passed in so the
    /// whole struct reflects one instant rather than requiring a second,
    /// unsynchronized call to observe the breaker.
    pub fn snapshot(&self, breaker_state: CircuitState) -> MetricsSnapshot {
        let count = self.processing_nanos_count.load(Ordering::Relaxed);
        let sum = self.processing_nanos_sum.load(Ordering::Relaxed);
        let avg = if count == 0 { 0 } else { sum / count };
        let min = match self.processing_nanos_min.load(Ordering::Relaxed) {
            u64::MAX => 0,
            other => other,
        };

        let events_broadcast = self.events_broadcast.load(Ordering::Relaxed);
        let broadcast_failures = self.broadcast_failures.load(Ordering::Relaxed);
        let total_broadcasts = events_broadcast + broadcast_failures;
        let success_rate_percent = if total_broadcasts == 0 {
            100.0
        } else {
            events_broadcast as f64 / total_broadcasts as f64 * 100.0
        };

        let per_type = self
            .per_type
            .read()
            .expect("Metrics.snapshot: lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), (v.processed, v.failed)))
            .collect();

        MetricsSnapshot {
            start_time: self.start_time,
            snapshot_time: Utc::now(),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_broadcast,
            broadcast_failures,
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            circuit_breaker_opens: self.circuit_breaker_opens.load(Ordering::Relaxed),
            success_rate_percent,
            avg_processing_nanos: avg,
            min_processing_nanos: min,
            max_processing_nanos: self.processing_nanos_max.load(Ordering::Relaxed),
            circuit_breaker_state: breaker_state,
            per_type,
        }
    }

    /// Emit the current snapshot as one structured log line.
    pub fn log_current(&self, breaker_state: CircuitState) {
        let snapshot = self.snapshot(breaker_state);
        tracing::info!(
            events_processed = snapshot.events_processed,
            events_broadcast = snapshot.events_broadcast,
            broadcast_failures = snapshot.broadcast_failures,
            retry_attempts = snapshot.retry_attempts,
            circuit_breaker_opens = snapshot.circuit_breaker_opens,
            success_rate_percent = snapshot.success_rate_percent,
            avg_processing_nanos = snapshot.avg_processing_nanos,
            min_processing_nanos = snapshot.min_processing_nanos,
            max_processing_nanos = snapshot.max_processing_nanos,
            circuit_breaker_state = ?snapshot.circuit_breaker_state,
            "conexus metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let metrics = Metrics::new();
        let snap = metrics.snapshot(CircuitState::Closed);
        assert_eq!(snap.events_processed, 0);
        assert_eq!(snap.min_processing_nanos, 0);
        assert_eq!(snap.max_processing_nanos, 0);
        assert_eq!(snap.success_rate_percent, 100.0);
        assert!(snap.snapshot_time >= snap.start_time);
    }

    #[test]
    fn tracks_min_avg_max_processing_time() {
        let metrics = Metrics::new();
        metrics.record_event_processed("status", 100);
        metrics.record_event_processed("status", 300);
        metrics.record_event_processed("status", 200);

        let snap = metrics.snapshot(CircuitState::Closed);
        assert_eq!(snap.events_processed, 3);
        assert_eq!(snap.min_processing_nanos, 100);
        assert_eq!(snap.max_processing_nanos, 300);
        assert_eq!(snap.avg_processing_nanos, 200);
    }

    #[test]
    fn tracks_per_type_processed_and_failed_counts() {
        let metrics = Metrics::new();
        metrics.record_event_processed("status", 10);
        metrics.record_event_processed("status", 10);
        metrics.record_event_processing_failed("status");

        let snap = metrics.snapshot(CircuitState::Closed);
        assert_eq!(snap.per_type.get("status"), Some(&(2, 1)));
    }

    #[test]
    fn tracks_broadcast_retry_and_breaker_counters() {
        let metrics = Metrics::new();
        metrics.record_broadcast_success();
        metrics.record_broadcast_failure();
        metrics.record_retry_attempt();
        metrics.record_circuit_breaker_open();

        let snap = metrics.snapshot(CircuitState::Open);
        assert_eq!(snap.events_broadcast, 1);
        assert_eq!(snap.broadcast_failures, 1);
        assert_eq!(snap.retry_attempts, 1);
        assert_eq!(snap.circuit_breaker_opens, 1);
        assert_eq!(snap.circuit_breaker_state, CircuitState::Open);
        assert_eq!(snap.success_rate_percent, 50.0);
    }
}
