use std::time::Duration;

/// Tunables for the sync engine.
///
/// The defaults match production behavior; tests shrink the durations so
/// retry and backoff paths run in milliseconds.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Automatic delivery attempts per queued mutation before it is marked
    /// failed and left for an explicit user retry.
    pub max_send_attempts: u32,
    /// Backoff after the first failed attempt; doubles per attempt.
    pub backoff_initial: Duration,
    /// Ceiling for the exponential backoff.
    pub backoff_max: Duration,
    /// Bound on any single remote call. A timeout counts as a transient
    /// failure.
    pub remote_timeout: Duration,
    /// Cadence of the outbound worker's periodic scan. Enqueues also wake
    /// the worker directly, so this only bounds retry latency.
    pub worker_tick: Duration,
    /// Buffered capacity of the store event bus.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 20,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(10),
            worker_tick: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Config with near-zero delays for integration tests.
    pub fn fast() -> Self {
        Self {
            max_send_attempts: 3,
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            remote_timeout: Duration::from_secs(2),
            worker_tick: Duration::from_millis(20),
            event_capacity: 256,
        }
    }
}
