//! Per-provider circuit breaker state machine: closed / open / half-open,
//! atomic failure/success counters, and a persistence seam.
//!
//! The state mutation lock and the half-open probe-admission lock are kept
//! deliberately distinct: acquiring a probe must be atomic with respect to
//! other concurrent admitters without serializing on the same lock state
//! mutation uses, so two callers racing `admit()` in half-open can't both
//! observe `probe_in_flight == false`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: std::time::Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: std::time::Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// The persisted shape of one provider's breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub provider_id: i64,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub opened_at: Option<OffsetDateTime>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub half_open_probe_in_flight: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitStoreError {
    #[error("circuit store backend error: {0}")]
    Backend(String),
}

/// Persistence seam: implemented over a relational table in
/// `llmrelay-storage`. Every transition calls `persist`; `load_all` is used
/// once at startup to rehydrate.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn persist(&self, snapshot: &BreakerSnapshot) -> Result<(), CircuitStoreError>;
    async fn load_all(&self) -> Result<Vec<BreakerSnapshot>, CircuitStoreError>;
}

struct StateInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<OffsetDateTime>,
    opened_at: Option<OffsetDateTime>,
    half_open_success_count: u32,
}

/// One provider's breaker. `admit`/`record_outcome` are plain synchronous
/// calls over in-process locks; the async `CircuitBreakerManager` wraps
/// these with the persistence seam.
pub struct CircuitBreaker {
    provider_id: i64,
    config: BreakerConfig,
    inner: Mutex<StateInner>,
    probe_in_flight: Mutex<bool>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(provider_id: i64, config: BreakerConfig) -> Self {
        Self {
            provider_id,
            config,
            inner: Mutex::new(StateInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                half_open_success_count: 0,
            }),
            probe_in_flight: Mutex::new(false),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
        }
    }

    /// Rehydrates from a persisted snapshot. An `open` state whose recovery
    /// window has already elapsed is closed immediately rather than blindly
    /// restored, so a long process downtime can't cause a cold-start lockout.
    pub fn from_snapshot(snapshot: BreakerSnapshot, config: BreakerConfig) -> Self {
        let breaker = Self {
            provider_id: snapshot.provider_id,
            config,
            inner: Mutex::new(StateInner {
                state: snapshot.state,
                consecutive_failures: snapshot.consecutive_failures,
                last_failure_at: snapshot.last_failure_at,
                opened_at: snapshot.opened_at,
                half_open_success_count: 0,
            }),
            probe_in_flight: Mutex::new(false),
            total_requests: AtomicU64::new(snapshot.total_requests),
            total_failures: AtomicU64::new(snapshot.total_failures),
            total_successes: AtomicU64::new(snapshot.total_successes),
        };

        let mut inner = breaker.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open {
            let opened_at = inner.opened_at.unwrap_or_else(OffsetDateTime::now_utc);
            if recovery_elapsed(opened_at, OffsetDateTime::now_utc(), config.recovery_timeout) {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
        }
        drop(inner);
        breaker
    }

    pub fn provider_id(&self) -> i64 {
        self.provider_id
    }

    /// Decides admission, transitioning `open -> half-open` when the
    /// recovery timeout has elapsed. Returns `(admitted, transitioned)` so
    /// callers only persist when the state actually changed.
    pub fn admit(&self) -> (bool, bool) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => (true, false),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                if recovery_elapsed(opened_at, now, self.config.recovery_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_success_count = 0;
                    drop(inner);
                    (self.try_acquire_probe(), true)
                } else {
                    (false, false)
                }
            }
            CircuitState::HalfOpen => {
                drop(inner);
                (self.try_acquire_probe(), false)
            }
        }
    }

    fn try_acquire_probe(&self) -> bool {
        let mut probe = self.probe_in_flight.lock().expect("probe lock poisoned");
        if *probe {
            return false;
        }
        *probe = true;
        true
    }

    /// Records the outcome of an admitted attempt. Returns whether the
    /// breaker's state transitioned (the caller persists only then).
    pub fn record_outcome(&self, failure: bool) -> bool {
        let now = OffsetDateTime::now_utc();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if failure {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let before = inner.state;

        match inner.state {
            CircuitState::Closed => {
                if failure {
                    inner.last_failure_at = Some(now);
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                    }
                } else {
                    inner.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                *self.probe_in_flight.lock().expect("probe lock poisoned") = false;
                if failure {
                    inner.last_failure_at = Some(now);
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.half_open_success_count = 0;
                } else {
                    inner.half_open_success_count += 1;
                    if inner.half_open_success_count >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.opened_at = None;
                        inner.half_open_success_count = 0;
                    }
                }
            }
            CircuitState::Open => {
                // Shouldn't happen — `admit` rejects while open — but a failure
                // observed here (e.g. a racing attempt already in flight) at
                // least refreshes the window instead of leaving stale data.
                if failure {
                    inner.last_failure_at = Some(now);
                    inner.opened_at = Some(now);
                }
            }
        }

        before != inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            provider_id: self.provider_id,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            opened_at: inner.opened_at,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            half_open_probe_in_flight: *self.probe_in_flight.lock().expect("probe lock poisoned"),
        }
    }
}

fn recovery_elapsed(opened_at: OffsetDateTime, now: OffsetDateTime, recovery_timeout: std::time::Duration) -> bool {
    let elapsed_seconds = (now.unix_timestamp() - opened_at.unix_timestamp()).max(0) as u64;
    elapsed_seconds >= recovery_timeout.as_secs()
}

/// Owns every provider's breaker, lazily creating them on first reference,
/// and persists through `CircuitStore` only on actual transitions.
pub struct CircuitBreakerManager {
    config: BreakerConfig,
    breakers: RwLock<HashMap<i64, Arc<CircuitBreaker>>>,
    store: Option<Arc<dyn CircuitStore>>,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, breakers: RwLock::new(HashMap::new()), store: None }
    }

    pub fn with_store(config: BreakerConfig, store: Arc<dyn CircuitStore>) -> Self {
        Self { config, breakers: RwLock::new(HashMap::new()), store: Some(store) }
    }

    /// Rehydrates every known provider's breaker from the store at startup.
    pub async fn rehydrate(config: BreakerConfig, store: Arc<dyn CircuitStore>) -> Result<Self, CircuitStoreError> {
        let snapshots = store.load_all().await?;
        let mut breakers = HashMap::new();
        for snapshot in snapshots {
            let provider_id = snapshot.provider_id;
            breakers.insert(provider_id, Arc::new(CircuitBreaker::from_snapshot(snapshot, config)));
        }
        Ok(Self { config, breakers: RwLock::new(breakers), store: Some(store) })
    }

    fn get_or_create(&self, provider_id: i64) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().expect("breakers lock poisoned").get(&provider_id) {
            return breaker.clone();
        }
        let mut guard = self.breakers.write().expect("breakers lock poisoned");
        guard
            .entry(provider_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider_id, self.config)))
            .clone()
    }

    pub async fn admit(&self, provider_id: i64) -> bool {
        let breaker = self.get_or_create(provider_id);
        let (admitted, transitioned) = breaker.admit();
        if transitioned {
            self.persist(&breaker).await;
        }
        admitted
    }

    pub async fn record_success(&self, provider_id: i64) {
        self.record(provider_id, false).await;
    }

    pub async fn record_failure(&self, provider_id: i64) {
        self.record(provider_id, true).await;
    }

    async fn record(&self, provider_id: i64, failure: bool) {
        let breaker = self.get_or_create(provider_id);
        let transitioned = breaker.record_outcome(failure);
        if transitioned {
            self.persist(&breaker).await;
        }
    }

    async fn persist(&self, breaker: &CircuitBreaker) {
        if let Some(store) = &self.store {
            if let Err(err) = store.persist(&breaker.snapshot()).await {
                tracing::warn!(provider_id = breaker.provider_id(), error = %err, "failed to persist circuit breaker transition");
            }
        }
    }

    /// Read-only snapshot of every known provider's breaker, for the admin
    /// surface's `/admin/circuits` endpoint.
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().expect("breakers lock poisoned").values().map(|b| b.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn fast_config() -> BreakerConfig {
        BreakerConfig { failure_threshold: 5, recovery_timeout: std::time::Duration::from_millis(50), success_threshold: 2 }
    }

    #[test]
    fn opens_after_consecutive_failure_threshold() {
        let breaker = CircuitBreaker::new(1, fast_config());
        for _ in 0..4 {
            assert!(breaker.admit().0);
            breaker.record_outcome(true);
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        assert!(breaker.admit().0);
        breaker.record_outcome(true);
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(!breaker.admit().0);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(1, fast_config());
        for _ in 0..4 {
            breaker.admit();
            breaker.record_outcome(true);
        }
        breaker.admit();
        breaker.record_outcome(false);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout_then_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(1, fast_config());
        for _ in 0..5 {
            breaker.admit();
            breaker.record_outcome(true);
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(!breaker.admit().0);

        thread::sleep(std::time::Duration::from_millis(60));

        let (admitted, transitioned) = breaker.admit();
        assert!(admitted);
        assert!(transitioned);
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);

        breaker.record_outcome(false);
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);

        breaker.admit();
        breaker.record_outcome(false);
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(1, fast_config());
        for _ in 0..5 {
            breaker.admit();
            breaker.record_outcome(true);
        }
        thread::sleep(std::time::Duration::from_millis(60));
        breaker.admit();
        breaker.record_outcome(true);
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
    }

    #[test]
    fn only_one_half_open_probe_admitted_under_concurrency() {
        let breaker = Arc::new(CircuitBreaker::new(1, fast_config()));
        for _ in 0..5 {
            breaker.admit();
            breaker.record_outcome(true);
        }
        thread::sleep(std::time::Duration::from_millis(60));

        const THREADS: usize = 8;
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    breaker.admit().0
                })
            })
            .collect();

        let admitted_count = handles.into_iter().filter(|h| h.join().unwrap_or(false)).count();
        // At most one racer sees a fresh HalfOpen transition worth admitting;
        // everyone else gets the same rejection as `open`.
        assert_eq!(admitted_count, 1);
    }

    #[test]
    fn rehydrating_a_timed_out_open_state_closes_instead_of_locking_out() {
        let snapshot = BreakerSnapshot {
            provider_id: 7,
            state: CircuitState::Open,
            consecutive_failures: 5,
            last_failure_at: Some(OffsetDateTime::now_utc() - time::Duration::seconds(120)),
            opened_at: Some(OffsetDateTime::now_utc() - time::Duration::seconds(120)),
            total_requests: 10,
            total_failures: 5,
            total_successes: 5,
            half_open_probe_in_flight: false,
        };
        let breaker = CircuitBreaker::from_snapshot(snapshot, fast_config());
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        assert!(breaker.admit().0);
    }

    #[test]
    fn rehydrating_a_fresh_open_state_stays_open() {
        let snapshot = BreakerSnapshot {
            provider_id: 7,
            state: CircuitState::Open,
            consecutive_failures: 5,
            last_failure_at: Some(OffsetDateTime::now_utc()),
            opened_at: Some(OffsetDateTime::now_utc()),
            total_requests: 10,
            total_failures: 5,
            total_successes: 5,
            half_open_probe_in_flight: false,
        };
        let breaker = CircuitBreaker::from_snapshot(snapshot, BreakerConfig::default());
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(!breaker.admit().0);
    }
}
