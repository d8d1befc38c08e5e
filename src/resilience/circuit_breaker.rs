//! Gateway circuit breaker.
//!
//! Wraps every exchange call with fault isolation: after a run of transient
//! failures the breaker opens and calls fail fast with `ServiceUnavailable`
//! instead of piling load onto a degraded endpoint. After a cooldown a
//! single probe is let through; its outcome decides Closed or Open.
//!
//! Breakers are keyed by service id and looked up through [`BreakerRegistry`]
//! rather than any ambient global state.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult, Result};
use crate::persistence::PersistenceAdapter;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failure threshold exceeded, calls fail fast
    Open,
    /// Cooldown elapsed, a single probe call is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to stay Open before allowing a probe (seconds)
    pub cooldown_secs: u64,
    /// Cooldown multiplier applied when a probe fails
    pub cooldown_extension_factor: u32,
    /// Upper bound on the extended cooldown (seconds)
    pub max_cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            cooldown_extension_factor: 2,
            max_cooldown_secs: 600,
        }
    }
}

/// Persisted breaker snapshot, updated through the store's CAS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
    pub cooldown_extensions: u32,
    pub version: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    cooldown_extensions: u32,
    version: u64,
}

/// Circuit breaker for one gateway service
pub struct CircuitBreaker {
    service_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service_id: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            service_id: service_id.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown_until: None,
                probe_in_flight: false,
                cooldown_extensions: 0,
                version: 0,
            }),
        }
    }

    /// Rebuild a breaker from its persisted snapshot. An in-flight probe at
    /// crash time is released; the process that held it is gone.
    pub fn from_snapshot(snapshot: &CircuitBreakerState, config: CircuitBreakerConfig) -> Self {
        Self {
            service_id: snapshot.service_id.clone(),
            config,
            inner: Mutex::new(BreakerInner {
                state: snapshot.state,
                consecutive_failures: snapshot.consecutive_failures,
                opened_at: snapshot.opened_at,
                cooldown_until: snapshot.cooldown_until,
                probe_in_flight: false,
                cooldown_extensions: snapshot.cooldown_extensions,
                version: snapshot.version,
            }),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Run a gateway call under the breaker.
    ///
    /// Open and no cooldown elapsed: fails fast with `ServiceUnavailable`
    /// without invoking `op`. HalfOpen admits exactly one probe; concurrent
    /// callers also get `ServiceUnavailable` until the probe resolves.
    pub async fn call<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.acquire().await?;
        let result = op().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(err) => self.record_failure(err).await,
        }
        result
    }

    async fn acquire(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .cooldown_until
                    .map(|until| Utc::now() >= until)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.version += 1;
                    info!(service = %self.service_id, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(GatewayError::ServiceUnavailable {
                        service: self.service_id.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(GatewayError::ServiceUnavailable {
                        service: self.service_id.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.probe_in_flight = false;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!(service = %self.service_id, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.cooldown_until = None;
        inner.cooldown_extensions = 0;
        inner.version += 1;
    }

    async fn record_failure(&self, err: &GatewayError) {
        if !err.counts_against_breaker() {
            // A definitive non-transient response still proves the endpoint
            // is reachable, which is all a probe needs to know.
            let inner = self.inner.lock().await;
            if inner.state == CircuitState::HalfOpen {
                drop(inner);
                self.record_success().await;
            }
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.probe_in_flight = false;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.cooldown_extensions += 1;
                let cooldown = self.extended_cooldown(inner.cooldown_extensions);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Utc::now());
                inner.cooldown_until = Some(Utc::now() + cooldown);
                inner.version += 1;
                warn!(
                    service = %self.service_id,
                    cooldown_secs = cooldown.num_seconds(),
                    "probe failed, circuit breaker re-opened"
                );
            }
            CircuitState::Closed => {
                debug!(
                    service = %self.service_id,
                    failures = inner.consecutive_failures,
                    "gateway failure recorded"
                );
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Utc::now());
                    inner.cooldown_until =
                        Some(Utc::now() + Duration::seconds(self.config.cooldown_secs as i64));
                    inner.version += 1;
                    warn!(
                        service = %self.service_id,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn extended_cooldown(&self, extensions: u32) -> Duration {
        let factor = (self.config.cooldown_extension_factor as u64)
            .saturating_pow(extensions)
            .max(1);
        let secs = self
            .config
            .cooldown_secs
            .saturating_mul(factor)
            .min(self.config.max_cooldown_secs);
        Duration::seconds(secs as i64)
    }

    /// Manual operator reset back to Closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cooldown_until = None;
        inner.probe_in_flight = false;
        inner.cooldown_extensions = 0;
        inner.version += 1;
        info!(service = %self.service_id, "circuit breaker manually reset");
    }

    pub async fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock().await;
        CircuitBreakerState {
            service_id: self.service_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            cooldown_until: inner.cooldown_until,
            probe_in_flight: inner.probe_in_flight,
            cooldown_extensions: inner.cooldown_extensions,
            version: inner.version,
        }
    }

    /// Persist the current snapshot through the store's CAS and adopt the
    /// version it assigns.
    pub async fn persist_to(&self, store: &dyn PersistenceAdapter) -> Result<()> {
        let snapshot = self.snapshot().await;
        let new_version = store.save_breaker(&snapshot).await?;
        self.inner.lock().await.version = new_version;
        Ok(())
    }
}

/// Explicit per-service breaker state, looked up by service id
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Rebuild the registry from persisted snapshots.
    pub async fn restore(
        config: CircuitBreakerConfig,
        store: &dyn PersistenceAdapter,
    ) -> Result<Self> {
        let registry = Self::new(config.clone());
        for snapshot in store.list_breakers().await? {
            let breaker = CircuitBreaker::from_snapshot(&snapshot, config.clone());
            registry
                .breakers
                .insert(snapshot.service_id.clone(), Arc::new(breaker));
        }
        Ok(registry)
    }

    pub fn get(&self, service_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service_id, self.config.clone()))
            })
            .clone()
    }

    pub async fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let mut out = Vec::with_capacity(self.breakers.len());
        for entry in self.breakers.iter() {
            out.push(entry.value().snapshot().await);
        }
        out
    }

    pub async fn persist_all(&self, store: &dyn PersistenceAdapter) -> Result<()> {
        for entry in self.breakers.iter() {
            entry.value().persist_to(store).await?;
        }
        Ok(())
    }
}
