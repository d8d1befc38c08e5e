//! Alert dispatch.
//!
//! Routes engine events by severity, rate-limits duplicates to prevent
//! alert storms, and forwards to an external sink without ever blocking the
//! scheduling loop. Delivery (chat webhook, pager, ...) is the sink's
//! problem; dispatch here is fire-and-forget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Log only by default
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AlertEvent {
    pub severity: AlertSeverity,
    pub component: String,
    pub event_type: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        severity: AlertSeverity,
        component: &str,
        event_type: &str,
        message: &str,
    ) -> Self {
        Self {
            severity,
            component: component.to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// External notification capability. Best-effort; implementations must not
/// assume every event arrives.
#[async_trait]
pub trait AlertPort: Send + Sync {
    async fn notify(&self, event: AlertEvent);
}

/// Configuration for the alert manager
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate alerts (seconds)
    pub rate_limit_secs: u64,
    /// Whether info-level events reach the sink
    pub notify_info: bool,
    /// Global cap on sink notifications per minute
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            notify_info: false,
            max_alerts_per_minute: 10,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Central alert dispatcher
pub struct AlertManager {
    config: AlertManagerConfig,
    sink: Option<Arc<dyn AlertPort>>,
    rate_limits: RwLock<HashMap<String, RateLimitState>>,
    sent_this_minute: RwLock<Vec<DateTime<Utc>>>,
    event_tx: tokio::sync::broadcast::Sender<AlertEvent>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            sink: None,
            rate_limits: RwLock::new(HashMap::new()),
            sent_this_minute: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertPort>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Subscribe to every event, unfiltered and unthrottled.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AlertEvent> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(event: &AlertEvent) -> String {
        format!("{}:{}:{}", event.component, event.severity, event.event_type)
    }

    async fn should_rate_limit(&self, event: &AlertEvent) -> bool {
        let key = Self::rate_limit_key(event);
        let now = Utc::now();
        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds() as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    event_type = %event.event_type,
                    suppressed = state.suppressed_count,
                    "rate limiting duplicate alert"
                );
                return true;
            }
            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }
        false
    }

    async fn is_throttled(&self) -> bool {
        let now = Utc::now();
        let minute_ago = now - chrono::Duration::minutes(1);
        let mut sent = self.sent_this_minute.write().await;
        sent.retain(|t| *t > minute_ago);
        if sent.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                sent = sent.len(),
                max = self.config.max_alerts_per_minute,
                "alert throttling engaged"
            );
            return true;
        }
        sent.push(now);
        false
    }

    /// Dispatch an event. Logs, broadcasts to subscribers, and forwards to
    /// the sink on a detached task so the caller never waits on delivery.
    pub async fn notify(&self, event: AlertEvent) {
        let _ = self.event_tx.send(event.clone());

        match event.severity {
            AlertSeverity::Info => {
                info!(component = %event.component, event = %event.event_type, "{}", event.message)
            }
            AlertSeverity::Warning => {
                warn!(component = %event.component, event = %event.event_type, "{}", event.message)
            }
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(component = %event.component, event = %event.event_type, "{}", event.message)
            }
        }

        let should_forward = match event.severity {
            AlertSeverity::Info => self.config.notify_info,
            _ => true,
        };
        if !should_forward {
            return;
        }

        if self.should_rate_limit(&event).await || self.is_throttled().await {
            return;
        }

        if let Some(sink) = self.sink.clone() {
            tokio::spawn(async move {
                sink.notify(event).await;
            });
        }
    }

    pub async fn info(&self, component: &str, event_type: &str, message: &str) {
        self.notify(AlertEvent::new(AlertSeverity::Info, component, event_type, message))
            .await;
    }

    pub async fn warning(&self, component: &str, event_type: &str, message: &str) {
        self.notify(AlertEvent::new(
            AlertSeverity::Warning,
            component,
            event_type,
            message,
        ))
        .await;
    }

    pub async fn error(&self, component: &str, event_type: &str, message: &str) {
        self.notify(AlertEvent::new(
            AlertSeverity::Error,
            component,
            event_type,
            message,
        ))
        .await;
    }

    pub async fn critical(&self, component: &str, event_type: &str, message: &str) {
        self.notify(AlertEvent::new(
            AlertSeverity::Critical,
            component,
            event_type,
            message,
        ))
        .await;
    }

    /// Plan stopped by a non-recoverable failure.
    pub async fn plan_failed(&self, plan_id: &str, account_id: &str, reason: &str) {
        self.notify(
            AlertEvent::new(
                AlertSeverity::Critical,
                "slice_scheduler",
                "plan_failed",
                reason,
            )
            .with_payload(serde_json::json!({
                "plan_id": plan_id,
                "account_id": account_id,
            })),
        )
        .await;
    }

    /// Single slice gave up after exhausting retries.
    pub async fn slice_failed(&self, plan_id: &str, index: u32, reason: &str) {
        self.notify(
            AlertEvent::new(
                AlertSeverity::Error,
                "slice_scheduler",
                "slice_failed",
                reason,
            )
            .with_payload(serde_json::json!({
                "plan_id": plan_id,
                "slice_index": index,
            })),
        )
        .await;
    }

    pub async fn breaker_opened(&self, service_id: &str) {
        self.notify(
            AlertEvent::new(
                AlertSeverity::Error,
                "circuit_breaker",
                "breaker_opened",
                &format!("circuit opened for {service_id}"),
            )
            .with_payload(serde_json::json!({ "service_id": service_id })),
        )
        .await;
    }

    pub async fn task_failed(&self, task_id: &str, account_id: &str, attempts: u32, reason: &str) {
        self.notify(
            AlertEvent::new(
                AlertSeverity::Error,
                "task_coordinator",
                "task_failed",
                reason,
            )
            .with_payload(serde_json::json!({
                "task_id": task_id,
                "account_id": account_id,
                "attempts": attempts,
            })),
        )
        .await;
    }

    /// Suppressed duplicate counts, for the status surface.
    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl AlertPort for CountingSink {
        async fn notify(&self, _event: AlertEvent) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Error < AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn duplicate_alerts_are_rate_limited() {
        let manager = AlertManager::with_defaults();
        let event = AlertEvent::new(AlertSeverity::Warning, "test", "dup", "message");

        assert!(!manager.should_rate_limit(&event).await);
        assert!(manager.should_rate_limit(&event).await);
        assert_eq!(manager.suppressed_counts().await.len(), 1);
    }

    #[tokio::test]
    async fn info_events_skip_the_sink_by_default() {
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let manager = AlertManager::with_defaults().with_sink(sink.clone());

        manager.info("test", "noise", "should stay local").await;
        manager.error("test", "problem", "should be forwarded").await;

        // Let the detached delivery task run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_see_every_event() {
        let manager = AlertManager::with_defaults();
        let mut rx = manager.subscribe();

        manager.info("test", "first", "one").await;
        manager.info("test", "second", "two").await;

        assert_eq!(rx.recv().await.unwrap().event_type, "first");
        assert_eq!(rx.recv().await.unwrap().event_type, "second");
    }
}
