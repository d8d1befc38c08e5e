use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum TempoError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Planning errors
    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    #[error("Plan requires operator clearance: {0}")]
    PlanRequiresClearance(String),

    // Persistence errors
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {entity} {id}: expected {expected}, stored {stored}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        stored: u64,
    },

    // Gateway errors (classified, see GatewayError)
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TempoError
pub type Result<T> = std::result::Result<T, TempoError>;

/// Failures surfaced by the order gateway, carrying enough structure for the
/// retry and circuit-breaker layers to classify them.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Unsupported symbol: {symbol}")]
    InvalidSymbol { symbol: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Service unavailable: circuit open for {service}")]
    ServiceUnavailable { service: String },
}

/// Failure classification driving retry and breaker behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeout, rate limit, upstream 5xx. Retryable; counts against the breaker.
    Transient,
    /// Invalid symbol, revoked permission, rejection. Not retryable; not the
    /// gateway's fault, so the breaker is untouched.
    Permanent,
    /// Terminal by design. The owning plan fails and stays failed until an
    /// operator clears it.
    InsufficientBalance,
    /// Fail-fast from an open circuit. The caller defers rather than retries.
    CircuitOpen,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Permanent => write!(f, "permanent"),
            FailureClass::InsufficientBalance => write!(f, "insufficient_balance"),
            FailureClass::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

impl GatewayError {
    pub fn class(&self) -> FailureClass {
        match self {
            GatewayError::Timeout { .. }
            | GatewayError::RateLimited { .. }
            | GatewayError::Upstream { .. } => FailureClass::Transient,
            GatewayError::InvalidSymbol { .. }
            | GatewayError::PermissionDenied(_)
            | GatewayError::OrderRejected(_) => FailureClass::Permanent,
            GatewayError::InsufficientBalance { .. } => FailureClass::InsufficientBalance,
            GatewayError::ServiceUnavailable { .. } => FailureClass::CircuitOpen,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Whether this failure should increment the breaker's failure count.
    pub fn counts_against_breaker(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Result type alias for gateway calls
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
