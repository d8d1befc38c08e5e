use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::alert::AlertManagerConfig;
use crate::coordinator::CoordinatorConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub alerts: AlertManagerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Planner and slice scheduling parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// ATR% above which the market counts as volatile
    #[serde(default = "default_atr_threshold")]
    pub atr_volatile_threshold_pct: Decimal,
    /// Exchange minimum order amount in quote currency
    #[serde(default = "default_min_order_amount")]
    pub min_order_amount: Decimal,
    /// Deltas below this execute as a single immediate slice
    #[serde(default = "default_immediate_floor")]
    pub immediate_floor: Decimal,
    /// Smallest currency unit slice amounts are quantized to
    #[serde(default = "default_currency_unit")]
    pub currency_unit: Decimal,
    /// Symbols the planner accepts
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

fn default_atr_threshold() -> Decimal {
    dec!(5)
}

fn default_min_order_amount() -> Decimal {
    dec!(5000)
}

fn default_immediate_floor() -> Decimal {
    dec!(50000)
}

fn default_currency_unit() -> Decimal {
    Decimal::ONE
}

fn default_symbols() -> Vec<String> {
    ["BTC", "ETH", "XRP", "SOL"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            atr_volatile_threshold_pct: default_atr_threshold(),
            min_order_amount: default_min_order_amount(),
            immediate_floor: default_immediate_floor(),
            currency_unit: default_currency_unit(),
            symbols: default_symbols(),
        }
    }
}

/// Retry and circuit-breaker parameters for gateway calls
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TEMPO_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TEMPO_EXECUTION__MIN_ORDER_AMOUNT, etc.)
            .add_source(
                Environment::with_prefix("TEMPO")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.execution.min_order_amount <= Decimal::ZERO {
            errors.push("min_order_amount must be positive".to_string());
        }

        if self.execution.currency_unit <= Decimal::ZERO {
            errors.push("currency_unit must be positive".to_string());
        }

        if self.execution.immediate_floor < self.execution.min_order_amount {
            errors.push("immediate_floor must not be below min_order_amount".to_string());
        }

        if self.execution.symbols.is_empty() {
            errors.push("at least one symbol must be configured".to_string());
        }

        if self.resilience.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }

        if self.resilience.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be at least 1".to_string());
        }

        if self.coordinator.max_concurrency == 0 {
            errors.push("coordinator.max_concurrency must be at least 1".to_string());
        }

        if self.coordinator.task_max_attempts == 0 {
            errors.push("coordinator.task_max_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            resilience: ResilienceConfig::default(),
            coordinator: CoordinatorConfig::default(),
            alerts: AlertManagerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_collects_all_violations() {
        let mut config = AppConfig::default();
        config.execution.min_order_amount = Decimal::ZERO;
        config.execution.symbols.clear();
        config.coordinator.max_concurrency = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn default_regime_parameters_match_exchange_floor() {
        let config = ExecutionConfig::default();
        assert_eq!(config.min_order_amount, dec!(5000));
        assert_eq!(config.atr_volatile_threshold_pct, dec!(5));
        assert!(config.symbols.contains(&"BTC".to_string()));
    }
}
