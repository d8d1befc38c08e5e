//! Order gateway capability.
//!
//! The engine never talks to an exchange directly; everything goes through
//! this trait, wrapped by the resilience layer. Authentication, signing and
//! rate-limit headers belong to the binding that implements it.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::OrderSide;
use crate::error::GatewayResult;

/// Acknowledgement returned by a successful order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Exchange-side order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Partial,
    Filled,
    Failed,
}

impl OrderState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Failed)
    }
}

/// Fill snapshot for a previously placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub state: OrderState,
    pub filled_amount: Decimal,
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Place a market order denominated in quote currency.
    async fn place_order(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
    ) -> GatewayResult<OrderAck>;

    /// Query the state of a previously placed order.
    async fn get_order_status(&self, account_id: &str, order_id: &str)
        -> GatewayResult<OrderFill>;

    /// Holdings per symbol, quote currency included.
    async fn get_balance(&self, account_id: &str) -> GatewayResult<HashMap<String, Decimal>>;

    /// Latest trade price for a symbol.
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Decimal>;
}
