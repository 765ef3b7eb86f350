//! Exchange interface
//!
//! Typed capability contract over the exchange REST surface. The core
//! logic never sees exchange-specific field naming; it talks to
//! `ExchangeClient` and the structures below. Every error is considered
//! retryable by the next cycle, never fatal to the process.

pub mod bitget;
pub mod paper;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Candle, Side};

pub use bitget::BitgetClient;
pub use paper::PaperExchange;

/// Exchange call failure taxonomy
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange rejected request ({code}): {message}")]
    Api { code: String, message: String },

    /// Distinguished because it signals a non-transient, operator-facing
    /// condition rather than a glitch.
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("malformed exchange response: {0}")]
    Response(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// An open futures position as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub side: Side,
    /// Contract quantity, always positive
    pub contracts: f64,
    pub entry_price: f64,
}

/// An open (resting or trigger) order
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub id: String,
    /// "buy" or "sell"
    pub side: String,
    /// Set for stop/trigger orders. For trailing stops this is the
    /// activation price, not a fixed stop level.
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    /// Trailing stop awaiting activation
    pub is_trailing: bool,
}

impl OpenOrder {
    /// A protective stop for a position on `side`: a reduce-only trigger
    /// order on the closing side. A resting trailing stop does not
    /// qualify; until it activates it guarantees nothing.
    pub fn is_protective_stop(&self, side: Side) -> bool {
        self.trigger_price.is_some()
            && self.reduce_only
            && !self.is_trailing
            && self.side == side.close_order_side()
    }
}

/// Acknowledgement of a submitted order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub id: String,
}

/// Async capability contract for the exchange.
///
/// Implementations: [`BitgetClient`] (live) and [`PaperExchange`]
/// (in-memory simulation, also the test double).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Ordered OHLCV history, oldest first. The final candle may still be
    /// forming; callers decide whether to strip it.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    /// The open position for `symbol`, if any
    async fn fetch_position(&self, symbol: &str) -> ExchangeResult<Option<Position>>;

    /// All open orders for `symbol`, trigger orders included
    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>>;

    /// Free (available) quote-currency balance
    async fn fetch_free_balance(&self) -> ExchangeResult<f64>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck>;

    /// Reduce-only trigger order that closes at market once `trigger_price`
    /// trades
    async fn place_stop_order(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck>;

    /// Trailing stop activating at `activation_price` with the given
    /// callback rate (fraction, e.g. 0.005 for 0.5%)
    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
        activation_price: f64,
        callback_rate: f64,
    ) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, id: &str, symbol: &str) -> ExchangeResult<()>;

    /// Cancel every open order for `symbol`. A no-op on an empty order set.
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    /// Best-effort leverage setup; "already set" responses are not errors
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Best-effort margin mode setup; "already set" responses are not
    /// errors
    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> ExchangeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protective_stop_requires_trigger_close_side_and_reduce_only() {
        let stop = OpenOrder {
            id: "1".into(),
            side: "sell".into(),
            trigger_price: Some(95.0),
            reduce_only: true,
            is_trailing: false,
        };
        assert!(stop.is_protective_stop(Side::Long));
        assert!(!stop.is_protective_stop(Side::Short));

        let entry_side = OpenOrder {
            side: "buy".into(),
            ..stop.clone()
        };
        assert!(!entry_side.is_protective_stop(Side::Long));

        let plain_limit = OpenOrder {
            trigger_price: None,
            ..stop.clone()
        };
        assert!(!plain_limit.is_protective_stop(Side::Long));

        let not_reducing = OpenOrder {
            reduce_only: false,
            ..stop.clone()
        };
        assert!(!not_reducing.is_protective_stop(Side::Long));

        // A trailing stop reports its activation price as a trigger price
        // but is not a protective stop until it activates
        let trailing = OpenOrder {
            is_trailing: true,
            ..stop
        };
        assert!(!trailing.is_protective_stop(Side::Long));
    }
}
