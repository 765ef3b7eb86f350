//! In-memory paper exchange
//!
//! Immediate-fill simulation used for paper trading mode and as the test
//! double for reconciliation and lifecycle logic. Market orders fill at
//! the configured mark price; trigger orders rest until cancelled (they
//! are never simulated through to execution).

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

use super::{ExchangeClient, ExchangeError, ExchangeResult, OpenOrder, OrderAck, Position};
use crate::types::{Candle, Side};

#[derive(Debug, Default)]
struct PaperState {
    mark_price: f64,
    free_balance: f64,
    candles: Vec<Candle>,
    position: Option<Position>,
    orders: Vec<OpenOrder>,
    next_order_id: u64,
    leverage: Option<u32>,
    margin_mode: Option<String>,
    /// When false, entry market orders are acked but no position appears
    fill_market_orders: bool,
    /// When true, entry market orders are rejected for lack of margin
    reject_entries: bool,
    /// When true, order queries fail with an API error
    fail_order_queries: bool,
}

/// Paper-trading exchange with immediate fills
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(free_balance: f64, mark_price: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                mark_price,
                free_balance,
                fill_market_orders: true,
                ..Default::default()
            }),
        }
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.state.lock().unwrap().candles = candles;
    }

    pub fn set_mark_price(&self, price: f64) {
        self.state.lock().unwrap().mark_price = price;
    }

    /// Install an exchange-side position directly (a "foreign" position
    /// from the bot's point of view).
    pub fn set_position(&self, position: Option<Position>) {
        self.state.lock().unwrap().position = position;
    }

    /// Install an exchange-side resting order directly
    pub fn add_order(&self, order: OpenOrder) {
        self.state.lock().unwrap().orders.push(order);
    }

    /// Entry market orders will be acked without producing a position
    pub fn swallow_market_orders(&self) {
        self.state.lock().unwrap().fill_market_orders = false;
    }

    /// Entry market orders will be rejected for insufficient margin
    pub fn deny_funds(&self) {
        self.state.lock().unwrap().reject_entries = true;
    }

    /// Make order queries fail, simulating an exchange outage
    pub fn break_order_queries(&self, broken: bool) {
        self.state.lock().unwrap().fail_order_queries = broken;
    }

    pub fn position(&self) -> Option<Position> {
        self.state.lock().unwrap().position
    }

    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.state.lock().unwrap().orders.clone()
    }

    /// Count of protective stops for `side` currently resting
    pub fn stop_count(&self, side: Side) -> usize {
        self.state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.is_protective_stop(side))
            .count()
    }

    fn next_id(state: &mut PaperState) -> String {
        state.next_order_id += 1;
        format!("paper-{}", state.next_order_id)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let state = self.state.lock().unwrap();
        let start = state.candles.len().saturating_sub(limit);
        Ok(state.candles[start..].to_vec())
    }

    async fn fetch_position(&self, _symbol: &str) -> ExchangeResult<Option<Position>> {
        Ok(self.state.lock().unwrap().position)
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        let state = self.state.lock().unwrap();
        if state.fail_order_queries {
            return Err(ExchangeError::Api {
                code: "50000".to_string(),
                message: "simulated outage".to_string(),
            });
        }
        Ok(state.orders.clone())
    }

    async fn fetch_free_balance(&self) -> ExchangeResult<f64> {
        Ok(self.state.lock().unwrap().free_balance)
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        side: &str,
        amount: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock().unwrap();

        if !reduce_only && state.reject_entries {
            return Err(ExchangeError::InsufficientFunds);
        }
        let id = Self::next_id(&mut state);

        if reduce_only {
            info!(side, amount, "paper: reduce-only market order closes position");
            state.position = None;
            return Ok(OrderAck { id });
        }

        if state.fill_market_orders {
            let position_side: Side = side
                .parse()
                .map_err(|e: String| ExchangeError::Response(e))?;
            state.position = Some(Position {
                side: position_side,
                contracts: amount,
                entry_price: state.mark_price,
            });
            info!(side, amount, price = state.mark_price, "paper: market order filled");
        }
        Ok(OrderAck { id })
    }

    async fn place_stop_order(
        &self,
        _symbol: &str,
        side: &str,
        amount: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.orders.push(OpenOrder {
            id: id.clone(),
            side: side.to_string(),
            trigger_price: Some(trigger_price),
            reduce_only: true,
            is_trailing: false,
        });
        info!(side, amount, trigger_price, "paper: stop order placed");
        Ok(OrderAck { id })
    }

    async fn place_trailing_stop(
        &self,
        _symbol: &str,
        side: &str,
        amount: f64,
        activation_price: f64,
        _callback_rate: f64,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        // Rests exactly as the live client reports it back: the
        // activation price sits in the trigger field, with the trailing
        // marker telling it apart from a fixed stop. Activation itself is
        // not simulated.
        state.orders.push(OpenOrder {
            id: id.clone(),
            side: side.to_string(),
            trigger_price: Some(activation_price),
            reduce_only: true,
            is_trailing: true,
        });
        info!(side, amount, activation_price, "paper: trailing stop placed");
        Ok(OrderAck { id })
    }

    async fn cancel_order(&self, id: &str, _symbol: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.orders.retain(|o| o.id != id);
        Ok(())
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> ExchangeResult<()> {
        self.state.lock().unwrap().orders.clear();
        Ok(())
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.state.lock().unwrap().leverage = Some(leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, mode: &str) -> ExchangeResult<()> {
        self.state.lock().unwrap().margin_mode = Some(mode.to_string());
        Ok(())
    }
}
