//! Order lifecycle management
//!
//! Entry and exit protocols around the exchange. An entry is only
//! considered real once the exchange reports the resulting position; the
//! protective stop is placed after that confirmation, never before.
//! Every state-mutating step persists immediately after its exchange
//! confirmation, so a crash mid-protocol leaves the store consistent
//! with the last confirmed action.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::BotConfig;
use crate::exchange::{ExchangeClient, ExchangeError, Position};
use crate::notify::Notifier;
use crate::signal::{indicators, ATR_PERIOD};
use crate::store::StateStore;
use crate::types::{Candle, Side};

/// Position-query attempts while waiting for a market-order fill
const FILL_VERIFY_ATTEMPTS: usize = 5;

/// High-volatility regime: ATR above this multiple of its recent mean
const HIGH_VOL_FACTOR: f64 = 1.5;
/// Low-volatility regime: ATR below this multiple of its recent mean
const LOW_VOL_FACTOR: f64 = 0.7;
/// Trailing window for the ATR mean the regime is judged against
const ATR_MEAN_WINDOW: usize = 50;

/// Reward ratio adjusted for the current volatility regime.
///
/// Wide targets in fast markets, tighter ones in quiet markets, clamped
/// to [1.5, 5.0].
pub fn adjusted_risk_reward(base_rr: f64, atr: f64, avg_atr: f64) -> f64 {
    if atr.is_nan() || avg_atr.is_nan() || avg_atr <= 0.0 {
        return base_rr;
    }
    if atr > avg_atr * HIGH_VOL_FACTOR {
        (base_rr * 1.3).min(5.0)
    } else if atr < avg_atr * LOW_VOL_FACTOR {
        (base_rr * 0.8).max(1.5)
    } else {
        base_rr
    }
}

/// Everything computed before an order is sent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryPlan {
    pub contracts: f64,
    pub stop_distance: f64,
    pub risk_reward: f64,
}

/// Confirmed entry, as reported back by the exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryReport {
    pub side: Side,
    pub contracts: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit: f64,
    pub trailing_activation: f64,
}

/// Entry and exit protocol driver
pub struct OrderLifecycleManager<'a, E: ExchangeClient> {
    exchange: &'a E,
    store: &'a StateStore,
    notifier: &'a Notifier,
    config: &'a BotConfig,
    fill_delay: Duration,
    settle_delay: Duration,
}

impl<'a, E: ExchangeClient> OrderLifecycleManager<'a, E> {
    pub fn new(
        exchange: &'a E,
        store: &'a StateStore,
        notifier: &'a Notifier,
        config: &'a BotConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            notifier,
            config,
            fill_delay: Duration::from_secs(1),
            settle_delay: Duration::from_millis(500),
        }
    }

    /// Shorten the settle and fill-poll delays (tests)
    pub fn with_delays(mut self, fill_delay: Duration, settle_delay: Duration) -> Self {
        self.fill_delay = fill_delay;
        self.settle_delay = settle_delay;
        self
    }

    /// Sizing from free balance and stop distance: the amount lost if
    /// the stop is hit equals `risk_per_trade_pct` of the balance.
    pub fn plan_entry(&self, balance: f64, entry_price: f64, candles: &[Candle]) -> EntryPlan {
        let risk = &self.config.risk;
        let atr_series = indicators::atr(candles, ATR_PERIOD);
        let atr = atr_series.last().copied().unwrap_or(f64::NAN);
        // Regime is judged against recent volatility, not the whole
        // fetched history
        let recent = &atr_series[atr_series.len().saturating_sub(ATR_MEAN_WINDOW)..];
        let avg_atr = mean_ignoring_nan(recent);

        let atr_distance = if atr.is_nan() {
            0.0
        } else {
            atr * risk.atr_multiplier_sl
        };
        let stop_distance = atr_distance.max(entry_price * risk.min_sl_pct / 100.0);

        let risk_usdt = balance * risk.risk_per_trade_pct / 100.0;
        let contracts = risk_usdt / stop_distance;

        EntryPlan {
            contracts,
            stop_distance,
            risk_reward: adjusted_risk_reward(risk.risk_reward_ratio, atr, avg_atr),
        }
    }

    /// Run the full entry protocol for `side`.
    ///
    /// Margin setup, sizing, market order, bounded fill verification,
    /// one protective stop, trailing stop, persistence, cooldown. A
    /// missing fill is a hard failure that leaves the store untouched.
    pub async fn enter(
        &self,
        side: Side,
        entry_hint: f64,
        candles: &[Candle],
    ) -> Result<EntryReport> {
        let symbol = &self.config.market.symbol;
        let risk = &self.config.risk;

        // Account setup failures are tolerated; the exchange rejects the
        // order itself if the mode is genuinely unusable.
        if let Err(e) = self
            .exchange
            .set_margin_mode(symbol, &risk.margin_mode)
            .await
        {
            warn!(error = %e, "margin mode setup failed, continuing");
        }
        if let Err(e) = self.exchange.set_leverage(symbol, risk.leverage).await {
            warn!(error = %e, "leverage setup failed, continuing");
        }

        let balance = self
            .exchange
            .fetch_free_balance()
            .await
            .context("entry: balance query failed")?;
        let plan = self.plan_entry(balance, entry_hint, candles);
        if !plan.contracts.is_finite() || plan.contracts <= 0.0 {
            bail!("entry: computed size {} is not tradable", plan.contracts);
        }

        info!(
            %side,
            contracts = plan.contracts,
            stop_distance = plan.stop_distance,
            rr = plan.risk_reward,
            "submitting entry order"
        );
        match self
            .exchange
            .place_market_order(symbol, side.entry_order_side(), plan.contracts, false)
            .await
        {
            Ok(_) => {}
            Err(ExchangeError::InsufficientFunds) => {
                self.notifier
                    .notify(&format!("{symbol}: entry rejected, insufficient margin"))
                    .await;
                bail!("entry: insufficient funds");
            }
            Err(e) => return Err(e).context("entry: market order rejected"),
        }

        let position = self.verify_fill(side).await?;
        let entry_price = position.entry_price;

        // Stop and targets from the actual fill price, not the hint
        let stop_price = match side {
            Side::Long => entry_price - plan.stop_distance,
            Side::Short => entry_price + plan.stop_distance,
        };
        let take_profit = match side {
            Side::Long => entry_price + plan.stop_distance * plan.risk_reward,
            Side::Short => entry_price - plan.stop_distance * plan.risk_reward,
        };
        let trailing_activation = match side {
            Side::Long => entry_price + plan.stop_distance * risk.trailing_stop_activation_rr,
            Side::Short => entry_price - plan.stop_distance * risk.trailing_stop_activation_rr,
        };

        if let Err(e) = self
            .exchange
            .place_stop_order(
                symbol,
                side.close_order_side(),
                position.contracts,
                stop_price,
            )
            .await
        {
            error!(error = %e, "stop placement failed after confirmed fill");
            self.notifier
                .alert(&format!(
                    "{symbol}: {side} position at {entry_price:.6} has NO stop loss ({e})"
                ))
                .await;
            return Err(e).context("entry: protective stop placement failed");
        }
        self.store
            .set_position(symbol, side, Some(stop_price))?;

        // Trailing stop is an enhancement; its loss is not fatal
        if let Err(e) = self
            .exchange
            .place_trailing_stop(
                symbol,
                side.close_order_side(),
                position.contracts,
                trailing_activation,
                risk.trailing_stop_callback_rate_pct / 100.0,
            )
            .await
        {
            warn!(error = %e, "trailing stop placement failed, fixed stop remains");
        }

        let key = self.config.lock_key();
        self.store.set_trade_lock(&key, risk.trade_lock_minutes)?;
        self.store.set_last_entry_price(&key, entry_price)?;

        let report = EntryReport {
            side,
            contracts: position.contracts,
            entry_price,
            stop_price,
            take_profit,
            trailing_activation,
        };
        info!(?report, "entry complete");
        self.notifier
            .notify(&format!(
                "{symbol}: opened {side} {:.6} @ {entry_price:.6}, SL {stop_price:.6}, TP {take_profit:.6}",
                position.contracts
            ))
            .await;
        Ok(report)
    }

    /// Bounded wait for the market order to show up as a position.
    /// Timing out is fail-closed: no stop is placed and the store stays
    /// untouched, because there is nothing to protect.
    async fn verify_fill(&self, side: Side) -> Result<Position> {
        let symbol = &self.config.market.symbol;
        for attempt in 1..=FILL_VERIFY_ATTEMPTS {
            match self.exchange.fetch_position(symbol).await {
                Ok(Some(position)) if position.side == side => return Ok(position),
                Ok(_) => {}
                Err(e) => warn!(error = %e, attempt, "fill verification query failed"),
            }
            if attempt < FILL_VERIFY_ATTEMPTS {
                tokio::time::sleep(self.fill_delay).await;
            }
        }

        error!(%side, "entry order produced no position within the verification window");
        self.notifier
            .notify(&format!(
                "{symbol}: entry order sent but no {side} position appeared, entry aborted"
            ))
            .await;
        bail!("entry: fill not observed within verification window");
    }

    /// Close the position and clean up its orders. Failures after the
    /// closing order is accepted are escalated but never retried here.
    pub async fn exit(&self, position: &Position, reason: &str) -> Result<()> {
        let symbol = &self.config.market.symbol;

        info!(side = %position.side, contracts = position.contracts, reason, "closing position");
        self.exchange
            .place_market_order(
                symbol,
                position.side.close_order_side(),
                position.contracts,
                true,
            )
            .await
            .context("exit: closing order rejected")?;

        tokio::time::sleep(self.settle_delay).await;

        if let Err(e) = self.exchange.cancel_all_orders(symbol).await {
            error!(error = %e, "order cleanup failed after close");
            self.notifier
                .alert(&format!(
                    "{symbol}: position closed but order cleanup failed, check manually ({e})"
                ))
                .await;
        }
        self.store.clear_position(symbol)?;

        self.notifier
            .notify(&format!(
                "{symbol}: closed {} position ({reason})",
                position.side
            ))
            .await;
        Ok(())
    }
}

fn mean_ignoring_nan(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    valid.iter().sum::<f64>() / valid.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use chrono::{TimeZone, Utc};

    fn candles(n: usize, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                timestamp: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
                open: 100.0,
                high: 100.0 + range,
                low: 100.0 - range,
                close: 100.0,
                volume: 10.0,
            })
            .collect()
    }

    fn fixture() -> (PaperExchange, StateStore, Notifier, BotConfig) {
        (
            PaperExchange::new(10_000.0, 100.0),
            StateStore::open_in_memory().unwrap(),
            Notifier::new(None),
            BotConfig::default(),
        )
    }

    fn manager<'a>(
        exchange: &'a PaperExchange,
        store: &'a StateStore,
        notifier: &'a Notifier,
        config: &'a BotConfig,
    ) -> OrderLifecycleManager<'a, PaperExchange> {
        OrderLifecycleManager::new(exchange, store, notifier, config)
            .with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn risk_reward_tracks_volatility_regime() {
        assert_eq!(adjusted_risk_reward(2.0, 1.0, 1.0), 2.0);
        // High volatility widens the target
        assert!((adjusted_risk_reward(2.0, 2.0, 1.0) - 2.6).abs() < 1e-9);
        // Low volatility tightens it
        assert!((adjusted_risk_reward(2.0, 0.5, 1.0) - 1.6).abs() < 1e-9);
        // Clamps
        assert_eq!(adjusted_risk_reward(4.5, 2.0, 1.0), 5.0);
        assert_eq!(adjusted_risk_reward(1.6, 0.5, 1.0), 1.5);
        // Unusable ATR leaves the base untouched
        assert_eq!(adjusted_risk_reward(2.0, f64::NAN, 1.0), 2.0);
    }

    #[test]
    fn stop_distance_respects_percentage_floor() {
        let (exchange, store, notifier, config) = fixture();
        let manager = manager(&exchange, &store, &notifier, &config);

        // Tiny range: ATR-based distance far below the 0.3% floor
        let plan = manager.plan_entry(10_000.0, 100.0, &candles(100, 0.01));
        assert!((plan.stop_distance - 0.3).abs() < 1e-9);

        // Wide range: ATR times multiplier dominates (2.0 * 2.0 = 4.0)
        let plan = manager.plan_entry(10_000.0, 100.0, &candles(100, 2.0));
        assert!((plan.stop_distance - 8.0).abs() < 1e-6);
    }

    #[test]
    fn volatility_regime_uses_recent_atr_only() {
        let (exchange, store, notifier, config) = fixture();
        let manager = manager(&exchange, &store, &notifier, &config);

        // A violent past followed by 200 calm bars: current ATR sits right
        // at the recent mean, so the base ratio must apply. Averaging the
        // whole history would misread this as a low-volatility regime.
        let mut series = candles(100, 20.0);
        series.extend(candles(200, 2.0));

        let plan = manager.plan_entry(10_000.0, 100.0, &series);
        assert!((plan.risk_reward - config.risk.risk_reward_ratio).abs() < 1e-9);
    }

    #[test]
    fn size_targets_fixed_usdt_risk()  {
        let (exchange, store, notifier, config) = fixture();
        let manager = manager(&exchange, &store, &notifier, &config);

        // 1% of 10k = 100 USDT at risk over a 8.0 stop distance
        let plan = manager.plan_entry(10_000.0, 100.0, &candles(100, 2.0));
        assert!((plan.contracts * plan.stop_distance - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn entry_fills_protects_and_persists() {
        let (exchange, store, notifier, config) = fixture();
        let manager = manager(&exchange, &store, &notifier, &config);

        let report = manager
            .enter(Side::Long, 100.0, &candles(100, 2.0))
            .await
            .unwrap();

        assert_eq!(report.entry_price, 100.0);
        assert!(report.stop_price < report.entry_price);
        assert!(report.take_profit > report.entry_price);
        assert!(report.trailing_activation > report.entry_price);

        // One protective stop, persisted state, cooldown armed
        assert_eq!(exchange.stop_count(Side::Long), 1);
        let record = store.position("BTCUSDT").unwrap().unwrap();
        assert_eq!(record.side, Side::Long);
        assert_eq!(record.stop_price, Some(report.stop_price));
        assert!(store.is_trade_locked("BTCUSDT_1h").unwrap());
        assert_eq!(
            store.last_entry_price("BTCUSDT_1h").unwrap(),
            Some(100.0)
        );
    }

    #[tokio::test]
    async fn short_entry_places_stop_above() {
        let (exchange, store, notifier, config) = fixture();
        let manager = manager(&exchange, &store, &notifier, &config);

        let report = manager
            .enter(Side::Short, 100.0, &candles(100, 2.0))
            .await
            .unwrap();

        assert!(report.stop_price > report.entry_price);
        assert!(report.take_profit < report.entry_price);
        assert_eq!(exchange.stop_count(Side::Short), 1);
    }

    #[tokio::test]
    async fn unobserved_fill_aborts_without_stop_or_state() {
        let (exchange, store, notifier, config) = fixture();
        exchange.swallow_market_orders();
        let manager = manager(&exchange, &store, &notifier, &config);

        let result = manager.enter(Side::Long, 100.0, &candles(100, 2.0)).await;

        assert!(result.is_err());
        assert!(exchange.open_orders().is_empty());
        assert!(store.position("BTCUSDT").unwrap().is_none());
        assert!(!store.is_trade_locked("BTCUSDT_1h").unwrap());
    }

    #[tokio::test]
    async fn insufficient_funds_is_surfaced_distinctly() {
        let (exchange, store, notifier, config) = fixture();
        exchange.deny_funds();
        let manager = manager(&exchange, &store, &notifier, &config);

        let err = manager
            .enter(Side::Long, 100.0, &candles(100, 2.0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));
        assert!(store.position("BTCUSDT").unwrap().is_none());
    }

    #[tokio::test]
    async fn exit_closes_cleans_and_resets() {
        let (exchange, store, notifier, config) = fixture();
        let manager = manager(&exchange, &store, &notifier, &config);

        manager
            .enter(Side::Long, 100.0, &candles(100, 2.0))
            .await
            .unwrap();
        let position = exchange.position().unwrap();

        manager.exit(&position, "opposite signal").await.unwrap();

        assert!(exchange.position().is_none());
        assert!(exchange.open_orders().is_empty());
        assert!(store.position("BTCUSDT").unwrap().is_none());
    }
}
