//! Trading cycle orchestration
//!
//! One invocation runs one full cycle: reconcile local state against the
//! exchange, then either manage the surviving position or evaluate a
//! fresh entry on fully closed candles. Reconciliation always completes
//! (or aborts the cycle) before any entry logic runs.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::exchange::ExchangeClient;
use crate::lifecycle::{EntryReport, OrderLifecycleManager};
use crate::notify::Notifier;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::signal::{determine_bias, SignalEngine, MIN_CANDLES};
use crate::store::StateStore;
use crate::types::{Bias, Candle};

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Not enough closed candles to evaluate anything
    SkippedShortHistory,
    /// Open position left to its stop and trailing orders
    Held,
    /// Open position closed on an opposite signal
    Exited,
    /// No signal, nothing to do
    NoAction,
    /// Signal present but the re-entry cooldown is running
    SkippedLocked,
    /// Signal present but price is too close to the last entry
    SkippedReentryGuard,
    /// A new position was opened
    Entered(EntryReport),
}

/// Single-symbol trading bot
pub struct Bot<'a, E: ExchangeClient> {
    exchange: &'a E,
    store: &'a StateStore,
    notifier: &'a Notifier,
    config: &'a BotConfig,
    engine: SignalEngine,
}

impl<'a, E: ExchangeClient> Bot<'a, E> {
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
            engine: SignalEngine::new(&config.strategy),
        }
    }

    /// Run one complete cycle
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let market = &self.config.market;

        let candles = self
            .exchange
            .fetch_candles(&market.symbol, &market.timeframe, market.candle_limit)
            .await
            .context("cycle: candle fetch failed")?;

        // The last candle is still forming; only closed bars count.
        if candles.len() < 2 {
            warn!(candles = candles.len(), "no closed candles, skipping cycle");
            return Ok(CycleOutcome::SkippedShortHistory);
        }
        let closed = &candles[..candles.len() - 1];

        let reconciler = Reconciler::new(self.exchange, self.store, self.notifier, self.config);
        let outcome = match reconciler.run(closed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.notifier
                    .notify(&format!(
                        "{}: reconciliation failed, cycle aborted ({e:#})",
                        market.symbol
                    ))
                    .await;
                return Err(e);
            }
        };

        if closed.len() < MIN_CANDLES {
            warn!(
                closed = closed.len(),
                required = MIN_CANDLES,
                "insufficient history, skipping evaluation"
            );
            return Ok(CycleOutcome::SkippedShortHistory);
        }

        let bias = self.higher_timeframe_bias().await;
        let Some(output) = self.engine.evaluate(closed, bias) else {
            return Ok(CycleOutcome::SkippedShortHistory);
        };

        let lifecycle =
            OrderLifecycleManager::new(self.exchange, self.store, self.notifier, self.config);

        if let ReconcileOutcome::InPosition { position, .. } = outcome {
            // The resting stop and trailing orders manage the position
            // (the take-profit level is advisory, reported at entry but
            // never placed); the only cycle-level action is closing into
            // an opposite breakout.
            let opposite = output
                .signal
                .side()
                .is_some_and(|s| s == position.side.opposite());
            if opposite {
                info!(held = %position.side, "opposite breakout, closing position");
                lifecycle.exit(&position, "opposite breakout signal").await?;
                return Ok(CycleOutcome::Exited);
            }
            return Ok(CycleOutcome::Held);
        }

        let Some(side) = output.signal.side() else {
            return Ok(CycleOutcome::NoAction);
        };

        let key = self.config.lock_key();
        if self.store.is_trade_locked(&key)? {
            info!(%side, "signal suppressed by trade cooldown");
            return Ok(CycleOutcome::SkippedLocked);
        }

        if let Some(last_entry) = self.store.last_entry_price(&key)? {
            let distance = (output.price - last_entry).abs() / last_entry;
            if distance < self.config.risk.min_reentry_distance_pct {
                info!(
                    price = output.price,
                    last_entry,
                    "signal suppressed by re-entry guard"
                );
                return Ok(CycleOutcome::SkippedReentryGuard);
            }
        }

        let report = lifecycle.enter(side, output.price, closed).await?;
        Ok(CycleOutcome::Entered(report))
    }

    /// Higher-timeframe EMA bias; reads neutral when the filter is
    /// disabled or the fetch fails.
    async fn higher_timeframe_bias(&self) -> Bias {
        let market = &self.config.market;
        if market.htf.is_empty() {
            return Bias::Neutral;
        }
        match self
            .exchange
            .fetch_candles(&market.symbol, &market.htf, market.candle_limit)
            .await
        {
            Ok(htf) => {
                let closed: &[Candle] = if htf.len() > 1 {
                    &htf[..htf.len() - 1]
                } else {
                    &htf
                };
                determine_bias(closed)
            }
            Err(e) => {
                warn!(error = %e, "higher-timeframe fetch failed, bias neutral");
                Bias::Neutral
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OpenOrder, PaperExchange, Position};
    use crate::types::Side;
    use chrono::{TimeZone, Utc};

    fn candle(i: usize, close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume,
        }
    }

    /// Flat series at 100 with a resistance cluster near 110, broken
    /// upward on the last closed bar with strong volume, plus a trailing
    /// still-forming candle.
    fn breakout_up_series() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..121).map(|i| candle(i, 100.0, 100.0)).collect();
        for &peak in &[20usize, 40, 60] {
            candles[peak] = Candle {
                high: 110.0,
                ..candle(peak, 108.0, 100.0)
            };
        }
        // Last closed bar breaks well above the cluster on volume
        candles[119] = candle(119, 118.0, 500.0);
        // Forming candle, must be ignored
        candles[120] = candle(120, 130.0, 1.0);
        candles
    }

    /// Bars closing at their highs around 100, broken downward on the
    /// last closed bar
    fn breakout_down_series() -> Vec<Candle> {
        fn bar(i: usize, close: f64, volume: f64) -> Candle {
            Candle {
                timestamp: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
                open: close,
                high: close,
                low: close - 1.0,
                close,
                volume,
            }
        }
        let mut candles: Vec<Candle> = (0..121).map(|i| bar(i, 100.0, 100.0)).collect();
        candles[119] = bar(119, 82.0, 500.0);
        candles[120] = bar(120, 70.0, 1.0);
        candles
    }

    fn config() -> BotConfig {
        let mut config = BotConfig::default();
        config.strategy.pivot_period = 2;
        config.strategy.min_strength = 1;
        config.market.htf = String::new();
        config
    }

    fn fixture() -> (PaperExchange, StateStore, Notifier, BotConfig) {
        (
            PaperExchange::new(10_000.0, 100.0),
            StateStore::open_in_memory().unwrap(),
            Notifier::new(None),
            config(),
        )
    }

    #[tokio::test]
    async fn short_history_skips_cycle() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles((0..20).map(|i| candle(i, 100.0, 1.0)).collect());

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert_eq!(
            bot.run_cycle().await.unwrap(),
            CycleOutcome::SkippedShortHistory
        );
        assert!(exchange.position().is_none());
    }

    #[tokio::test]
    async fn quiet_market_takes_no_action() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles((0..121).map(|i| candle(i, 100.0, 100.0)).collect());

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert_eq!(bot.run_cycle().await.unwrap(), CycleOutcome::NoAction);
    }

    #[tokio::test]
    async fn breakout_enters_long_with_protection() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles(breakout_up_series());

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        let outcome = bot.run_cycle().await.unwrap();

        let CycleOutcome::Entered(report) = outcome else {
            panic!("expected an entry, got {outcome:?}");
        };
        assert_eq!(report.side, Side::Long);
        assert_eq!(exchange.stop_count(Side::Long), 1);
        assert!(store.position("BTCUSDT").unwrap().is_some());
    }

    #[tokio::test]
    async fn cooldown_suppresses_entry() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles(breakout_up_series());
        store.set_trade_lock(&config.lock_key(), 60).unwrap();

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert_eq!(bot.run_cycle().await.unwrap(), CycleOutcome::SkippedLocked);
        assert!(exchange.position().is_none());
    }

    #[tokio::test]
    async fn reentry_guard_suppresses_nearby_entry() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles(breakout_up_series());
        // Last entry within 1.5% of the breakout close at 118
        store.set_last_entry_price(&config.lock_key(), 118.5).unwrap();

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert_eq!(
            bot.run_cycle().await.unwrap(),
            CycleOutcome::SkippedReentryGuard
        );
        assert!(exchange.position().is_none());
    }

    #[tokio::test]
    async fn distant_last_entry_does_not_block() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles(breakout_up_series());
        store.set_last_entry_price(&config.lock_key(), 100.0).unwrap();

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert!(matches!(
            bot.run_cycle().await.unwrap(),
            CycleOutcome::Entered(_)
        ));
    }

    #[tokio::test]
    async fn protected_position_is_held_through_quiet_bars() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles((0..121).map(|i| candle(i, 100.0, 100.0)).collect());
        exchange.set_position(Some(Position {
            side: Side::Long,
            contracts: 1.0,
            entry_price: 100.0,
        }));
        exchange.add_order(OpenOrder {
            id: "sl-1".to_string(),
            side: "sell".to_string(),
            trigger_price: Some(95.0),
            reduce_only: true,
            is_trailing: false,
        });
        store.set_position("BTCUSDT", Side::Long, Some(95.0)).unwrap();

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert_eq!(bot.run_cycle().await.unwrap(), CycleOutcome::Held);
        assert!(exchange.position().is_some());
    }

    #[tokio::test]
    async fn opposite_breakout_closes_position() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles(breakout_down_series());
        exchange.set_position(Some(Position {
            side: Side::Long,
            contracts: 1.0,
            entry_price: 100.0,
        }));
        exchange.add_order(OpenOrder {
            id: "sl-1".to_string(),
            side: "sell".to_string(),
            trigger_price: Some(95.0),
            reduce_only: true,
            is_trailing: false,
        });
        store.set_position("BTCUSDT", Side::Long, Some(95.0)).unwrap();

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert_eq!(bot.run_cycle().await.unwrap(), CycleOutcome::Exited);
        assert!(exchange.position().is_none());
        assert!(exchange.open_orders().is_empty());
        assert!(store.position("BTCUSDT").unwrap().is_none());
    }

    #[tokio::test]
    async fn reconciliation_failure_aborts_before_entry() {
        let (exchange, store, notifier, config) = fixture();
        exchange.set_candles(breakout_up_series());
        exchange.set_position(Some(Position {
            side: Side::Long,
            contracts: 1.0,
            entry_price: 100.0,
        }));
        exchange.break_order_queries(true);

        let bot = Bot::new(&exchange, &store, &notifier, &config);
        assert!(bot.run_cycle().await.is_err());
    }
}
