//! Position-state reconciliation
//!
//! Runs at the start of every cycle, before any entry logic, and aligns
//! the locally believed position state with exchange-reported truth:
//! foreign positions are adopted, missing protective stops replaced,
//! duplicate stops collapsed to one, and orphaned orders cancelled.
//! Reconciliation is idempotent: repeating it against unchanged exchange
//! state performs no further side effects.
//!
//! Any exchange failure here aborts the whole cycle; acting on
//! unconfirmed state would compound the drift the reconciler exists to
//! repair.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::exchange::{ExchangeClient, Position};
use crate::notify::Notifier;
use crate::signal::{indicators, PivotDetector, PivotKind};
use crate::store::StateStore;
use crate::types::{Candle, Side};

/// Relative tolerance when matching a stored stop price against the
/// exchange-reported trigger price. Exact decimal equality is fragile
/// against exchange-side rounding.
pub const STOP_PRICE_TOLERANCE: f64 = 1e-3;

/// What the reconciler found for an open position, before repair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionHealth {
    /// Exactly one protective stop on the correct side
    Protected,
    /// No protective stop; an emergency stop was placed
    Unprotected,
    /// More than one protective stop; all were cancelled and one replaced
    OverProtected { cancelled: usize },
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No position on the exchange. `externally_closed` is set when local
    /// state claimed one and had to be reset.
    Flat {
        externally_closed: bool,
        orphans_cancelled: usize,
    },
    /// A position is open (and now carries exactly one protective stop)
    InPosition {
        position: Position,
        adopted: bool,
        health: PositionHealth,
    },
}

impl ReconcileOutcome {
    pub fn position(&self) -> Option<&Position> {
        match self {
            Self::InPosition { position, .. } => Some(position),
            Self::Flat { .. } => None,
        }
    }
}

/// Aligns local state with exchange truth once per cycle
pub struct Reconciler<'a, E: ExchangeClient> {
    exchange: &'a E,
    store: &'a StateStore,
    notifier: &'a Notifier,
    config: &'a BotConfig,
}

impl<'a, E: ExchangeClient> Reconciler<'a, E> {
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
        }
    }

    /// Run one reconciliation pass. `candles` supply the swing extremum
    /// for emergency stop pricing.
    pub async fn run(&self, candles: &[Candle]) -> Result<ReconcileOutcome> {
        let symbol = &self.config.market.symbol;

        let position = self
            .exchange
            .fetch_position(symbol)
            .await
            .context("reconciliation: position query failed")?;
        let local = self.store.position(symbol)?;

        match position {
            Some(position) => self.reconcile_open(position, local.is_none(), candles).await,
            None => self.reconcile_flat(local.is_some()).await,
        }
    }

    async fn reconcile_open(
        &self,
        position: Position,
        adopt: bool,
        candles: &[Candle],
    ) -> Result<ReconcileOutcome> {
        let symbol = &self.config.market.symbol;

        if adopt {
            warn!(side = %position.side, contracts = position.contracts, "foreign position found, adopting");
            self.store.set_position(symbol, position.side, None)?;
            self.notifier
                .notify(&format!(
                    "{symbol}: foreign {} position found, management adopted",
                    position.side
                ))
                .await;
        } else if let Some(record) = self.store.position(symbol)? {
            if record.side != position.side {
                warn!(local = %record.side, exchange = %position.side, "position side drifted, trusting exchange");
                self.store
                    .set_position(symbol, position.side, record.stop_price)?;
            }
        }

        let orders = self
            .exchange
            .fetch_open_orders(symbol)
            .await
            .context("reconciliation: open-order query failed")?;
        let stops: Vec<_> = orders
            .iter()
            .filter(|o| o.is_protective_stop(position.side))
            .collect();

        let health = match stops.len() {
            1 => {
                self.sync_stored_stop(position, stops[0].trigger_price)?;
                PositionHealth::Protected
            }
            0 => {
                self.place_emergency_stop(&position, candles).await?;
                PositionHealth::Unprotected
            }
            n => {
                warn!(count = n, "duplicate protective stops found, cancelling all");
                for stop in &stops {
                    self.exchange
                        .cancel_order(&stop.id, symbol)
                        .await
                        .context("reconciliation: duplicate-stop cancel failed")?;
                }
                self.place_emergency_stop(&position, candles).await?;
                PositionHealth::OverProtected { cancelled: n }
            }
        };

        Ok(ReconcileOutcome::InPosition {
            position,
            adopted: adopt,
            health,
        })
    }

    async fn reconcile_flat(&self, had_local_record: bool) -> Result<ReconcileOutcome> {
        let symbol = &self.config.market.symbol;

        if had_local_record {
            info!("position closed externally, resetting local state");
            self.store.clear_position(symbol)?;
            self.notifier
                .notify(&format!("{symbol}: position was closed externally"))
                .await;
        }

        let orders = self
            .exchange
            .fetch_open_orders(symbol)
            .await
            .context("reconciliation: open-order query failed")?;
        let orphans = orders.len();
        if orphans > 0 {
            warn!(count = orphans, "orphaned orders with no position, cancelling");
            self.exchange
                .cancel_all_orders(symbol)
                .await
                .context("reconciliation: orphan cleanup failed")?;
        }

        Ok(ReconcileOutcome::Flat {
            externally_closed: had_local_record,
            orphans_cancelled: orphans,
        })
    }

    /// Keep the stored stop price in step with the exchange-reported one.
    /// The exchange is the authority; the comparison is tolerance-based.
    fn sync_stored_stop(&self, position: Position, exchange_stop: Option<f64>) -> Result<()> {
        let symbol = &self.config.market.symbol;
        let Some(exchange_stop) = exchange_stop else {
            return Ok(());
        };

        let stored = self.store.position(symbol)?.and_then(|r| r.stop_price);
        let matches = stored.is_some_and(|s| {
            (s - exchange_stop).abs() <= exchange_stop.abs() * STOP_PRICE_TOLERANCE
        });
        if !matches {
            self.store
                .set_position(symbol, position.side, Some(exchange_stop))?;
        }
        Ok(())
    }

    /// Emergency stop from the most recent confirmed swing extremum,
    /// buffered by `sl_buffer_pct`. Falls back to a plain trailing-window
    /// extremum, then to the entry price, when no pivot has confirmed.
    async fn place_emergency_stop(&self, position: &Position, candles: &[Candle]) -> Result<()> {
        let symbol = &self.config.market.symbol;
        let buffer = self.config.risk.sl_buffer_pct / 100.0;

        let anchor = self
            .last_confirmed_extremum(candles, position.side)
            .or_else(|| match position.side {
                Side::Long => indicators::swing_low(candles, self.swing_lookback()),
                Side::Short => indicators::swing_high(candles, self.swing_lookback()),
            })
            .unwrap_or(position.entry_price);

        let stop_price = match position.side {
            Side::Long => anchor * (1.0 - buffer),
            Side::Short => anchor * (1.0 + buffer),
        };

        warn!(stop_price, side = %position.side, "position unprotected, placing emergency stop");
        self.exchange
            .place_stop_order(
                symbol,
                position.side.close_order_side(),
                position.contracts,
                stop_price,
            )
            .await
            .context("reconciliation: emergency stop placement failed")?;
        self.store
            .set_position(symbol, position.side, Some(stop_price))?;
        self.notifier
            .notify(&format!(
                "{symbol}: position was unprotected, emergency stop placed at {stop_price:.6}"
            ))
            .await;
        Ok(())
    }

    fn swing_lookback(&self) -> usize {
        2 * self.config.strategy.pivot_period + 1
    }

    fn last_confirmed_extremum(&self, candles: &[Candle], side: Side) -> Option<f64> {
        let detector = PivotDetector::new(
            self.config.strategy.pivot_period,
            self.config.strategy.source,
        );
        let wanted = match side {
            Side::Long => PivotKind::Low,
            Side::Short => PivotKind::High,
        };
        detector
            .detect(candles)
            .iter()
            .rev()
            .flatten()
            .find(|p| p.kind == wanted)
            .map(|p| p.value)
    }
}
