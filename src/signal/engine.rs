//! Signal engine
//!
//! Composes pivot detection, zone clustering and breakout classification
//! over a candle series, then applies the volume confirmation and the
//! higher-timeframe bias veto. Only fully closed bars may be passed in;
//! the caller strips the still-forming candle before evaluation.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::breakout::BreakoutClassifier;
use super::indicators;
use super::pivots::PivotDetector;
use super::zones::{Zone, ZoneBuilder};
use crate::config::StrategyConfig;
use crate::types::{Bias, Candle, Signal};

/// Minimum closed bars before any evaluation is attempted
pub const MIN_CANDLES: usize = 50;

/// ATR period feeding the channel width and stop sizing
pub const ATR_PERIOD: usize = 14;

/// Trailing window for the volume confirmation mean
const VOLUME_WINDOW: usize = 20;

/// Signal for the latest closed bar plus its reference price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalOutput {
    pub signal: Signal,
    /// Close of the evaluated bar
    pub price: f64,
    /// ATR(14) at the evaluated bar, NaN during warmup
    pub atr: f64,
}

pub struct SignalEngine {
    config: StrategyConfig,
    detector: PivotDetector,
    builder: ZoneBuilder,
    classifier: BreakoutClassifier,
}

impl SignalEngine {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            detector: PivotDetector::new(config.pivot_period, config.source),
            builder: ZoneBuilder::new(config.max_sr_levels, config.min_strength),
            classifier: BreakoutClassifier::new(config.breakout_threshold),
            config: config.clone(),
        }
    }

    /// Channel width per bar: ATR scaled by the configured multiplier,
    /// falling back to 1% of close once enough history exists for the
    /// ATR itself to be trustworthy-but-missing.
    fn channel_width(&self, atr: f64, close: f64, index: usize) -> f64 {
        let width = if atr.is_nan() {
            0.0
        } else {
            atr * (self.config.channel_width_pct / 10.0)
        };
        if width == 0.0 && index > MIN_CANDLES {
            return close * 0.01;
        }
        width
    }

    /// Raw breakout signal per bar, before volume and bias filters.
    /// Also returns the zone set of the final bar for diagnostics.
    pub fn signal_series(&self, candles: &[Candle]) -> (Vec<Signal>, Vec<Zone>) {
        let n = candles.len();
        let mut signals = vec![Signal::None; n];
        let mut last_zones = Vec::new();

        let pivots = self.detector.detect(candles);
        let atr = indicators::atr(candles, ATR_PERIOD);

        // Bounded most-recent-first pivot history: insert at the front,
        // evict at the back.
        let mut history: VecDeque<f64> = VecDeque::with_capacity(self.config.max_pivots + 1);

        for i in 0..n {
            if let Some(pivot) = pivots[i] {
                history.push_front(pivot.value);
                if history.len() > self.config.max_pivots {
                    history.pop_back();
                }
            }

            if history.is_empty() {
                continue;
            }

            let width = self.channel_width(atr[i], candles[i].close, i);
            let values: Vec<f64> = history.iter().copied().collect();
            let zones = self.builder.build(&values, width);

            if i > 0 {
                signals[i] =
                    self.classifier
                        .classify(&zones, candles[i - 1].close, candles[i].close);
            }
            if i == n - 1 {
                last_zones = zones;
            }
        }

        (signals, last_zones)
    }

    /// Evaluate the last closed bar of `candles`, applying volume
    /// confirmation, direction toggles and the HTF bias veto.
    ///
    /// Returns `None` when the series is too short to evaluate.
    pub fn evaluate(&self, candles: &[Candle], bias: Bias) -> Option<SignalOutput> {
        if candles.len() < MIN_CANDLES {
            warn!(
                candles = candles.len(),
                required = MIN_CANDLES,
                "not enough closed candles, skipping evaluation"
            );
            return None;
        }

        let (signals, zones) = self.signal_series(candles);
        let last = candles.len() - 1;
        let bar = &candles[last];
        let atr = indicators::atr(candles, ATR_PERIOD)[last];
        let mut signal = signals[last];

        debug!(zones = zones.len(), raw = ?signal, "signal engine evaluated bar");

        // Volume confirmation: a breakout without above-average volume is
        // treated as noise.
        if signal.is_some() {
            let vol_avg = indicators::mean_volume(candles, VOLUME_WINDOW);
            if bar.volume < vol_avg * self.config.volume_factor {
                debug!(
                    volume = bar.volume,
                    average = vol_avg,
                    "breakout rejected on weak volume"
                );
                signal = Signal::None;
            }
        }

        // Direction toggles
        match signal {
            Signal::Long if !self.config.use_longs => signal = Signal::None,
            Signal::Short if !self.config.use_shorts => signal = Signal::None,
            _ => {}
        }

        // HTF bias veto
        if let Some(side) = signal.side() {
            if bias.vetoes(side) {
                debug!(%bias, %side, "signal vetoed by higher-timeframe bias");
                signal = Signal::None;
            }
        }

        Some(SignalOutput {
            signal,
            price: bar.close,
            atr,
        })
    }
}

/// Market bias from a higher-timeframe EMA(20)/EMA(50) crossover.
///
/// Requires a minimum 0.5% separation between the averages so the bias
/// does not flip-flop near parity; anything closer reads as neutral.
pub fn determine_bias(htf_candles: &[Candle]) -> Bias {
    const FAST: usize = 20;
    const SLOW: usize = 50;
    const MIN_SEPARATION: f64 = 0.005;

    if htf_candles.len() < SLOW {
        return Bias::Neutral;
    }

    let closes: Vec<f64> = htf_candles.iter().map(|c| c.close).collect();
    let fast = indicators::ema(&closes, FAST);
    let slow = indicators::ema(&closes, SLOW);

    let (f, s) = (fast[closes.len() - 1], slow[closes.len() - 1]);
    if f.is_nan() || s.is_nan() || s == 0.0 {
        return Bias::Neutral;
    }

    let separation = (f - s).abs() / s;
    if separation <= MIN_SEPARATION {
        Bias::Neutral
    } else if f > s {
        Bias::Bullish
    } else {
        Bias::Bearish
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    /// Flat series around `base` with a resistance level tested twice,
    /// then broken on the last bar.
    fn breakout_series(n: usize, base: f64) -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..n).map(|i| candle(i, base, 100.0)).collect();

        // Two touches of resistance at base + 10 form a pivot cluster
        for &peak in &[20usize, 40] {
            candles[peak] = Candle {
                high: base + 10.0,
                ..candle(peak, base + 8.0, 100.0)
            };
        }
        candles
    }

    #[test]
    fn too_few_candles_yields_no_output() {
        let engine = SignalEngine::new(&StrategyConfig::default());
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 1.0)).collect();
        assert!(engine.evaluate(&candles, Bias::Neutral).is_none());
    }

    #[test]
    fn at_most_one_signal_per_bar() {
        let engine = SignalEngine::new(&StrategyConfig::default());
        let candles = breakout_series(120, 100.0);
        let (signals, _) = engine.signal_series(&candles);
        // Signal is a single enum value per bar by construction; sanity
        // check that the series is fully populated.
        assert_eq!(signals.len(), candles.len());
    }

    #[test]
    fn weak_volume_suppresses_breakout() {
        let mut config = StrategyConfig::default();
        config.pivot_period = 2;
        config.min_strength = 1;
        let engine = SignalEngine::new(&config);

        let mut candles = breakout_series(120, 100.0);
        let last = candles.len() - 1;
        // Strong upward close through the cluster, but average volume only
        candles[last] = candle(last, 112.0, 100.0);

        let out = engine.evaluate(&candles, Bias::Neutral).unwrap();
        assert_eq!(out.signal, Signal::None);
    }

    #[test]
    fn bias_vetoes_counter_trend_signal() {
        let mut config = StrategyConfig::default();
        config.pivot_period = 2;
        config.min_strength = 1;
        let engine = SignalEngine::new(&config);

        let mut candles = breakout_series(120, 100.0);
        let last = candles.len() - 1;
        candles[last] = candle(last, 112.0, 500.0);

        let neutral = engine.evaluate(&candles, Bias::Neutral).unwrap();
        let vetoed = engine.evaluate(&candles, Bias::Bearish).unwrap();

        if neutral.signal == Signal::Long {
            assert_eq!(vetoed.signal, Signal::None);
        }
    }

    #[test]
    fn long_toggle_disables_long_signals() {
        let mut config = StrategyConfig::default();
        config.pivot_period = 2;
        config.min_strength = 1;
        config.use_longs = false;
        let engine = SignalEngine::new(&config);

        let mut candles = breakout_series(120, 100.0);
        let last = candles.len() - 1;
        candles[last] = candle(last, 112.0, 500.0);

        let out = engine.evaluate(&candles, Bias::Neutral).unwrap();
        assert_ne!(out.signal, Signal::Long);
    }

    #[test]
    fn bias_requires_separation() {
        // Closes drifting up 0.01% per bar: EMAs stay within 0.5%
        let candles: Vec<Candle> = (0..100)
            .map(|i| candle(i, 100.0 + i as f64 * 0.01, 1.0))
            .collect();
        assert_eq!(determine_bias(&candles), Bias::Neutral);
    }

    #[test]
    fn strong_uptrend_reads_bullish() {
        let candles: Vec<Candle> = (0..100)
            .map(|i| candle(i, 100.0 + i as f64 * 2.0, 1.0))
            .collect();
        assert_eq!(determine_bias(&candles), Bias::Bullish);
    }

    #[test]
    fn strong_downtrend_reads_bearish() {
        let candles: Vec<Candle> = (0..100)
            .map(|i| candle(i, 400.0 - i as f64 * 2.0, 1.0))
            .collect();
        assert_eq!(determine_bias(&candles), Bias::Bearish);
    }

    #[test]
    fn short_history_reads_neutral() {
        let candles: Vec<Candle> = (0..30).map(|i| candle(i, 100.0, 1.0)).collect();
        assert_eq!(determine_bias(&candles), Bias::Neutral);
    }
}
