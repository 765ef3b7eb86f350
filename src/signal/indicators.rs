//! Indicator primitives used by the signal engine
//!
//! ATR uses Wilder smoothing (EMA with alpha = 1/period). EMA is the
//! standard recursive form seeded with the SMA of the first `period`
//! closes. Bars before the warmup window produce NaN.

use crate::types::Candle;

/// True Range series.
/// TR[0] = high[0] - low[0]; TR[t] = max(h-l, |h-pc|, |l-pc|).
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let n = candles.len();
    let mut tr = vec![f64::NAN; n];
    if n == 0 {
        return tr;
    }

    tr[0] = candles[0].high - candles[0].low;
    for i in 1..n {
        let h = candles[i].high;
        let l = candles[i].low;
        let pc = candles[i - 1].close;
        tr[i] = (h - l).max((h - pc).abs()).max((l - pc).abs());
    }
    tr
}

/// Average True Range with Wilder smoothing.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let tr = true_range(candles);
    let n = tr.len();
    let mut out = vec![f64::NAN; n];
    if n < period || period == 0 {
        return out;
    }

    // Seed with the simple average of the first `period` true ranges
    let seed: f64 = tr[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;

    let alpha = 1.0 / period as f64;
    for i in period..n {
        out[i] = alpha * tr[i] + (1.0 - alpha) * out[i - 1];
    }
    out
}

/// Exponential moving average of close prices.
pub fn ema(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if n < period || period == 0 {
        return out;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;

    for i in period..n {
        out[i] = alpha * closes[i] + (1.0 - alpha) * out[i - 1];
    }
    out
}

/// Lowest low over the trailing `lookback` bars (including the last bar).
pub fn swing_low(candles: &[Candle], lookback: usize) -> Option<f64> {
    let start = candles.len().checked_sub(lookback.min(candles.len()))?;
    candles[start..]
        .iter()
        .map(|c| c.low)
        .fold(None, |acc: Option<f64>, low| {
            Some(acc.map_or(low, |a| a.min(low)))
        })
}

/// Highest high over the trailing `lookback` bars (including the last bar).
pub fn swing_high(candles: &[Candle], lookback: usize) -> Option<f64> {
    let start = candles.len().checked_sub(lookback.min(candles.len()))?;
    candles[start..]
        .iter()
        .map(|c| c.high)
        .fold(None, |acc: Option<f64>, high| {
            Some(acc.map_or(high, |a| a.max(high)))
        })
}

/// Mean volume of the trailing `window` bars.
pub fn mean_volume(candles: &[Candle], window: usize) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    let start = candles.len().saturating_sub(window);
    let slice = &candles[start..];
    slice.iter().map(|c| c.volume).sum::<f64>() / slice.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(i * 3600, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn true_range_accounts_for_gaps() {
        let candles = vec![
            candle(0, 100.0, 102.0, 99.0, 101.0, 1.0),
            // Gap up: TR must span back to the prior close
            candle(1, 105.0, 106.0, 104.0, 105.0, 1.0),
        ];
        let tr = true_range(&candles);
        assert_eq!(tr[0], 3.0);
        assert_eq!(tr[1], 5.0); // |106 - 101|
    }

    #[test]
    fn atr_is_nan_during_warmup() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| candle(i, 100.0, 101.0, 99.0, 100.0, 1.0))
            .collect();
        let values = atr(&candles, 14);
        assert!(values[12].is_nan());
        assert!(!values[13].is_nan());
        // Constant 2-point range converges to 2.0
        assert!((values[19] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ema_converges_to_constant_input() {
        let closes = vec![50.0; 100];
        let values = ema(&closes, 20);
        assert!(values[18].is_nan());
        assert!((values[99] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn swing_extremes_use_trailing_window() {
        let candles = vec![
            candle(0, 100.0, 110.0, 90.0, 100.0, 1.0),
            candle(1, 100.0, 105.0, 95.0, 100.0, 1.0),
            candle(2, 100.0, 103.0, 97.0, 100.0, 1.0),
        ];
        assert_eq!(swing_low(&candles, 2), Some(95.0));
        assert_eq!(swing_high(&candles, 2), Some(105.0));
        assert_eq!(swing_low(&candles, 10), Some(90.0));
        assert_eq!(swing_low(&[], 5), None);
    }

    #[test]
    fn mean_volume_trailing_window() {
        let candles: Vec<Candle> = (0..5)
            .map(|i| candle(i, 1.0, 1.0, 1.0, 1.0, (i + 1) as f64))
            .collect();
        assert!((mean_volume(&candles, 2) - 4.5).abs() < 1e-9);
        assert!((mean_volume(&candles, 100) - 3.0).abs() < 1e-9);
    }
}
