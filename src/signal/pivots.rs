//! Confirmed pivot detection
//!
//! A pivot high at bar i is a bar whose source value equals the maximum of
//! the symmetric window of width `2*period+1` centered on i. The pivot is
//! only confirmed `period` bars later, once the full right half of the
//! window has closed; live use accepts this confirmation lag. Bars whose
//! window extends past either end of the series never confirm.

use crate::config::PivotSource;
use crate::types::Candle;

/// Kind of confirmed extremum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotKind {
    High,
    Low,
}

/// A confirmed local extremum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pivot {
    /// Price at the extremum bar
    pub value: f64,
    pub kind: PivotKind,
    /// Index of the extremum bar itself (confirmation happens at
    /// `bar_index + period`)
    pub bar_index: usize,
}

/// Detects confirmed pivot highs/lows over a candle series.
#[derive(Debug, Clone)]
pub struct PivotDetector {
    period: usize,
    source: PivotSource,
}

impl PivotDetector {
    pub fn new(period: usize, source: PivotSource) -> Self {
        Self { period, source }
    }

    fn source_values(&self, candles: &[Candle]) -> (Vec<f64>, Vec<f64>) {
        match self.source {
            PivotSource::HighLow => (
                candles.iter().map(|c| c.high).collect(),
                candles.iter().map(|c| c.low).collect(),
            ),
            PivotSource::CloseOpen => (
                candles.iter().map(|c| c.body_high()).collect(),
                candles.iter().map(|c| c.body_low()).collect(),
            ),
        }
    }

    /// One slot per bar: `out[i]` holds the pivot confirmed at bar i, if
    /// any. When a bar is both a window max and a window min (flat data),
    /// the high wins; ties across neighboring bars each confirm
    /// independently.
    pub fn detect(&self, candles: &[Candle]) -> Vec<Option<Pivot>> {
        let n = candles.len();
        let mut out = vec![None; n];
        let p = self.period;
        if p == 0 || n < 2 * p + 1 {
            return out;
        }

        let (highs, lows) = self.source_values(candles);

        // Extremum candidates live in [p, n - p - 1]; each confirms at +p.
        for i in p..(n - p) {
            let window_high = highs[i - p..=i + p]
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            let window_low = lows[i - p..=i + p]
                .iter()
                .cloned()
                .fold(f64::INFINITY, f64::min);

            let confirmed_at = i + p;
            if highs[i] == window_high {
                out[confirmed_at] = Some(Pivot {
                    value: highs[i],
                    kind: PivotKind::High,
                    bar_index: i,
                });
            } else if lows[i] == window_low {
                out[confirmed_at] = Some(Pivot {
                    value: lows[i],
                    kind: PivotKind::Low,
                    bar_index: i,
                });
            }
        }

        out
    }
}
