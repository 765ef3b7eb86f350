//! Support/resistance breakout signal engine
//!
//! Pipeline: confirmed pivot detection -> dynamic zone clustering ->
//! breakout classification, with volume confirmation and an optional
//! higher-timeframe bias veto on top.

pub mod breakout;
pub mod engine;
pub mod indicators;
pub mod pivots;
pub mod zones;

pub use breakout::BreakoutClassifier;
pub use engine::{determine_bias, SignalEngine, SignalOutput, ATR_PERIOD, MIN_CANDLES};
pub use pivots::{Pivot, PivotDetector, PivotKind};
pub use zones::{Zone, ZoneBuilder};
