//! Bot configuration
//!
//! One `BotConfig` is built at startup and passed by reference into each
//! component. There is no process-wide mutable configuration.

use serde::{Deserialize, Serialize};

/// Execution mode determines whether orders hit the real exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// In-memory paper exchange, no real orders
    Paper,
    /// Live trading against the exchange
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Which candle values feed the pivot detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PivotSource {
    /// Wick extremes (high for pivot highs, low for pivot lows)
    HighLow,
    /// Body extremes (max/min of open and close)
    CloseOpen,
}

impl Default for PivotSource {
    fn default() -> Self {
        Self::HighLow
    }
}

/// Market selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Symbol to trade (e.g. "BTCUSDT")
    pub symbol: String,
    /// Candle timeframe (e.g. "1h")
    pub timeframe: String,
    /// Higher timeframe for the bias filter; empty disables the filter
    #[serde(default)]
    pub htf: String,
    /// Candles fetched per cycle
    pub candle_limit: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            htf: "4h".to_string(),
            candle_limit: 1000,
        }
    }
}

/// Support/resistance engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Half-width of the pivot confirmation window (confirmation lag in bars)
    pub pivot_period: usize,
    /// Candle values used for pivot detection
    pub source: PivotSource,
    /// Most-recent pivots retained for clustering
    pub max_pivots: usize,
    /// ATR multiplier (divided by 10) controlling cluster channel width
    pub channel_width_pct: f64,
    /// Maximum accepted zones per bar
    pub max_sr_levels: usize,
    /// Minimum pivot count for a zone to be accepted
    pub min_strength: u32,
    /// Relative midpoint-cross threshold rejecting whipsaw breakouts
    pub breakout_threshold: f64,
    /// Breakout must carry this multiple of trailing 20-bar mean volume
    pub volume_factor: f64,
    pub use_longs: bool,
    pub use_shorts: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            pivot_period: 10,
            source: PivotSource::HighLow,
            max_pivots: 20,
            channel_width_pct: 10.0,
            max_sr_levels: 5,
            min_strength: 2,
            breakout_threshold: 0.002,
            volume_factor: 1.2,
            use_longs: true,
            use_shorts: true,
        }
    }
}

/// Risk and order management parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of free balance risked per trade, in percent
    pub risk_per_trade_pct: f64,
    /// Base risk/reward ratio before volatility adjustment
    pub risk_reward_ratio: f64,
    pub leverage: u32,
    /// "isolated" or "cross"
    pub margin_mode: String,
    /// Stop distance as a multiple of ATR(14)
    pub atr_multiplier_sl: f64,
    /// Stop distance floor as a percent of entry price
    pub min_sl_pct: f64,
    /// Buffer beyond the swing extremum for emergency stops, in percent
    pub sl_buffer_pct: f64,
    /// Trailing stop activates after price moves this multiple of the
    /// initial stop distance in the favorable direction
    pub trailing_stop_activation_rr: f64,
    /// Trailing stop callback rate in percent
    pub trailing_stop_callback_rate_pct: f64,
    /// Re-entry cooldown after an entry, in minutes
    pub trade_lock_minutes: i64,
    /// Skip entries within this fraction of the last entry price
    pub min_reentry_distance_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 1.0,
            risk_reward_ratio: 2.0,
            leverage: 10,
            margin_mode: "isolated".to_string(),
            atr_multiplier_sl: 2.0,
            min_sl_pct: 0.3,
            sl_buffer_pct: 0.5,
            trailing_stop_activation_rr: 1.5,
            trailing_stop_callback_rate_pct: 0.5,
            trade_lock_minutes: 60,
            min_reentry_distance_pct: 0.015,
        }
    }
}

/// Top-level bot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    pub mode: TradingMode,
    pub market: MarketConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
}

impl BotConfig {
    /// Load from a JSON config file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Key identifying this (symbol, timeframe) pair in the state store
    pub fn lock_key(&self) -> String {
        format!("{}_{}", self.market.symbol, self.market.timeframe)
    }
}
