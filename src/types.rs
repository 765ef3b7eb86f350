//! Shared market data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV candle with a fixed period duration.
///
/// Candle sequences are ordered by strictly increasing timestamps and are
/// immutable once fetched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time of the bar
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Higher of open/close (body top)
    pub fn body_high(&self) -> f64 {
        self.open.max(self.close)
    }

    /// Lower of open/close (body bottom)
    pub fn body_low(&self) -> f64 {
        self.open.min(self.close)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Order side string used by the exchange ("buy"/"sell") when opening
    /// a position in this direction.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "buy",
            Self::Short => "sell",
        }
    }

    /// Order side string that closes a position in this direction.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Self::Long => "sell",
            Self::Short => "buy",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Per-bar trading signal. At most one is emitted per bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Long,
    Short,
    None,
}

impl Signal {
    pub fn is_some(&self) -> bool {
        !matches!(self, Signal::None)
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Long => Some(Side::Long),
            Signal::Short => Some(Side::Short),
            Signal::None => None,
        }
    }
}

/// Higher-timeframe directional bias used to veto counter-trend entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    /// True when this bias forbids entering `side`.
    pub fn vetoes(&self, side: Side) -> bool {
        match (self, side) {
            (Bias::Bullish, Side::Short) => true,
            (Bias::Bearish, Side::Long) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_str() {
        assert_eq!("long".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Short);
        assert!("flat".parse::<Side>().is_err());
    }

    #[test]
    fn bias_veto_is_counter_trend_only() {
        assert!(Bias::Bullish.vetoes(Side::Short));
        assert!(!Bias::Bullish.vetoes(Side::Long));
        assert!(Bias::Bearish.vetoes(Side::Long));
        assert!(!Bias::Neutral.vetoes(Side::Long));
        assert!(!Bias::Neutral.vetoes(Side::Short));
    }
}
