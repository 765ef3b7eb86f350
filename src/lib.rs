// Library crate - exports the trading bot's components

pub mod bot;
pub mod config;
pub mod exchange;
pub mod lifecycle;
pub mod notify;
pub mod reconcile;
pub mod signal;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use bot::{Bot, CycleOutcome};
pub use config::{BotConfig, TradingMode};
pub use types::*;
