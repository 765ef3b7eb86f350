use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use zonebreak::bot::Bot;
use zonebreak::config::{BotConfig, TradingMode};
use zonebreak::exchange::{BitgetClient, ExchangeClient, PaperExchange};
use zonebreak::notify::Notifier;
use zonebreak::store::StateStore;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "settings.json")]
    config: PathBuf,

    /// Override the configured symbol
    #[arg(short, long)]
    symbol: Option<String>,

    /// Override the configured timeframe
    #[arg(short, long)]
    timeframe: Option<String>,

    /// Force paper mode regardless of configuration
    #[arg(long)]
    paper: bool,

    /// SQLite state database path
    #[arg(long, env = "ZONEBREAK_DB", default_value = "zonebreak.db")]
    db: PathBuf,

    /// Paper-mode starting balance in USDT
    #[arg(long, default_value = "10000")]
    paper_balance: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("zonebreak=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = BotConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(symbol) = args.symbol {
        config.market.symbol = symbol;
    }
    if let Some(timeframe) = args.timeframe {
        config.market.timeframe = timeframe;
    }
    if args.paper {
        config.mode = TradingMode::Paper;
    }

    info!(
        mode = %config.mode,
        symbol = %config.market.symbol,
        timeframe = %config.market.timeframe,
        "starting trading cycle"
    );

    let store = StateStore::open(&args.db)?;
    let notifier = Notifier::from_env();

    let outcome = match config.mode {
        TradingMode::Live => {
            let exchange = BitgetClient::from_env()?;
            run(&exchange, &store, &notifier, &config).await?
        }
        TradingMode::Paper => {
            let exchange = PaperExchange::new(args.paper_balance, 0.0);
            seed_paper_market(&exchange, &config).await?;
            run(&exchange, &store, &notifier, &config).await?
        }
    };

    info!(?outcome, "cycle finished");
    Ok(())
}

async fn run<E: ExchangeClient>(
    exchange: &E,
    store: &StateStore,
    notifier: &Notifier,
    config: &BotConfig,
) -> Result<zonebreak::bot::CycleOutcome> {
    let bot = Bot::new(exchange, store, notifier, config);
    bot.run_cycle().await
}

/// Paper mode still trades against real market data: candles come from
/// the public (unsigned) Bitget endpoints and seed the simulation.
async fn seed_paper_market(paper: &PaperExchange, config: &BotConfig) -> Result<()> {
    let feed = BitgetClient::public()?;
    let candles = feed
        .fetch_candles(
            &config.market.symbol,
            &config.market.timeframe,
            config.market.candle_limit,
        )
        .await
        .context("failed to fetch candles for paper mode")?;

    if let Some(last) = candles.last() {
        paper.set_mark_price(last.close);
    }
    paper.set_candles(candles);
    Ok(())
}
