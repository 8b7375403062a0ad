//! Autonomous spot trading engine.
//!
//! Sizes entries under a risk budget, survives unreliable exchange calls
//! and retunes its own risk knobs from closed trades.

mod bot;
mod config;
mod db;
mod error;
mod exchange;
mod models;
mod notify;
mod oracle;
mod risk;
mod tuner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::bot::{Bot, Lifecycle};
use crate::config::BotConfig;
use crate::db::Database;
use crate::error::BotError;
use crate::exchange::{BinanceClient, Exchange, PaperExchange};
use crate::notify::{Notifications, TelegramNotifier};
use crate::oracle::HttpOracle;

/// Autonomous trading engine CLI.
#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Risk-budgeted, self-tuning spot trading bot", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./autotrader.db?mode=rwc")]
    database: String,

    /// Log level used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot and run until ctrl-c
    Run,

    /// Show stored positions, trades and tuner state
    Status,

    /// Cancel open orders and clear stale positions
    Sync,

    /// Show the effective configuration
    Config {
        /// Persist the effective configuration to the database
        #[arg(long)]
        save: bool,
    },

    /// Show recent trade history
    Trades {
        /// Number of trades to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let db = Database::new(&cli.database).await?;
    let config = load_config(&db).await?;

    match cli.command {
        Commands::Run => {
            let bot = Arc::new(build_bot(config, db)?);
            let report = bot.start().await?;
            println!("Account sync: {:?}", report.status);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        if bot.lifecycle().await == Lifecycle::Stopped {
                            warn!("Control loop ended on its own");
                            break;
                        }
                    }
                }
            }

            match bot.stop().await {
                Ok(report) => {
                    println!("Closed {} positions in {} rounds", report.closed, report.rounds);
                    if !report.unresolved.is_empty() {
                        println!("UNRESOLVED exposure: {}", report.unresolved.join(", "));
                    }
                }
                Err(BotError::NotRunning) => {}
                Err(e) => return Err(e.into()),
            }
            println!("\n{}", bot.get_status().await);
        }

        Commands::Status => {
            let positions = db.get_open_positions().await?;
            let (trade_count, total_pnl) = db.trade_summary().await?;

            println!("\n=== Open Positions ({}) ===", positions.len());
            for p in &positions {
                println!(
                    "  {} {} qty {} @ {} (SL {} / TP {}) since {}",
                    p.side,
                    p.symbol,
                    p.quantity.round_dp(8),
                    p.entry_price.round_dp(8),
                    p.stop_loss.round_dp(8),
                    p.take_profit.round_dp(8),
                    p.opened_at.format("%Y-%m-%d %H:%M")
                );
            }

            println!("\n=== Trades ===");
            println!("Total Trades:   {}", trade_count);
            println!("Realized P&L:   {:.2} {}", total_pnl, config.quote_asset);

            match db.latest_tuner_snapshot().await? {
                Some(s) => {
                    println!("\n=== Tuner ({}) ===", s.mode);
                    println!("Snapshot:       {}", s.created_at.format("%Y-%m-%d %H:%M:%S"));
                    println!("Win Rate:       {:.1}%", s.metrics.win_rate);
                    println!("Profit Factor:  {:.2}", s.metrics.profit_factor);
                    println!("Min Confidence: {:.3}", s.params.min_confidence);
                    println!("SL Multiplier:  {:.3}", s.params.stop_loss_multiplier);
                    println!("TP Multiplier:  {:.3}", s.params.take_profit_multiplier);
                    println!("Size Multiplier:{:.3}", s.params.position_size_multiplier);
                }
                None => println!("\nNo tuner snapshot yet."),
            }
        }

        Commands::Sync => {
            let bot = build_bot(config, db)?;
            let report = bot.sync_account().await?;
            println!("Status:           {:?}", report.status);
            println!("Open orders:      {}", report.orders_found);
            println!("Cancelled:        {}", report.orders_cancelled);
            println!("Cancel failures:  {}", report.cancel_failures);
            println!("Positions removed:{}", report.positions_removed);
            if let Some(message) = report.message {
                println!("Message:          {}", message);
            }
        }

        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                db.save_config(&config).await?;
                println!("\nConfiguration saved.");
            }
        }

        Commands::Trades { limit } => {
            let trades = db.recent_trades(limit).await?;
            if trades.is_empty() {
                println!("No trades recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<17} {:<10} {:<5} {:>14} {:>14} {:>12} {:>8} {:<12}",
                "CLOSED", "SYMBOL", "SIDE", "ENTRY", "EXIT", "PNL", "RET%", "REASON"
            );
            println!("{}", "-".repeat(100));
            for t in trades {
                println!(
                    "{:<17} {:<10} {:<5} {:>14} {:>14} {:>12} {:>7}% {:<12}",
                    t.closed_at.format("%Y-%m-%d %H:%M"),
                    t.symbol,
                    t.side,
                    t.entry_price.round_dp(6),
                    t.exit_price.round_dp(6),
                    t.pnl.round_dp(4),
                    t.return_pct.round_dp(2),
                    t.close_reason
                );
            }
        }
    }

    Ok(())
}

/// Environment defaults overridden by the stored document, if any.
async fn load_config(db: &Database) -> Result<BotConfig> {
    let config = BotConfig::from_env()?;
    match db.load_config().await {
        Ok(Some(stored)) => Ok(config.merged_with(stored)),
        Ok(None) => Ok(config),
        Err(e) => {
            warn!(error = %e, "Ignoring stored configuration");
            Ok(config)
        }
    }
}

fn build_bot(config: BotConfig, db: Database) -> Result<Bot> {
    let exchange = build_exchange(&config)?;
    let notifications = build_notifications(&config)?;
    let oracle = Arc::new(HttpOracle::new(config.oracle_url.clone())?);
    Ok(Bot::new(config, db, exchange, oracle, notifications))
}

fn build_exchange(config: &BotConfig) -> Result<Arc<dyn Exchange>> {
    if config.dry_run {
        let feed = BinanceClient::public(config.testnet).context("Failed to create price feed")?;
        info!(balance = %config.paper_balance, "Dry run: paper exchange on live prices");
        let paper = PaperExchange::new(&config.quote_asset, config.paper_balance).with_feed(Arc::new(feed));
        return Ok(Arc::new(paper));
    }

    let credentials = &config.credentials;
    if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
        bail!("BINANCE_API_KEY and BINANCE_API_SECRET are required unless DRY_RUN is set");
    }
    let client = BinanceClient::new(
        credentials.api_key.clone(),
        credentials.api_secret.clone(),
        config.testnet,
    )
    .context("Failed to create exchange client")?;
    Ok(Arc::new(client))
}

fn build_notifications(config: &BotConfig) -> Result<Notifications> {
    let credentials = &config.credentials;
    match (&credentials.telegram_token, &credentials.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            let notifier = TelegramNotifier::new(token.clone(), chat_id.clone())?;
            Ok(Notifications::new(Arc::new(notifier)))
        }
        _ => {
            info!("Telegram not configured, notifications go to the log");
            Ok(Notifications::log_only())
        }
    }
}
