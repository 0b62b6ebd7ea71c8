/// Harrier momentum trading bot

use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use harrier::broker::{BrokerClient, HttpBroker, SimLedger};
use harrier::config::Config;
use harrier::execution::{BracketManager, Engine};
use harrier::journal::TradeJournal;
use harrier::overrides::OverrideStore;
use harrier::util::{Heartbeat, NyseCalendar};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = Arc::new(Config::load_from_file(&config_path)?);

    let file_appender = tracing_appender::rolling::never(&cfg.files.log_dir, "harrier.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
        .init();

    println!("{} Starting Harrier momentum bot...", "🦅".bright_green());
    println!("✅ Configuration loaded from {config_path}");

    let ledger = cfg.runtime.dry_run.then(|| {
        Arc::new(SimLedger::new(
            &cfg.files.sim_state,
            cfg.runtime.dry_run_slippage_bps,
            cfg.runtime.dry_run_fee,
        ))
    });
    let broker: Arc<dyn BrokerClient> = Arc::new(HttpBroker::new(
        cfg.broker.base_url.clone(),
        cfg.broker.api_key.clone(),
    ));
    let overrides = Arc::new(OverrideStore::new(&cfg.files.overrides));
    let journal = Arc::new(TradeJournal::new(&cfg.files.trades_csv, &cfg.files.mtm_csv));
    let heartbeat = Arc::new(Heartbeat::new());

    let bracket = Arc::new(BracketManager::new(
        cfg.clone(),
        broker.clone(),
        ledger.clone(),
        overrides.clone(),
        journal.clone(),
        Arc::new(NyseCalendar),
    ));
    let engine = Arc::new(Engine::new(
        cfg.clone(),
        broker,
        ledger,
        overrides.clone(),
        bracket,
        heartbeat,
    ));

    info!(
        session = journal.session(),
        dry_run = cfg.runtime.dry_run,
        slippage_bps = cfg.runtime.dry_run_slippage_bps,
        fee_per_trade = cfg.runtime.dry_run_fee,
        "run config"
    );

    let _watcher = overrides.clone().watch();
    let handles = engine.start();

    let tracked = cfg.tickers.len() + cfg.momentum.len();
    println!("🔥 Harrier initialized");
    println!(
        "📊 Tracking {} symbols | max concurrent positions: {}",
        tracked, cfg.runtime.max_concurrent
    );
    if cfg.runtime.dry_run {
        println!("🧪 DRY RUN mode - orders are simulated against the local ledger");
    }

    tokio::signal::ctrl_c().await?;
    warn!("shutting down...");
    for handle in handles {
        handle.abort();
    }
    println!("🛑 Harrier stopped");
    Ok(())
}
