//! Swing Rotator - Main Entry Point
//!
//! Each invocation runs one tick for one asset and exits. A scheduler
//! (cron, systemd timer) starts one invocation per asset per period.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use swing_rotator::config::Config;
use swing_rotator::coordination::SequenceCoordinator;
use swing_rotator::exchange::{ExchangeApi, KrakenClient};
use swing_rotator::notify::{self, Notifier};
use swing_rotator::persistence::StateStore;
use swing_rotator::strategy::{
    settle_run, CapitalAllocator, DailyReporter, RunExit, TickOutcome, TradingWorker,
};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Swing Rotator CLI
#[derive(Parser)]
#[command(name = "swing-rotator")]
#[command(version, about = "Per-asset swing trading workers sharing one Kraken account")]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one tick of the worker for an asset
    Tick {
        /// Asset symbol, e.g. BTC
        asset: String,
    },

    /// Send the daily overview for an asset and store its value snapshot
    Report {
        /// Asset symbol, e.g. BTC
        asset: String,
    },

    /// Show the persisted state of every configured asset
    Status {
        /// Also fetch prices and balances and show the allocator view
        #[arg(long)]
        live: bool,
    },

    /// Print the last issued sequence value
    Sequence,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let message = format!("Swing rotator configuration error: {e:#}");
            eprintln!("{message}");
            alert_startup_failure(&legacy_env_config(), &message).await;
            return ExitCode::FAILURE;
        }
    };

    // Held until exit so buffered log lines are flushed
    let _guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            let message = format!("Swing rotator failed to initialize logging: {e:#}");
            eprintln!("{message}");
            alert_startup_failure(&config, &message).await;
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Tick { asset } => run_tick(&config, &asset).await,
        Commands::Report { asset } => run_report(&config, &asset).await,
        Commands::Status { live } => exit_code(show_status(&config, live).await),
        Commands::Sequence => exit_code(show_sequence(&config)),
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = Config::load(path)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize logging to stdout and a daily rolling file.
fn init_logging(config: &Config) -> Result<WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(&config.logging.dir)
        .with_context(|| format!("Failed to create log directory {:?}", config.logging.dir))?;

    let file_appender = tracing_appender::rolling::daily(&config.logging.dir, "rotator.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("swing_rotator=debug,info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(guard)
}

/// Defaults plus the legacy `KRAKEN_TOKEN`/`TELEGRAM_ID` variables, for
/// alerting when the real configuration cannot be loaded.
fn legacy_env_config() -> Config {
    let mut config = Config::default();
    config.apply_legacy_env(|key| std::env::var(key).ok());
    config
}

/// Best effort: the operator is told the scheduled run never started.
async fn alert_startup_failure(config: &Config, message: &str) {
    let notifier = notify::from_config(&config.notify);
    notify::notify(notifier.as_ref(), message).await;
}

fn run_exit(exit: RunExit) -> ExitCode {
    match exit {
        RunExit::Clean => ExitCode::SUCCESS,
        RunExit::Failed => ExitCode::FAILURE,
    }
}

fn exit_code(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn sequence_coordinator(config: &Config) -> SequenceCoordinator {
    SequenceCoordinator::new(
        config.paths.sequence_file.clone(),
        Duration::from_millis(config.paths.lock_timeout_ms),
    )
}

fn kraken_client(config: &Config) -> swing_rotator::Result<KrakenClient> {
    KrakenClient::new(&config.kraken, sequence_coordinator(config))
}

fn build_worker(
    config: &Config,
    asset: &str,
    notifier: Arc<dyn Notifier>,
) -> swing_rotator::Result<TradingWorker> {
    let exchange: Arc<dyn ExchangeApi> = Arc::new(kraken_client(config)?);
    TradingWorker::new(asset, config, exchange, notifier)
}

fn rate_limit_cooldown(config: &Config) -> Duration {
    Duration::from_secs(config.paths.rate_limit_cooldown_secs)
}

/// Run one tick and map the outcome to the process exit code.
async fn run_tick(config: &Config, asset: &str) -> ExitCode {
    let notifier = notify::from_config(&config.notify);

    if config.strategy.dry_run {
        warn!(asset, "Dry run: orders are recorded, not sent");
    }

    let outcome = match build_worker(config, asset, notifier.clone()) {
        Ok(worker) => worker.run_tick().await,
        Err(e) => Err(e),
    };

    if let Ok(TickOutcome::Completed(report)) = &outcome {
        info!(
            asset = %report.asset,
            price = %report.price,
            mode = %report.mode_after,
            action = ?report.action,
            "Tick finished"
        );
    }

    run_exit(settle_run(asset, outcome, notifier.as_ref(), rate_limit_cooldown(config)).await)
}

/// Send the daily overview and map the outcome to the process exit code.
async fn run_report(config: &Config, asset: &str) -> ExitCode {
    let notifier = notify::from_config(&config.notify);

    let outcome = match kraken_client(config) {
        Ok(client) => {
            let exchange: Arc<dyn ExchangeApi> = Arc::new(client);
            match DailyReporter::new(asset, config, exchange, notifier.clone()) {
                Ok(reporter) => reporter.run().await,
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    run_exit(settle_run(asset, outcome, notifier.as_ref(), rate_limit_cooldown(config)).await)
}

async fn show_status(config: &Config, live: bool) -> Result<()> {
    let allocator = CapitalAllocator::new(&config.capital);

    println!("Swing Rotator status");

    for asset in allocator.assets() {
        let store = StateStore::new(config.paths.state_file(asset));
        let state = store
            .load()
            .with_context(|| format!("Failed to load state for {asset}"))?;

        println!("\n{} [{}]", asset, state.mode);
        println!("   ├─ Swing High:      {}", fmt_opt(state.swing_high));
        println!("   ├─ Swing Low:       {}", fmt_opt(state.swing_low));
        println!("   ├─ Entry Price:     {}", fmt_opt(state.entry_price));
        println!(
            "   ├─ Entry Time:      {}",
            fmt_opt(state.entry_time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC")))
        );
        println!(
            "   ├─ Alerts Sent:     buy={} sell={}",
            state.buy_approach_sent, state.sell_approach_sent
        );
        println!(
            "   └─ Last Heartbeat:  {}",
            fmt_opt(state.last_heartbeat.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC")))
        );
    }

    if !live {
        return Ok(());
    }

    let client = kraken_client(config).context("Failed to create Kraken client")?;
    let balances = client.balances().await.context("Failed to fetch balances")?;
    let usd = balances.get(&config.markets.quote_balance_key);

    let mut committed = HashMap::new();
    for asset in allocator.assets() {
        let Some(market) = config.market(asset) else {
            continue;
        };
        let quote = client
            .ticker(&market.pair)
            .await
            .with_context(|| format!("Failed to fetch ticker for {}", market.pair))?;
        committed.insert(asset.to_string(), balances.sum_of(&market.balance_keys) * quote.last);
    }

    let snapshot = allocator.allocation_snapshot(usd, &committed);

    println!("\nAllocation (USD available ${:.2})", usd);
    for (asset, view) in &snapshot {
        println!(
            "   {:<5} cap ${:>8.2}  committed ${:>8.2}  allocatable ${:>8.2}  sell {}",
            asset, view.cap_usd, view.committed_usd, view.allocatable_usd, view.sell_fraction
        );
    }

    Ok(())
}

fn show_sequence(config: &Config) -> Result<()> {
    let sequence = sequence_coordinator(config);
    match sequence.peek().context("Failed to read sequence file")? {
        Some(value) => println!("{value}"),
        None => println!("No sequence value issued yet ({})", sequence.path().display()),
    }
    Ok(())
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}
