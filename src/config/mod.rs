//! Configuration management for the swing rotator.
//!
//! Loads settings from built-in defaults, an optional config file and
//! environment variables. The legacy deployment variables (`KRAKEN_API_KEY`,
//! `KRAKEN_PRV_KEY`, `KRAKEN_TOKEN`, `TELEGRAM_ID`) override the loaded values.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Kraken API credentials and transport settings
    #[serde(default)]
    pub kraken: KrakenConfig,
    /// Per-asset USD caps and sell fractions
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Exchange pair and balance-key mapping per asset
    #[serde(default)]
    pub markets: MarketsConfig,
    /// Swing thresholds and worker behaviour
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Shared files and lock timing
    #[serde(default)]
    pub paths: PathsConfig,
    /// Notification sink
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Daily overview report
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KrakenConfig {
    /// Public API key identifier
    #[serde(default)]
    pub api_key: String,
    /// Base64-encoded private key used for request signatures
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout, also the bound on waiting for an order response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Total attempts for retryable requests (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// How long a fetched balance snapshot is reused within one process
    #[serde(default = "default_balance_cache_ttl")]
    pub balance_cache_ttl_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Smallest USD amount worth sending as an order
    #[serde(default = "default_min_trade_usd")]
    pub min_trade_usd: Decimal,
    /// Asset symbol -> exposure cap and sell fraction
    #[serde(default = "default_capital_assets")]
    pub assets: BTreeMap<String, AssetCapital>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetCapital {
    /// Maximum USD exposure this asset may hold
    pub cap_usd: Decimal,
    /// Fraction of holdings sold per sell event (0 < f <= 1)
    pub sell_fraction: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketsConfig {
    /// Balance key of the shared USD pool
    #[serde(default = "default_quote_balance_key")]
    pub quote_balance_key: String,
    #[serde(default = "default_markets")]
    pub assets: BTreeMap<String, MarketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketConfig {
    /// Exchange pair name (e.g. "XBTUSD")
    pub pair: String,
    /// Every balance key that holds this asset; holdings are their sum
    pub balance_keys: Vec<String>,
    /// Decimal places used when printing prices
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Pullback from swing high that triggers a buy (percent, negative)
    #[serde(default = "default_buy_pullback")]
    pub buy_pullback_pct: Decimal,
    /// Pullback that raises the advisory buy-approach alert
    #[serde(default = "default_buy_approach")]
    pub buy_approach_pct: Decimal,
    /// Gain from entry that triggers the target sell
    #[serde(default = "default_sell_target")]
    pub sell_target_pct: Decimal,
    /// Gain that raises the advisory sell-approach alert
    #[serde(default = "default_sell_approach")]
    pub sell_approach_pct: Decimal,
    /// Loss from entry that forces the protective reset
    #[serde(default = "default_drawdown_reset")]
    pub drawdown_reset_pct: Decimal,
    #[serde(default = "default_heartbeat_interval_hours")]
    pub heartbeat_interval_hours: u32,
    /// Stay quiet while the allocator grants nothing to this asset
    #[serde(default)]
    pub heartbeat_requires_allocation: bool,
    /// Treat existing holdings found while idle as an open position
    #[serde(default)]
    pub adopt_existing_position: bool,
    /// Log orders instead of sending them
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding per-asset state files, event logs and tick locks
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Sequence counter shared by every worker using the same credentials
    #[serde(default = "default_sequence_file")]
    pub sequence_file: PathBuf,
    /// Bounded wait for the sequence file lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Sleep before a clean exit after the exchange rate-limits us
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub telegram_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Holdings kept off the exchange (e.g. a hardware wallet), per asset,
    /// added to the report's total exposure
    #[serde(default)]
    pub core_holdings: BTreeMap<String, Decimal>,
    /// Per asset: exchange holdings below this get a "slice low" note
    #[serde(default = "default_min_slice")]
    pub min_slice: BTreeMap<String, Decimal>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            core_holdings: BTreeMap::new(),
            min_slice: default_min_slice(),
        }
    }
}

// Default value functions
fn default_min_slice() -> BTreeMap<String, Decimal> {
    BTreeMap::from([
        ("BTC".to_string(), Decimal::new(1, 3)),
        ("XMR".to_string(), Decimal::new(1, 1)),
    ])
}

fn default_base_url() -> String {
    "https://api.kraken.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_balance_cache_ttl() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("swing-rotator/{}", env!("CARGO_PKG_VERSION"))
}

fn default_min_trade_usd() -> Decimal {
    Decimal::new(10, 0) // $10
}

fn default_capital_assets() -> BTreeMap<String, AssetCapital> {
    ["BTC", "ETH", "XMR", "SOL", "XRP"]
        .into_iter()
        .map(|symbol| {
            (
                symbol.to_string(),
                AssetCapital {
                    cap_usd: Decimal::new(100, 0),
                    sell_fraction: Decimal::new(25, 2), // 0.25
                },
            )
        })
        .collect()
}

fn default_quote_balance_key() -> String {
    "ZUSD".to_string()
}

fn default_markets() -> BTreeMap<String, MarketConfig> {
    let market = |pair: &str, keys: &[&str], price_decimals: u32| MarketConfig {
        pair: pair.to_string(),
        balance_keys: keys.iter().map(|k| k.to_string()).collect(),
        price_decimals,
    };

    BTreeMap::from([
        ("BTC".to_string(), market("XBTUSD", &["XXBT", "XBT"], 2)),
        ("ETH".to_string(), market("ETHUSD", &["XETH", "ETH"], 2)),
        ("XMR".to_string(), market("XMRUSD", &["XXMR", "XMR"], 2)),
        ("SOL".to_string(), market("SOLUSD", &["SOL", "XSOL"], 2)),
        ("XRP".to_string(), market("XRPUSD", &["XXRP", "XRP"], 4)),
    ])
}

fn default_price_decimals() -> u32 {
    2
}

fn default_buy_pullback() -> Decimal {
    Decimal::new(-30, 1) // -3.0%
}

fn default_buy_approach() -> Decimal {
    Decimal::new(-25, 1) // -2.5%
}

fn default_sell_target() -> Decimal {
    Decimal::new(50, 1) // +5.0%
}

fn default_sell_approach() -> Decimal {
    Decimal::new(40, 1) // +4.0%
}

fn default_drawdown_reset() -> Decimal {
    Decimal::new(-120, 1) // -12.0%
}

fn default_heartbeat_interval_hours() -> u32 {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_sequence_file() -> PathBuf {
    PathBuf::from("data/kraken_nonce.txt")
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_rate_limit_cooldown() -> u64 {
    30
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Config {
    /// Load configuration from environment variables and config files.
    ///
    /// `path` overrides the default `config` file lookup; the default file is optional.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => config::File::with_name(p).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::default().separator("__").prefix("ROTATOR"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.normalize_symbols();
        config.merge_default_assets();
        config.apply_legacy_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Upper-case asset symbols; file and environment sources lower-case map keys.
    fn normalize_symbols(&mut self) {
        self.capital.assets = std::mem::take(&mut self.capital.assets)
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self.markets.assets = std::mem::take(&mut self.markets.assets)
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self.report.core_holdings = std::mem::take(&mut self.report.core_holdings)
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self.report.min_slice = std::mem::take(&mut self.report.min_slice)
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
    }

    /// Keep the built-in assets that a partial file or environment override
    /// left out. Setting an asset's `cap_usd` to 0 disables its buys.
    fn merge_default_assets(&mut self) {
        for (symbol, capital) in default_capital_assets() {
            self.capital.assets.entry(symbol).or_insert(capital);
        }
        for (symbol, market) in default_markets() {
            self.markets.assets.entry(symbol).or_insert(market);
        }
        for (symbol, min) in default_min_slice() {
            self.report.min_slice.entry(symbol).or_insert(min);
        }
    }

    /// Overlay the variable names used by existing deployments.
    pub fn apply_legacy_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = present("KRAKEN_API_KEY") {
            self.kraken.api_key = v;
        }
        if let Some(v) = present("KRAKEN_PRV_KEY") {
            self.kraken.secret_key = v;
        }
        if let Some(v) = present("KRAKEN_TOKEN") {
            self.notify.telegram_token = Some(v);
        }
        if let Some(v) = present("TELEGRAM_ID") {
            self.notify.telegram_chat_id = Some(v);
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        for (symbol, asset) in &self.capital.assets {
            anyhow::ensure!(
                asset.sell_fraction > Decimal::ZERO && asset.sell_fraction <= Decimal::ONE,
                "sell_fraction for {} must be in (0, 1]",
                symbol
            );
            anyhow::ensure!(
                asset.cap_usd >= Decimal::ZERO,
                "cap_usd for {} must not be negative",
                symbol
            );
            anyhow::ensure!(
                self.markets.assets.contains_key(symbol),
                "asset {} has a capital entry but no market entry",
                symbol
            );
        }

        anyhow::ensure!(
            self.capital.min_trade_usd >= Decimal::ZERO,
            "min_trade_usd must not be negative"
        );

        let s = &self.strategy;
        anyhow::ensure!(
            s.drawdown_reset_pct < s.buy_pullback_pct
                && s.buy_pullback_pct < s.buy_approach_pct
                && s.buy_approach_pct < Decimal::ZERO,
            "thresholds must satisfy drawdown_reset < buy_pullback < buy_approach < 0"
        );
        anyhow::ensure!(
            Decimal::ZERO < s.sell_approach_pct && s.sell_approach_pct < s.sell_target_pct,
            "thresholds must satisfy 0 < sell_approach < sell_target"
        );

        anyhow::ensure!(self.kraken.max_attempts >= 1, "max_attempts must be >= 1");

        Ok(())
    }

    /// Market entry for an asset symbol (case-insensitive).
    pub fn market(&self, asset: &str) -> Option<&MarketConfig> {
        self.markets.assets.get(&asset.to_uppercase())
    }
}

impl PathsConfig {
    /// Persisted swing state for one asset.
    pub fn state_file(&self, asset: &str) -> PathBuf {
        self.data_dir
            .join(format!("state_{}.json", asset.to_lowercase()))
    }

    /// Append-only trade event log for one asset.
    pub fn event_log_file(&self, asset: &str) -> PathBuf {
        self.data_dir
            .join(format!("events_{}.jsonl", asset.to_lowercase()))
    }

    /// Portfolio value recorded by the last daily report of one asset.
    pub fn snapshot_file(&self, asset: &str) -> PathBuf {
        self.data_dir
            .join(format!("snapshot_{}.json", asset.to_lowercase()))
    }

    /// Lock file guarding a whole tick of one asset.
    pub fn tick_lock_file(&self, asset: &str) -> PathBuf {
        self.data_dir
            .join(format!("tick_{}.lock", asset.to_lowercase()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kraken: KrakenConfig::default(),
            capital: CapitalConfig::default(),
            markets: MarketsConfig::default(),
            strategy: StrategyConfig::default(),
            paths: PathsConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for KrakenConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            balance_cache_ttl_secs: default_balance_cache_ttl(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            min_trade_usd: default_min_trade_usd(),
            assets: default_capital_assets(),
        }
    }
}

impl Default for MarketsConfig {
    fn default() -> Self {
        Self {
            quote_balance_key: default_quote_balance_key(),
            assets: default_markets(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            buy_pullback_pct: default_buy_pullback(),
            buy_approach_pct: default_buy_approach(),
            sell_target_pct: default_sell_target(),
            sell_approach_pct: default_sell_approach(),
            drawdown_reset_pct: default_drawdown_reset(),
            heartbeat_interval_hours: default_heartbeat_interval_hours(),
            heartbeat_requires_allocation: false,
            adopt_existing_position: false,
            dry_run: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sequence_file: default_sequence_file(),
            lock_timeout_ms: default_lock_timeout_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            telegram_chat_id: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            json: false,
        }
    }
}
