//! Daily per-asset overview: price, trading slice, core reference holdings
//! and value change since the previous report.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::{Config, MarketConfig};
use crate::error::{Result, RotatorError};
use crate::exchange::ExchangeApi;
use crate::notify::{notify, Notifier};
use crate::persistence::{PortfolioSnapshot, SnapshotStore};
use crate::utils::decimal::pct_change;

use super::worker::fmt_pct;

/// Figures of one daily report, as sent.
#[derive(Debug, Clone)]
pub struct DailyReport {
    pub asset: String,
    pub price: Decimal,
    pub change_24h_pct: Decimal,
    /// Asset held on the exchange
    pub holdings: Decimal,
    /// Quote currency balance of the whole account
    pub usd: Decimal,
    /// `holdings * price + usd`
    pub slice_value: Decimal,
    pub core_holdings: Decimal,
    pub total_value: Decimal,
    /// Change against the previous snapshot; `None` on the first report
    pub pnl_usd: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub slice_low: bool,
    pub message: String,
}

pub struct DailyReporter {
    asset: String,
    market: MarketConfig,
    quote_key: String,
    core_holdings: Decimal,
    min_slice: Option<Decimal>,
    exchange: Arc<dyn ExchangeApi>,
    notifier: Arc<dyn Notifier>,
    store: SnapshotStore,
}

impl DailyReporter {
    pub fn new(
        asset: &str,
        config: &Config,
        exchange: Arc<dyn ExchangeApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let asset = asset.to_uppercase();
        let market = config
            .market(&asset)
            .cloned()
            .ok_or_else(|| RotatorError::UnknownAsset(asset.clone()))?;

        Ok(Self {
            quote_key: config.markets.quote_balance_key.clone(),
            core_holdings: config
                .report
                .core_holdings
                .get(&asset)
                .copied()
                .unwrap_or_default(),
            min_slice: config.report.min_slice.get(&asset).copied(),
            store: SnapshotStore::new(config.paths.snapshot_file(&asset)),
            exchange,
            notifier,
            market,
            asset,
        })
    }

    pub async fn run(&self) -> Result<DailyReport> {
        self.run_at(Utc::now()).await
    }

    /// Build and send the report, then store its total as the next baseline.
    /// Nothing is stored when the exchange cannot be read.
    #[instrument(skip(self), fields(asset = %self.asset))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<DailyReport> {
        let previous = self.store.load()?;

        let quote = self.exchange.ticker(&self.market.pair).await?;
        let balances = self.exchange.balances().await?;

        let price = quote.last;
        let holdings = balances.sum_of(&self.market.balance_keys);
        let usd = balances.get(&self.quote_key);

        let slice_value = holdings * price + usd;
        let total_value = slice_value + self.core_holdings * price;
        let slice_low = self.min_slice.is_some_and(|min| holdings < min);

        let (pnl_usd, pnl_pct) = match &previous {
            Some(prev) => (
                Some(total_value - prev.last_value),
                Some(pct_change(prev.last_value, total_value)),
            ),
            None => (None, None),
        };

        let mut report = DailyReport {
            asset: self.asset.clone(),
            price,
            change_24h_pct: quote.change_24h_pct(),
            holdings,
            usd,
            slice_value,
            core_holdings: self.core_holdings,
            total_value,
            pnl_usd,
            pnl_pct,
            slice_low,
            message: String::new(),
        };
        report.message = self.compose(&report);

        notify(self.notifier.as_ref(), &report.message).await;
        self.store.save(&PortfolioSnapshot {
            last_value: total_value.round_dp(2),
            taken_at: Some(now),
        })?;

        info!(
            total = %total_value.round_dp(2),
            pnl = ?pnl_usd.map(|p| p.round_dp(2)),
            "Daily report sent"
        );

        Ok(report)
    }

    fn compose(&self, r: &DailyReport) -> String {
        let asset = &self.asset;
        let price = r.price.round_dp(self.market.price_decimals);

        let mut msg = format!(
            "📊 Daily {asset} Overview\n\n\
             {asset} Price: ${price}\n\
             24h Change: {}\n\n\
             Kraken (trading slice):\n\
             • {asset}: {}\n\
             • USD (account): ${}\n\
             • Slice Value: ${}",
            fmt_pct(r.change_24h_pct),
            r.holdings.round_dp(8),
            r.usd.round_dp(2),
            r.slice_value.round_dp(2),
        );

        if r.slice_low {
            msg.push_str(&format!(
                "\n⚠️ {asset} slice low, rotation impact may be minimal"
            ));
        }

        if r.core_holdings > Decimal::ZERO {
            msg.push_str(&format!(
                "\n\nCore reference:\n• {asset}: {}\n• Est Value: ${}",
                r.core_holdings.round_dp(8),
                (r.core_holdings * r.price).round_dp(2),
            ));
        }

        msg.push_str(&format!(
            "\n\nTotal exposure:\n• {asset}: {}\n• Est Value: ${}\n\nSince last report:\n",
            (r.holdings + r.core_holdings).round_dp(8),
            r.total_value.round_dp(2),
        ));

        match (r.pnl_usd, r.pnl_pct) {
            (Some(usd), Some(pct)) => {
                let usd = usd.round_dp(2);
                let sign = if usd.is_sign_negative() { "" } else { "+" };
                msg.push_str(&format!("• Unrealized P/L: {sign}{usd} USD ({})", fmt_pct(pct)));
            }
            _ => msg.push_str("• Unrealized P/L: - (first snapshot)"),
        }

        msg
    }
}
