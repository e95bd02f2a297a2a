//! Per-asset trading worker.
//!
//! One `tick` loads the asset's state, reads price and balances, applies the
//! swing state machine, places at most one order and saves the state. Any
//! error before the order leaves the state file untouched, so the next
//! scheduled tick starts clean.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, MarketConfig, StrategyConfig};
use crate::coordination::TickLock;
use crate::error::{Result, RotatorError};
use crate::exchange::{BalanceSnapshot, CachedExchange, ExchangeApi, MarketOrder, OrderSide};
use crate::notify::{notify, Notifier};
use crate::persistence::{
    AllocationView, AssetTradingState, EventLog, EventType, Mode, StateStore, TradeEvent,
};
use crate::strategy::allocator::CapitalAllocator;
use crate::strategy::signals::{evaluate, gain_pct, track_extremes, ExitReason, Signal, Thresholds};
use crate::utils::decimal::{round_down_to_lot, safe_div, VOLUME_STEP};

/// What a completed tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    None,
    /// Existing holdings were taken over as an open position
    Adopted { quantity: Decimal },
    BuyApproachAlert,
    Bought { quantity: Decimal, usd_amount: Decimal },
    BuySkipped,
    SellApproachAlert,
    Sold { reason: ExitReason, quantity: Decimal, usd_amount: Decimal },
    SellSkipped,
    Rearmed,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub asset: String,
    pub price: Decimal,
    pub mode_before: Mode,
    pub mode_after: Mode,
    pub action: TickAction,
    pub heartbeat_sent: bool,
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick of the same asset holds the tick lock
    Skipped,
}

/// Swing worker for one asset.
pub struct TradingWorker {
    asset: String,
    market: MarketConfig,
    quote_key: String,
    exchange: CachedExchange,
    notifier: Arc<dyn Notifier>,
    allocator: CapitalAllocator,
    thresholds: Thresholds,
    strategy: StrategyConfig,
    store: StateStore,
    events: EventLog,
    tick_lock_path: PathBuf,
}

impl TradingWorker {
    /// Build the worker for `asset`. Fails with `UnknownAsset` when the asset
    /// lacks a market or capital entry.
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

        let allocator = CapitalAllocator::new(&config.capital);
        allocator.cap(&asset)?;

        Ok(Self {
            exchange: CachedExchange::new(
                exchange,
                Duration::from_secs(config.kraken.balance_cache_ttl_secs),
            ),
            quote_key: config.markets.quote_balance_key.clone(),
            thresholds: Thresholds::from(&config.strategy),
            strategy: config.strategy.clone(),
            store: StateStore::new(config.paths.state_file(&asset)),
            events: EventLog::new(config.paths.event_log_file(&asset)),
            tick_lock_path: config.paths.tick_lock_file(&asset),
            asset,
            market,
            allocator,
            notifier,
        })
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub async fn run_tick(&self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// One tick evaluated at `now`.
    #[instrument(skip(self), fields(asset = %self.asset))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let Some(_tick_lock) = TickLock::try_acquire(&self.tick_lock_path)? else {
            return Ok(TickOutcome::Skipped);
        };

        let mut state = self.store.load()?;
        let mode_before = state.mode;

        let quote = self.exchange.ticker(&self.market.pair).await?;
        let price = quote.last;
        let balances = self.exchange.balances().await?;

        debug!(
            %price,
            change_24h = %quote.change_24h_pct().round_dp(2),
            mode = %state.mode,
            "Tick started"
        );

        let mut messages = Vec::new();
        let mut action = TickAction::None;

        if let Some(quantity) = self.maybe_adopt(&mut state, &balances, price, now) {
            messages.push(format!(
                "{} position detected\nHolding: {:.8}\nEntry set to {}",
                self.asset,
                quantity,
                self.fmt_price(price)
            ));
            action = TickAction::Adopted { quantity };
        }

        track_extremes(&mut state, price);

        match evaluate(&state, price, &self.thresholds) {
            Signal::None => {}
            Signal::BuyApproach { pullback_pct } => {
                state.buy_approach_sent = true;
                info!(pullback = %pullback_pct.round_dp(2), "Approaching buy trigger");
                messages.push(format!(
                    "{} BUY APPROACH\nPullback: {}\nPrice: {}\nTrigger: {}",
                    self.asset,
                    fmt_pct(pullback_pct),
                    self.fmt_price(price),
                    fmt_pct(self.thresholds.buy_pullback_pct)
                ));
                action = TickAction::BuyApproachAlert;
            }
            Signal::Buy { pullback_pct } => {
                action = self
                    .execute_buy(&mut state, price, pullback_pct, now, &mut messages)
                    .await?;
            }
            Signal::SellApproach { gain_pct } => {
                state.sell_approach_sent = true;
                info!(gain = %gain_pct.round_dp(2), "Approaching sell target");
                messages.push(format!(
                    "{} SELL APPROACH\nGain: {}\nPrice: {}\nTarget: {}",
                    self.asset,
                    fmt_pct(gain_pct),
                    self.fmt_price(price),
                    fmt_pct(self.thresholds.sell_target_pct)
                ));
                action = TickAction::SellApproachAlert;
            }
            Signal::Sell { reason, gain_pct } => {
                action = self
                    .execute_sell(&mut state, price, reason, gain_pct, now, &mut messages)
                    .await?;
            }
            Signal::Rearm { pullback_pct } => {
                state.mode = Mode::Idle;
                state.buy_approach_sent = false;
                info!(pullback = %pullback_pct.round_dp(2), "Pullback after exit, watching for buys again");
                action = TickAction::Rearmed;
            }
        }

        let heartbeat_sent = self
            .maybe_heartbeat(&mut state, price, &balances, now, &mut messages)
            .await;

        debug_assert!(state.is_consistent());
        self.store.save(&state)?;

        for message in &messages {
            notify(self.notifier.as_ref(), message).await;
        }

        info!(
            %price,
            mode_before = %mode_before,
            mode_after = %state.mode,
            action = ?action,
            "Tick complete"
        );

        Ok(TickOutcome::Completed(TickReport {
            asset: self.asset.clone(),
            price,
            mode_before,
            mode_after: state.mode,
            action,
            heartbeat_sent,
        }))
    }

    /// Take over existing holdings while idle, when enabled and worth a trade.
    fn maybe_adopt(
        &self,
        state: &mut AssetTradingState,
        balances: &BalanceSnapshot,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        if !self.strategy.adopt_existing_position || state.mode != Mode::Idle {
            return None;
        }

        let held = balances.sum_of(&self.market.balance_keys);
        if held.is_zero() || held * price < self.allocator.min_trade_usd() {
            return None;
        }

        state.mode = Mode::Hold;
        state.entry_price = Some(price);
        state.entry_time = Some(now);
        state.swing_low = Some(price);
        state.sell_approach_sent = false;

        info!(%held, %price, "Adopted existing holdings as open position");
        Some(held)
    }

    async fn execute_buy(
        &self,
        state: &mut AssetTradingState,
        price: Decimal,
        pullback_pct: Decimal,
        now: DateTime<Utc>,
        messages: &mut Vec<String>,
    ) -> Result<TickAction> {
        // Decide on fresh numbers, not the cached snapshot
        let balances = self.exchange.refresh_balances().await?;
        let usd_live = balances.get(&self.quote_key);
        let view = self.allocation_view(&balances, price)?;
        let grant = view.allocatable_usd;
        let trigger = format!(
            "pullback {} <= {}",
            fmt_pct(pullback_pct),
            fmt_pct(self.thresholds.buy_pullback_pct)
        );

        let spend = grant.min(usd_live);
        let quantity = round_down_to_lot(safe_div(spend, price), VOLUME_STEP);

        if grant.is_zero() || quantity.is_zero() {
            info!(
                %price,
                %usd_live,
                committed = %view.committed_usd,
                cap = %view.cap_usd,
                "Buy trigger fired but nothing allocatable"
            );
            self.record(
                TradeEvent::new(EventType::BuySkipped, &self.asset, &self.market.pair, now)
                    .with_price(price)
                    .with_allocation(view)
                    .because(trigger)
                    .because(if grant.is_zero() {
                        "allocation below minimum trade size"
                    } else {
                        "order volume rounds to zero"
                    }),
            );
            return Ok(TickAction::BuySkipped);
        }

        let order = MarketOrder::new(&self.market.pair, OrderSide::Buy, quantity);
        let txids = self.submit(&order, price, now).await?;

        state.mode = Mode::Hold;
        state.entry_price = Some(price);
        state.entry_time = Some(now);
        state.swing_low = Some(price);
        state.sell_approach_sent = false;

        let mut event = TradeEvent::new(EventType::Buy, &self.asset, &self.market.pair, now)
            .with_price(price)
            .with_quantity(quantity)
            .with_usd(spend)
            .because(trigger)
            .detail("allocation_before", &view)
            .detail("order_txids", &txids)
            .detail("dry_run", self.strategy.dry_run);
        if let Some(after) = self.resulting_allocation(price).await {
            event = event.with_allocation(after);
        }
        self.record(event);

        info!(%price, %quantity, usd = %spend, "Bought");
        messages.push(format!(
            "{} BUY\nPrice: {}\nQty: {:.8}\nSpent: ${:.2}\nPullback: {}\nAllocatable was ${:.2} of ${:.2} cap",
            self.asset,
            self.fmt_price(price),
            quantity,
            spend,
            fmt_pct(pullback_pct),
            view.allocatable_usd,
            view.cap_usd
        ));

        Ok(TickAction::Bought {
            quantity,
            usd_amount: spend,
        })
    }

    async fn execute_sell(
        &self,
        state: &mut AssetTradingState,
        price: Decimal,
        reason: ExitReason,
        gain_pct: Decimal,
        now: DateTime<Utc>,
        messages: &mut Vec<String>,
    ) -> Result<TickAction> {
        let balances = self.exchange.refresh_balances().await?;
        let held = balances.sum_of(&self.market.balance_keys);
        let fraction = self.allocator.sell_fraction(&self.asset)?;
        let quantity = round_down_to_lot(held * fraction, VOLUME_STEP);
        let notional = quantity * price;

        let trigger = match reason {
            ExitReason::Target => format!(
                "gain {} >= {}",
                fmt_pct(gain_pct),
                fmt_pct(self.thresholds.sell_target_pct)
            ),
            ExitReason::DrawdownReset => format!(
                "gain {} <= {}",
                fmt_pct(gain_pct),
                fmt_pct(self.thresholds.drawdown_reset_pct)
            ),
        };

        if quantity.is_zero() || notional < self.allocator.min_trade_usd() {
            info!(%held, %quantity, %notional, %reason, "Sell trigger fired but amount is dust, staying in hold");
            self.record(
                TradeEvent::new(EventType::SellSkipped, &self.asset, &self.market.pair, now)
                    .with_price(price)
                    .with_quantity(quantity)
                    .with_usd(notional)
                    .because(trigger)
                    .because("sell amount below minimum trade size")
                    .detail("reason", reason.as_str()),
            );
            return Ok(TickAction::SellSkipped);
        }

        let order = MarketOrder::new(&self.market.pair, OrderSide::Sell, quantity);
        let txids = self.submit(&order, price, now).await?;

        let entry_price = state.entry_price;
        let hold_duration_days = state
            .entry_time
            .map(|t| ((now - t).num_seconds() as f64 / 86_400.0 * 100.0).round() / 100.0);

        state.mode = Mode::Reset;
        state.entry_price = None;
        state.entry_time = None;
        state.swing_low = None;
        state.sell_approach_sent = false;

        let event_type = match reason {
            ExitReason::Target => EventType::Sell,
            ExitReason::DrawdownReset => EventType::DrawdownReset,
        };
        let mut event = TradeEvent::new(event_type, &self.asset, &self.market.pair, now)
            .with_price(price)
            .with_quantity(quantity)
            .with_usd(notional)
            .because(trigger)
            .detail("reason", reason.as_str())
            .detail_amount("entry_price", entry_price)
            .detail_amount("sell_fraction", fraction)
            .detail("order_txids", &txids)
            .detail("dry_run", self.strategy.dry_run);
        event = match reason {
            ExitReason::DrawdownReset => event
                .detail_amount("unrealized_loss_pct", gain_pct.round_dp(2))
                .detail("hold_duration_days", hold_duration_days),
            ExitReason::Target => event.detail_amount("gain_pct", gain_pct.round_dp(2)),
        };
        if let Some(after) = self.resulting_allocation(price).await {
            event = event.with_allocation(after);
        }
        self.record(event);

        match reason {
            ExitReason::DrawdownReset => {
                warn!(%price, %quantity, loss_pct = %gain_pct.round_dp(2), "Protective reset");
                messages.push(format!(
                    "{} DRAWDOWN RESET\nLoss: {}\nPrice: {}\nSold: {:.8} (${:.2})\nHeld: {} days",
                    self.asset,
                    fmt_pct(gain_pct),
                    self.fmt_price(price),
                    quantity,
                    notional,
                    hold_duration_days
                        .map(|d| format!("{:.2}", d))
                        .unwrap_or_else(|| "?".to_string())
                ));
            }
            ExitReason::Target => {
                info!(%price, %quantity, gain_pct = %gain_pct.round_dp(2), "Target reached, sold");
                messages.push(format!(
                    "{} SELL\nGain: {}\nPrice: {}\nSold: {:.8} (${:.2})",
                    self.asset,
                    fmt_pct(gain_pct),
                    self.fmt_price(price),
                    quantity,
                    notional
                ));
            }
        }

        Ok(TickAction::Sold {
            reason,
            quantity,
            usd_amount: notional,
        })
    }

    /// Send the order, or only record it in dry-run mode. Returns the exchange txids.
    async fn submit(&self, order: &MarketOrder, price: Decimal, now: DateTime<Utc>) -> Result<Vec<String>> {
        if self.strategy.dry_run {
            info!(side = %order.side, volume = %order.volume_str(), "Dry run, order not sent");
            self.record(
                TradeEvent::new(EventType::DryRunOrder, &self.asset, &self.market.pair, now)
                    .with_price(price)
                    .with_quantity(order.volume)
                    .detail("side", order.side),
            );
            return Ok(Vec::new());
        }

        match self.exchange.place_market_order(order).await {
            Ok(ack) => Ok(ack.txids),
            Err(e) => {
                error!(side = %order.side, volume = %order.volume_str(), error = %e, "Order failed");
                self.record(
                    TradeEvent::new(EventType::Error, &self.asset, &self.market.pair, now)
                        .with_price(price)
                        .with_quantity(order.volume)
                        .detail("side", order.side)
                        .detail("error", e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Queue a status message when the interval has elapsed.
    async fn maybe_heartbeat(
        &self,
        state: &mut AssetTradingState,
        price: Decimal,
        tick_balances: &BalanceSnapshot,
        now: DateTime<Utc>,
        messages: &mut Vec<String>,
    ) -> bool {
        let interval = ChronoDuration::hours(i64::from(self.strategy.heartbeat_interval_hours));
        if let Some(last) = state.last_heartbeat {
            if now - last < interval {
                return false;
            }
        }

        // After an order the cache holds the refreshed view
        let balances = match self.exchange.balances().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Balance refresh for heartbeat failed, using tick snapshot");
                tick_balances.clone()
            }
        };

        let held = balances.sum_of(&self.market.balance_keys);
        let usd = balances.get(&self.quote_key);
        let position_value = held * price;
        let cap = self.allocator.cap(&self.asset).unwrap_or(Decimal::ZERO);
        let grant = self
            .allocator
            .allocatable_usd(&self.asset, usd, position_value)
            .unwrap_or(Decimal::ZERO);

        if self.strategy.heartbeat_requires_allocation && grant.is_zero() {
            debug!("Nothing allocatable, heartbeat suppressed");
            return false;
        }

        let pnl_line = match (state.mode, state.entry_price, gain_pct(state, price)) {
            (Mode::Hold, Some(entry), Some(pct)) => format!(
                "PnL vs entry {}: ${:.2} ({})",
                self.fmt_price(entry),
                (price - entry) * held,
                fmt_pct(pct)
            ),
            _ => "PnL: no open position".to_string(),
        };

        messages.push(format!(
            "{} Heartbeat\nMode: {}\nPrice: {}\n{}: {:.8}\nUSD: ${:.2}\nPosition: ${:.2}\n{}\nSwing H/L: {} / {}\nAllocatable: ${:.2} of ${:.2} cap",
            self.asset,
            state.mode,
            self.fmt_price(price),
            self.asset,
            held,
            usd,
            position_value,
            pnl_line,
            self.fmt_opt_price(state.swing_high),
            self.fmt_opt_price(state.swing_low),
            grant,
            cap
        ));

        state.last_heartbeat = Some(now);
        true
    }

    /// Allocator view of this asset for the given balances.
    fn allocation_view(&self, balances: &BalanceSnapshot, price: Decimal) -> Result<AllocationView> {
        let committed = balances.sum_of(&self.market.balance_keys) * price;
        Ok(AllocationView {
            cap_usd: self.allocator.cap(&self.asset)?,
            committed_usd: committed.round_dp(2),
            allocatable_usd: self.allocator.allocatable_usd(
                &self.asset,
                balances.get(&self.quote_key),
                committed,
            )?,
        })
    }

    /// Allocator view after an order, from the balances refreshed by the fill.
    async fn resulting_allocation(&self, price: Decimal) -> Option<AllocationView> {
        let view = match self.exchange.balances().await {
            Ok(balances) => self.allocation_view(&balances, price),
            Err(e) => Err(e),
        };
        match view {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(error = %e, "Could not compute allocation after order");
                None
            }
        }
    }

    fn record(&self, event: TradeEvent) {
        if let Err(e) = self.events.append(&event) {
            warn!(path = ?self.events.path(), error = %e, "Failed to write trade event");
        }
    }

    fn fmt_price(&self, price: Decimal) -> String {
        price.round_dp(self.market.price_decimals).to_string()
    }

    fn fmt_opt_price(&self, price: Option<Decimal>) -> String {
        price
            .map(|p| self.fmt_price(p))
            .unwrap_or_else(|| "-".to_string())
    }
}

pub(crate) fn fmt_pct(pct: Decimal) -> String {
    let pct = pct.round_dp(2);
    if pct.is_sign_negative() {
        format!("{}%", pct)
    } else {
        format!("+{}%", pct)
    }
}
