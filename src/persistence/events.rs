//! Append-only JSONL trade event log, one file per asset.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Buy,
    Sell,
    /// Buy trigger fired but the allocator granted less than the minimum
    BuySkipped,
    /// Sell trigger fired but the sell amount was dust
    SellSkipped,
    DrawdownReset,
    DryRunOrder,
    Error,
}

/// Allocator figures for one asset around a trade decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationView {
    #[serde(with = "rust_decimal::serde::float")]
    pub cap_usd: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub committed_usd: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub allocatable_usd: Decimal,
}

/// One attempted or completed action. Written once, never read back by workers.
///
/// Amounts are written as JSON numbers for external analysis tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub timestamp_utc: DateTime<Utc>,
    pub event_type: EventType,
    pub asset: String,
    pub pair: String,
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price: Option<Decimal>,
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub quantity: Option<Decimal>,
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub usd_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rationale: Vec<String>,
    /// Event-specific fields, written at the top level of the record
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl TradeEvent {
    pub fn new(event_type: EventType, asset: &str, pair: &str, at: DateTime<Utc>) -> Self {
        Self {
            timestamp_utc: at,
            event_type,
            asset: asset.to_string(),
            pair: pair.to_string(),
            price: None,
            quantity: None,
            usd_amount: None,
            allocation: None,
            rationale: Vec::new(),
            details: Map::new(),
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_usd(mut self, usd_amount: Decimal) -> Self {
        self.usd_amount = Some(usd_amount);
        self
    }

    pub fn with_allocation(mut self, allocation: AllocationView) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.rationale.push(reason.into());
        self
    }

    pub fn detail<T: Serialize>(mut self, key: &str, value: T) -> Self {
        self.details
            .insert(key.to_string(), serde_json::to_value(value).unwrap_or_default());
        self
    }

    /// Decimal detail written as a JSON number; `None` writes null.
    pub fn detail_amount(mut self, key: &str, value: impl Into<Option<Decimal>>) -> Self {
        let number = value
            .into()
            .and_then(|d| d.to_f64())
            .map(Value::from)
            .unwrap_or(Value::Null);
        self.details.insert(key.to_string(), number);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single JSON line.
    pub fn append(&self, event: &TradeEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn read_all(&self) -> Vec<TradeEvent> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_log() -> EventLog {
        EventLog::new(
            std::env::temp_dir()
                .join(format!("rotator_events_{}", uuid::Uuid::new_v4()))
                .join("events_xmr.jsonl"),
        )
    }

    #[test]
    fn test_append_writes_one_line_per_event() {
        let log = temp_log();
        let now = Utc::now();

        log.append(
            &TradeEvent::new(EventType::Buy, "XMR", "XMRUSD", now)
                .with_price(dec!(150))
                .with_quantity(dec!(0.2))
                .with_usd(dec!(30)),
        )
        .unwrap();
        log.append(&TradeEvent::new(EventType::BuySkipped, "XMR", "XMRUSD", now).because("cap reached"))
            .unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let events = log.read_all();
        assert_eq!(events[0].event_type, EventType::Buy);
        assert_eq!(events[0].usd_amount, Some(dec!(30)));
        assert_eq!(events[1].rationale, vec!["cap reached"]);
    }

    #[test]
    fn test_amounts_written_as_numbers() {
        let log = temp_log();
        log.append(
            &TradeEvent::new(EventType::Sell, "XMR", "XMRUSD", Utc::now())
                .with_price(dec!(96.9))
                .with_quantity(dec!(0.51599587))
                .with_allocation(AllocationView {
                    cap_usd: dec!(100),
                    committed_usd: dec!(65.25),
                    allocatable_usd: dec!(21.75),
                }),
        )
        .unwrap();

        let line = fs::read_to_string(log.path()).unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert!(value["price"].is_number());
        assert!(value["allocation"]["committed_usd"].is_number());

        let event = &log.read_all()[0];
        assert_eq!(event.price, Some(dec!(96.9)));
        assert_eq!(event.quantity, Some(dec!(0.51599587)));
        assert_eq!(event.allocation.as_ref().unwrap().allocatable_usd, dec!(21.75));
    }

    #[test]
    fn test_details_are_top_level_fields() {
        let event = TradeEvent::new(EventType::DrawdownReset, "XMR", "XMRUSD", Utc::now())
            .with_price(dec!(87.5))
            .detail_amount("unrealized_loss_pct", dec!(-13.0))
            .detail_amount("entry_price", None)
            .detail("hold_duration_days", 2.5);

        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "drawdown_reset");
        assert_eq!(value["price"], 87.5);
        assert_eq!(value["unrealized_loss_pct"], -13.0);
        assert!(value["entry_price"].is_null());
        assert_eq!(value["hold_duration_days"], 2.5);
        assert!(value.get("timestamp_utc").is_some());
        assert!(value.get("quantity").is_none());
    }
}
