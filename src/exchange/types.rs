//! Type definitions for Kraken API responses and the venue-neutral values
//! the worker consumes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::utils::decimal::pct_change;

// ==================== Wire Types ====================

/// Every Kraken REST response: an error list plus an optional result.
#[derive(Debug, Clone, Deserialize)]
pub struct KrakenResponse<T> {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<T>,
}

/// One entry of the public Ticker result.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerInfo {
    /// Last trade closed: [price, lot volume]
    pub c: Vec<String>,
    /// Today's opening price
    #[serde(with = "rust_decimal::serde::str")]
    pub o: Decimal,
}

/// Result of AddOrder.
#[derive(Debug, Clone, Deserialize)]
pub struct AddOrderResult {
    #[serde(default)]
    pub descr: Option<OrderDescription>,
    #[serde(default)]
    pub txid: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderDescription {
    pub order: String,
}

// ==================== Domain Types ====================

/// Last traded price and 24h open for a pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub pair: String,
    pub last: Decimal,
    pub open_24h: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl PriceQuote {
    pub fn change_24h_pct(&self) -> Decimal {
        pct_change(self.open_24h, self.last)
    }
}

/// Account balances keyed by Kraken asset code (e.g. "XXBT", "ZUSD").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceSnapshot {
    balances: HashMap<String, Decimal>,
}

impl BalanceSnapshot {
    pub fn new(balances: HashMap<String, Decimal>) -> Self {
        Self { balances }
    }

    /// Balance for one key, zero when absent.
    pub fn get(&self, key: &str) -> Decimal {
        self.balances.get(key).copied().unwrap_or(Decimal::ZERO)
    }

    /// Sum over every key an asset may be reported under.
    pub fn sum_of<S: AsRef<str>>(&self, keys: &[S]) -> Decimal {
        keys.iter().map(|k| self.get(k.as_ref())).sum()
    }

    pub fn set(&mut self, key: impl Into<String>, amount: Decimal) {
        self.balances.insert(key.into(), amount);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A market order for `volume` units of the pair's base asset.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub pair: String,
    pub side: OrderSide,
    pub volume: Decimal,
}

impl MarketOrder {
    pub fn new(pair: impl Into<String>, side: OrderSide, volume: Decimal) -> Self {
        Self {
            pair: pair.into(),
            side,
            volume,
        }
    }

    /// Volume as sent on the wire: 8 decimal places, truncated.
    pub fn volume_str(&self) -> String {
        format!(
            "{:.8}",
            self.volume
                .round_dp_with_strategy(8, rust_decimal::RoundingStrategy::ToZero)
        )
    }
}

/// Exchange acknowledgement of an accepted order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderAck {
    pub txids: Vec<String>,
    pub description: String,
}

impl From<AddOrderResult> for OrderAck {
    fn from(result: AddOrderResult) -> Self {
        Self {
            txids: result.txid,
            description: result.descr.map(|d| d.order).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_ticker_envelope() {
        let body = r#"{
            "error": [],
            "result": {
                "XXBTZUSD": {
                    "a": ["30300.10000", "1", "1.000"],
                    "c": ["30303.20000", "0.00067643"],
                    "o": "30502.80000"
                }
            }
        }"#;

        let resp: KrakenResponse<HashMap<String, TickerInfo>> = serde_json::from_str(body).unwrap();
        assert!(resp.error.is_empty());
        let info = resp.result.unwrap().remove("XXBTZUSD").unwrap();
        assert_eq!(info.c[0], "30303.20000");
        assert_eq!(info.o, dec!(30502.8));
    }

    #[test]
    fn test_parse_error_envelope_without_result() {
        let body = r#"{"error":["EAPI:Invalid key"]}"#;
        let resp: KrakenResponse<HashMap<String, Decimal>> = serde_json::from_str(body).unwrap();
        assert_eq!(resp.error, vec!["EAPI:Invalid key"]);
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_balance_sum_over_aliases() {
        let mut snapshot = BalanceSnapshot::default();
        snapshot.set("SOL", dec!(1.5));
        snapshot.set("XSOL", dec!(0.25));
        snapshot.set("ZUSD", dec!(80));

        assert_eq!(snapshot.sum_of(&["SOL", "XSOL"]), dec!(1.75));
        assert_eq!(snapshot.get("XXBT"), Decimal::ZERO);
        assert_eq!(snapshot.get("ZUSD"), dec!(80));
    }

    #[test]
    fn test_volume_formatting() {
        let order = MarketOrder::new("XBTUSD", OrderSide::Buy, dec!(0.123456789));
        assert_eq!(order.volume_str(), "0.12345678");

        let order = MarketOrder::new("XBTUSD", OrderSide::Sell, dec!(2));
        assert_eq!(order.volume_str(), "2.00000000");
    }

    #[test]
    fn test_order_ack_from_result() {
        let body = r#"{"descr":{"order":"buy 0.5 XBTUSD @ market"},"txid":["OUF4EM-FRGI2-MQMWZD"]}"#;
        let result: AddOrderResult = serde_json::from_str(body).unwrap();
        let ack = OrderAck::from(result);
        assert_eq!(ack.txids, vec!["OUF4EM-FRGI2-MQMWZD"]);
        assert_eq!(ack.description, "buy 0.5 XBTUSD @ market");
    }

    #[test]
    fn test_change_24h() {
        let quote = PriceQuote {
            pair: "ETHUSD".into(),
            last: dec!(105),
            open_24h: dec!(100),
            fetched_at: Utc::now(),
        };
        assert_eq!(quote.change_24h_pct(), dec!(5));
    }
}
