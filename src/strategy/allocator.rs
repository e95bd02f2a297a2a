//! Capital admission control across assets sharing one USD pool.
//!
//! The allocator is a pure function of its inputs. It neither observes nor
//! reserves capital: callers pass in the live USD balance and what the asset
//! already has committed, and must re-fetch balances before acting. Two workers
//! deciding within the same instant can therefore both see the same free USD;
//! the exchange rejecting the second order for insufficient funds is the
//! backstop.

use crate::config::{AssetCapital, CapitalConfig};
use crate::error::{Result, RotatorError};
use crate::utils::decimal::floor_cents;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Allocator view of one asset, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetAllocation {
    pub cap_usd: Decimal,
    pub committed_usd: Decimal,
    /// Cap headroom, never negative
    pub remaining_usd: Decimal,
    pub allocatable_usd: Decimal,
    pub sell_fraction: Decimal,
}

/// Per-asset USD caps and sell fractions.
#[derive(Debug, Clone)]
pub struct CapitalAllocator {
    policies: BTreeMap<String, AssetCapital>,
    min_trade_usd: Decimal,
}

impl CapitalAllocator {
    /// Create a new capital allocator. Asset symbols are matched case-insensitively.
    pub fn new(config: &CapitalConfig) -> Self {
        Self {
            policies: config
                .assets
                .iter()
                .map(|(symbol, policy)| (symbol.to_uppercase(), policy.clone()))
                .collect(),
            min_trade_usd: config.min_trade_usd,
        }
    }

    pub fn min_trade_usd(&self) -> Decimal {
        self.min_trade_usd
    }

    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    fn policy(&self, asset: &str) -> Result<&AssetCapital> {
        self.policies
            .get(&asset.to_uppercase())
            .ok_or_else(|| RotatorError::UnknownAsset(asset.to_string()))
    }

    pub fn cap(&self, asset: &str) -> Result<Decimal> {
        Ok(self.policy(asset)?.cap_usd)
    }

    /// USD this asset may spend now.
    ///
    /// `min(cap - committed, available)` truncated to cents, or zero when the
    /// cap is used up or the amount would fall below the minimum trade size.
    /// Truncation keeps `committed + result <= cap`.
    pub fn allocatable_usd(
        &self,
        asset: &str,
        usd_total_available: Decimal,
        usd_already_committed: Decimal,
    ) -> Result<Decimal> {
        let cap = self.cap(asset)?;
        let remaining = cap - usd_already_committed;

        if remaining <= Decimal::ZERO {
            debug!(asset, %cap, committed = %usd_already_committed, "Cap exhausted");
            return Ok(Decimal::ZERO);
        }

        let tradeable = floor_cents(remaining.min(usd_total_available.max(Decimal::ZERO)));
        if tradeable < self.min_trade_usd {
            debug!(asset, %tradeable, min = %self.min_trade_usd, "Below minimum trade size");
            return Ok(Decimal::ZERO);
        }

        Ok(tradeable)
    }

    /// Fraction of current holdings to sell on a sell event.
    pub fn sell_fraction(&self, asset: &str) -> Result<Decimal> {
        Ok(self.policy(asset)?.sell_fraction)
    }

    /// Every configured asset's cap, commitment and current grant. Observability only.
    pub fn allocation_snapshot(
        &self,
        usd_total_available: Decimal,
        committed_by_asset: &HashMap<String, Decimal>,
    ) -> BTreeMap<String, AssetAllocation> {
        let committed: HashMap<String, Decimal> = committed_by_asset
            .iter()
            .map(|(k, v)| (k.to_uppercase(), *v))
            .collect();

        self.policies
            .iter()
            .map(|(symbol, policy)| {
                let committed_usd = committed.get(symbol).copied().unwrap_or(Decimal::ZERO);
                let allocatable_usd = self
                    .allocatable_usd(symbol, usd_total_available, committed_usd)
                    .unwrap_or(Decimal::ZERO);

                (
                    symbol.clone(),
                    AssetAllocation {
                        cap_usd: policy.cap_usd,
                        committed_usd,
                        remaining_usd: (policy.cap_usd - committed_usd).max(Decimal::ZERO),
                        allocatable_usd,
                        sell_fraction: policy.sell_fraction,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn test_allocator() -> CapitalAllocator {
        CapitalAllocator::new(&CapitalConfig::default())
    }

    // =========================================================================
    // allocatable_usd
    // =========================================================================

    #[test]
    fn test_grant_limited_by_remaining_cap() {
        let alloc = test_allocator();
        assert_eq!(alloc.allocatable_usd("BTC", dec!(500), dec!(40)).unwrap(), dec!(60));
    }

    #[test]
    fn test_grant_limited_by_available_usd() {
        let alloc = test_allocator();
        assert_eq!(alloc.allocatable_usd("ETH", dec!(35.5), dec!(0)).unwrap(), dec!(35.5));
    }

    #[test]
    fn test_exhausted_cap_grants_nothing() {
        let alloc = test_allocator();
        for available in [dec!(0), dec!(50), dec!(10_000)] {
            assert_eq!(alloc.allocatable_usd("BTC", available, dec!(100)).unwrap(), Decimal::ZERO);
            assert_eq!(alloc.allocatable_usd("BTC", available, dec!(130)).unwrap(), Decimal::ZERO);
        }
    }

    #[test]
    fn test_minimum_trade_floor() {
        let alloc = test_allocator();
        // Remaining cap under the $10 minimum
        assert_eq!(alloc.allocatable_usd("SOL", dec!(500), dec!(91)).unwrap(), Decimal::ZERO);
        // Available USD under the minimum
        assert_eq!(alloc.allocatable_usd("SOL", dec!(9.99), dec!(0)).unwrap(), Decimal::ZERO);
        // Exactly the minimum is allowed
        assert_eq!(alloc.allocatable_usd("SOL", dec!(10), dec!(0)).unwrap(), dec!(10));
    }

    #[test]
    fn test_grant_truncated_to_cents_within_cap() {
        let alloc = test_allocator();
        let committed = dec!(33.333);
        let grant = alloc.allocatable_usd("XRP", dec!(1000), committed).unwrap();
        assert_eq!(grant, dec!(66.66));
        assert!(committed + grant <= dec!(100));
    }

    #[test]
    fn test_cap_never_exceeded() {
        let alloc = test_allocator();
        let mut committed = dec!(0);
        while committed <= dec!(120) {
            for available in [dec!(0), dec!(7.77), dec!(55.555), dec!(250)] {
                let grant = alloc.allocatable_usd("XMR", available, committed).unwrap();
                if grant > Decimal::ZERO {
                    assert!(committed + grant <= dec!(100));
                    assert!(grant >= alloc.min_trade_usd());
                    assert!(grant <= available);
                }
            }
            committed += dec!(3.7);
        }
    }

    #[test]
    fn test_allocator_is_pure() {
        let alloc = test_allocator();
        let first = alloc.allocatable_usd("ETH", dec!(80), dec!(25)).unwrap();
        let second = alloc.allocatable_usd("ETH", dec!(80), dec!(25)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_negative_available_grants_nothing() {
        let alloc = test_allocator();
        assert_eq!(alloc.allocatable_usd("BTC", dec!(-5), dec!(0)).unwrap(), Decimal::ZERO);
    }

    // =========================================================================
    // sell_fraction / unknown assets
    // =========================================================================

    #[test]
    fn test_sell_fraction() {
        let alloc = test_allocator();
        assert_eq!(alloc.sell_fraction("btc").unwrap(), dec!(0.25));
    }

    #[test]
    fn test_unknown_asset() {
        let alloc = test_allocator();
        assert!(matches!(
            alloc.allocatable_usd("DOGE", dec!(100), dec!(0)),
            Err(RotatorError::UnknownAsset(_))
        ));
        assert!(matches!(alloc.sell_fraction("DOGE"), Err(RotatorError::UnknownAsset(_))));
    }

    // =========================================================================
    // allocation_snapshot
    // =========================================================================

    #[test]
    fn test_snapshot_covers_every_asset() {
        let alloc = test_allocator();
        let committed = HashMap::from([("btc".to_string(), dec!(100)), ("ETH".to_string(), dec!(30))]);

        let snapshot = alloc.allocation_snapshot(dec!(50), &committed);

        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot["BTC"].allocatable_usd, Decimal::ZERO);
        assert_eq!(snapshot["BTC"].remaining_usd, Decimal::ZERO);
        assert_eq!(snapshot["ETH"].remaining_usd, dec!(70));
        assert_eq!(snapshot["ETH"].allocatable_usd, dec!(50));
        assert_eq!(snapshot["SOL"].committed_usd, Decimal::ZERO);
    }
}
