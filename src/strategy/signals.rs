//! Pure swing state machine step.
//!
//! `track_extremes` updates the swing anchors, then `evaluate` says what the
//! current price calls for. Neither touches the exchange; the worker acts on the
//! returned signal.

use rust_decimal::Decimal;
use std::fmt;

use crate::config::StrategyConfig;
use crate::persistence::{AssetTradingState, Mode};
use crate::utils::decimal::pct_change;

/// Percent thresholds of the swing cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub buy_pullback_pct: Decimal,
    pub buy_approach_pct: Decimal,
    pub sell_target_pct: Decimal,
    pub sell_approach_pct: Decimal,
    pub drawdown_reset_pct: Decimal,
}

impl From<&StrategyConfig> for Thresholds {
    fn from(config: &StrategyConfig) -> Self {
        Self {
            buy_pullback_pct: config.buy_pullback_pct,
            buy_approach_pct: config.buy_approach_pct,
            sell_target_pct: config.sell_target_pct,
            sell_approach_pct: config.sell_approach_pct,
            drawdown_reset_pct: config.drawdown_reset_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Target,
    DrawdownReset,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Target => "target",
            ExitReason::DrawdownReset => "drawdown_reset",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    None,
    /// Idle and close to the buy trigger; advisory only
    BuyApproach { pullback_pct: Decimal },
    Buy { pullback_pct: Decimal },
    /// Holding and close to target; advisory only
    SellApproach { gain_pct: Decimal },
    Sell { reason: ExitReason, gain_pct: Decimal },
    /// Reset and pulled back far enough to watch for buys again
    Rearm { pullback_pct: Decimal },
}

/// Update the swing anchors for this tick's price.
///
/// A new high clears the buy-approach flag. The swing low only walks while
/// holding and is informational; gains are measured from `entry_price`.
pub fn track_extremes(state: &mut AssetTradingState, price: Decimal) {
    match state.swing_high {
        Some(high) if price <= high => {}
        _ => {
            state.swing_high = Some(price);
            state.buy_approach_sent = false;
        }
    }

    if state.mode == Mode::Hold {
        match state.swing_low {
            Some(low) if price >= low => {}
            _ => state.swing_low = Some(price),
        }
    }
}

/// Pullback from the swing high, in percent (negative below the high).
pub fn pullback_pct(state: &AssetTradingState, price: Decimal) -> Decimal {
    state
        .swing_high
        .map(|high| pct_change(high, price))
        .unwrap_or(Decimal::ZERO)
}

/// Gain from entry while holding, in percent.
pub fn gain_pct(state: &AssetTradingState, price: Decimal) -> Option<Decimal> {
    state.entry_price.map(|entry| pct_change(entry, price))
}

/// What the price calls for in the current mode.
///
/// While holding, the drawdown exit takes precedence over the target.
pub fn evaluate(state: &AssetTradingState, price: Decimal, th: &Thresholds) -> Signal {
    match state.mode {
        Mode::Idle => {
            let pullback_pct = pullback_pct(state, price);
            if pullback_pct <= th.buy_pullback_pct {
                Signal::Buy { pullback_pct }
            } else if pullback_pct <= th.buy_approach_pct && !state.buy_approach_sent {
                Signal::BuyApproach { pullback_pct }
            } else {
                Signal::None
            }
        }
        Mode::Hold => {
            let Some(gain_pct) = gain_pct(state, price) else {
                return Signal::None;
            };
            if gain_pct <= th.drawdown_reset_pct {
                Signal::Sell {
                    reason: ExitReason::DrawdownReset,
                    gain_pct,
                }
            } else if gain_pct >= th.sell_target_pct {
                Signal::Sell {
                    reason: ExitReason::Target,
                    gain_pct,
                }
            } else if gain_pct >= th.sell_approach_pct && !state.sell_approach_sent {
                Signal::SellApproach { gain_pct }
            } else {
                Signal::None
            }
        }
        Mode::Reset => {
            let pullback_pct = pullback_pct(state, price);
            if pullback_pct <= th.buy_pullback_pct {
                Signal::Rearm { pullback_pct }
            } else {
                Signal::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn thresholds() -> Thresholds {
        Thresholds::from(&StrategyConfig::default())
    }

    fn idle_below(high: Decimal) -> AssetTradingState {
        AssetTradingState {
            swing_high: Some(high),
            ..Default::default()
        }
    }

    fn holding(entry: Decimal) -> AssetTradingState {
        AssetTradingState {
            mode: Mode::Hold,
            entry_price: Some(entry),
            swing_high: Some(entry),
            swing_low: Some(entry),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_price_seeds_swing_high() {
        let mut state = AssetTradingState::default();
        track_extremes(&mut state, dec!(42));
        assert_eq!(state.swing_high, Some(dec!(42)));
        assert_eq!(state.swing_low, None);
    }

    #[test]
    fn test_new_high_clears_buy_approach() {
        let mut state = idle_below(dec!(100));
        state.buy_approach_sent = true;

        track_extremes(&mut state, dec!(99));
        assert!(state.buy_approach_sent);

        track_extremes(&mut state, dec!(101));
        assert_eq!(state.swing_high, Some(dec!(101)));
        assert!(!state.buy_approach_sent);
    }

    #[test]
    fn test_swing_low_walks_only_in_hold() {
        let mut state = holding(dec!(100));
        track_extremes(&mut state, dec!(95));
        track_extremes(&mut state, dec!(97));
        assert_eq!(state.swing_low, Some(dec!(95)));

        let mut idle = idle_below(dec!(100));
        track_extremes(&mut idle, dec!(80));
        assert_eq!(idle.swing_low, None);
    }

    #[test]
    fn test_buy_at_pullback() {
        let signal = evaluate(&idle_below(dec!(100)), dec!(96.9), &thresholds());
        assert_eq!(signal, Signal::Buy { pullback_pct: dec!(-3.1) });

        // Exactly on the threshold triggers
        let signal = evaluate(&idle_below(dec!(100)), dec!(97), &thresholds());
        assert!(matches!(signal, Signal::Buy { .. }));
    }

    #[test]
    fn test_buy_approach_once_per_leg() {
        let mut state = idle_below(dec!(100));
        assert!(matches!(
            evaluate(&state, dec!(97.4), &thresholds()),
            Signal::BuyApproach { .. }
        ));

        state.buy_approach_sent = true;
        assert_eq!(evaluate(&state, dec!(97.4), &thresholds()), Signal::None);
    }

    #[test]
    fn test_hold_exits() {
        let th = thresholds();
        assert_eq!(
            evaluate(&holding(dec!(100)), dec!(87), &th),
            Signal::Sell {
                reason: ExitReason::DrawdownReset,
                gain_pct: dec!(-13)
            }
        );
        assert_eq!(
            evaluate(&holding(dec!(100)), dec!(105), &th),
            Signal::Sell {
                reason: ExitReason::Target,
                gain_pct: dec!(5)
            }
        );
        assert_eq!(evaluate(&holding(dec!(100)), dec!(95), &th), Signal::None);
    }

    #[test]
    fn test_sell_approach_between_threshold_and_target() {
        let th = thresholds();
        let mut state = holding(dec!(100));

        assert_eq!(
            evaluate(&state, dec!(104.2), &th),
            Signal::SellApproach { gain_pct: dec!(4.2) }
        );

        state.sell_approach_sent = true;
        assert_eq!(evaluate(&state, dec!(104.2), &th), Signal::None);
    }

    #[test]
    fn test_gain_measured_from_entry_not_swing_low() {
        let mut state = holding(dec!(100));
        state.swing_low = Some(dec!(90));
        // +5% over the swing low, but only -5.5% vs entry
        assert_eq!(evaluate(&state, dec!(94.5), &thresholds()), Signal::None);
    }

    #[test]
    fn test_reset_rearms_on_pullback() {
        let state = AssetTradingState {
            mode: Mode::Reset,
            swing_high: Some(dec!(100)),
            ..Default::default()
        };
        assert_eq!(
            evaluate(&state, dec!(96.9), &thresholds()),
            Signal::Rearm { pullback_pct: dec!(-3.1) }
        );
        assert_eq!(evaluate(&state, dec!(99), &thresholds()), Signal::None);
    }
}
