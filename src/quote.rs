//! Trade-level pricing policy layered on `lmsr_core`.
//!
//! Caps, fees, the display price floor and the damped synthetic-flow model.
//! Used by the local reducer and by the authoritative store so both sides
//! quote a trade with the same arithmetic.

use serde::{Deserialize, Serialize};

use crate::error::TradeError;
use crate::lmsr_core::{self, Fill, OutcomeId, Pools};
use crate::market::Market;

/// Largest single bet as a fraction of pool total and of liquidity.
pub const MAX_BET_FRACTION: f64 = 0.1;
/// Probabilities are floored here before being divided into.
pub const PRICE_FLOOR: f64 = 0.05;

/// Synthetic sells invert only this share of the amount...
pub const SIM_SELL_PAYMENT_SCALE: f64 = 0.5;
/// ...and apply only this share of the resulting delta.
pub const SIM_SELL_DELTA_SCALE: f64 = 0.3;
pub const SIM_SELL_LIQUIDITY_SCALE: f64 = 0.4;
pub const SIM_BUY_LIQUIDITY_SCALE: f64 = 0.3;
/// Synthetic flow never drains an outcome pool below this.
pub const SIM_POOL_FLOOR: f64 = 100.0;

/// `min(10% of pools, 10% of liquidity)`, never negative.
pub fn max_bet(total_pool: f64, liquidity: f64) -> f64 {
    (total_pool * MAX_BET_FRACTION)
        .min(liquidity * MAX_BET_FRACTION)
        .max(0.0)
}

pub fn market_max_bet(market: &Market) -> f64 {
    max_bet(market.total_pool(), market.liquidity)
}

/// Clamp a requested amount into `[0, max_bet]`.
pub fn clamp_bet_to_limits(amount: f64, market: &Market) -> f64 {
    amount.min(market_max_bet(market)).max(0.0)
}

/// Probability as a tradable price: floored at 0.05, rounded to 4 places.
pub fn price_from_probability(probability: f64) -> f64 {
    let clamped = probability.max(PRICE_FLOOR);
    (clamped * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyQuote {
    pub amount: f64,
    pub fee: f64,
    pub tradable: f64,
    pub delta: f64,
    pub avg_price: f64,
}

/// Fee split and share count for spending `amount` on `outcome`.
pub fn quote_buy(pools: &Pools, outcome: OutcomeId, amount: f64, fee_rate: f64) -> Result<BuyQuote, TradeError> {
    let fee = amount * fee_rate;
    let tradable = amount - fee;
    if !(tradable > 0.0) {
        return Err(TradeError::FeeTooLarge);
    }
    let b = lmsr_core::liquidity_b_for(pools);
    let Fill { delta, avg_price } =
        lmsr_core::delta_for_payment(pools, b, outcome, tradable).ok_or(TradeError::PricingFailed)?;
    Ok(BuyQuote {
        amount,
        fee,
        tradable,
        delta,
        avg_price,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseQuote {
    pub raw_payout: f64,
    pub fee: f64,
    pub net: f64,
    /// Pool of the sold outcome after the close.
    pub next_pool: f64,
}

pub fn quote_close(pools: &Pools, outcome: OutcomeId, shares: f64, fee_rate: f64) -> CloseQuote {
    let b = lmsr_core::liquidity_b_for(pools);
    let raw_payout = lmsr_core::sell_payout(pools, b, outcome, shares);
    let fee = raw_payout * fee_rate;
    CloseQuote {
        raw_payout,
        fee,
        net: raw_payout - fee,
        next_pool: (pools.get(outcome) - shares).max(0.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedFlow {
    /// Signed change applied to the outcome pool before flooring.
    pub delta: f64,
    pub next_pool: f64,
    pub liquidity_change: f64,
    pub avg_price: f64,
}

/// Damped synthetic order flow.
///
/// Sells invert half the amount and apply 30% of that delta with a 0.4x
/// liquidity drain; buys invert the full amount with a 0.3x liquidity gain.
pub fn simulate_flow(pools: &Pools, outcome: OutcomeId, amount: f64, is_sell: bool) -> Option<SimulatedFlow> {
    let payment = if is_sell {
        amount * SIM_SELL_PAYMENT_SCALE
    } else {
        amount
    };
    let b = lmsr_core::liquidity_b_for(pools);
    let fill = lmsr_core::delta_for_payment(pools, b, outcome, payment.abs())?;

    let delta = if is_sell {
        -fill.delta * SIM_SELL_DELTA_SCALE
    } else {
        fill.delta
    };
    let liquidity_change = if is_sell {
        -amount * SIM_SELL_LIQUIDITY_SCALE
    } else {
        amount * SIM_BUY_LIQUIDITY_SCALE
    };
    Some(SimulatedFlow {
        delta,
        next_pool: (pools.get(outcome) + delta).max(SIM_POOL_FLOOR),
        liquidity_change,
        avg_price: fill.avg_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::default_seed_markets;
    use chrono::Utc;

    fn pools() -> Pools {
        Pools::new(1000.0, 900.0, 800.0)
    }

    #[test]
    fn clamp_never_exceeds_cap_or_goes_negative() {
        let mut market = default_seed_markets(Utc::now(), 40).remove(0);
        let cap = market_max_bet(&market);
        assert!(cap > 0.0);
        assert_eq!(clamp_bet_to_limits(cap * 3.0, &market), cap);
        assert_eq!(clamp_bet_to_limits(-10.0, &market), 0.0);
        assert_eq!(clamp_bet_to_limits(cap / 2.0, &market), cap / 2.0);

        market.liquidity = 100.0;
        assert_eq!(market_max_bet(&market), 10.0);
        market.liquidity = -5.0;
        assert_eq!(market_max_bet(&market), 0.0);
    }

    #[test]
    fn price_floor_applies() {
        assert_eq!(price_from_probability(0.01), 0.05);
        assert_eq!(price_from_probability(0.123456), 0.1235);
    }

    #[test]
    fn buy_quote_splits_fee() {
        let q = quote_buy(&pools(), OutcomeId::Home, 100.0, 0.02).unwrap();
        assert!((q.fee - 2.0).abs() < 1e-12);
        assert!((q.tradable - 98.0).abs() < 1e-12);
        assert!(q.delta > 0.0);
        assert!((q.avg_price * q.delta - 98.0).abs() < 1e-6);
    }

    #[test]
    fn full_fee_is_rejected() {
        assert_eq!(
            quote_buy(&pools(), OutcomeId::Home, 100.0, 1.0),
            Err(TradeError::FeeTooLarge)
        );
    }

    #[test]
    fn close_quote_floors_pool_at_zero() {
        let q = quote_close(&pools(), OutcomeId::Away, 1200.0, 0.0);
        assert_eq!(q.next_pool, 0.0);
        assert_eq!(q.fee, 0.0);
        assert!(q.net > 0.0);
    }

    #[test]
    fn synthetic_sell_is_damped() {
        let buy = simulate_flow(&pools(), OutcomeId::Draw, 40.0, false).unwrap();
        let sell = simulate_flow(&pools(), OutcomeId::Draw, 40.0, true).unwrap();
        assert!(buy.delta > 0.0 && sell.delta < 0.0);
        let half = lmsr_core::delta_for_payment(&pools(), 675.0, OutcomeId::Draw, 20.0).unwrap();
        assert!((sell.delta + half.delta * 0.3).abs() < 1e-12);
        assert!((buy.liquidity_change - 12.0).abs() < 1e-12);
        assert!((sell.liquidity_change + 16.0).abs() < 1e-12);
    }

    #[test]
    fn synthetic_flow_respects_pool_floor() {
        let thin = Pools::new(1000.0, 900.0, 101.0);
        let sell = simulate_flow(&thin, OutcomeId::Away, 40.0, true).unwrap();
        assert_eq!(sell.next_pool, SIM_POOL_FLOOR);
    }
}
