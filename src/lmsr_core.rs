//! src/lmsr_core.rs
//! Numerically stable three-outcome LMSR core with f64 math.
//!
//! Pure functions only: no state, no I/O. Both the local trade reducer and the
//! authoritative store evaluate prices through this module so the two sides can
//! never drift apart on formula or evaluation order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lower bound for the liquidity parameter.
pub const MIN_LIQUIDITY_B: f64 = 300.0;
/// Pool total assumed when a market has no pool state yet.
pub const DEFAULT_TOTAL_POOL: f64 = 800.0;

const BISECTION_ITERATIONS: usize = 60;
const BISECTION_TOLERANCE: f64 = 1e-6;
const BISECTION_SLACK: f64 = 5.0;
const BISECTION_MIN_HI: f64 = 0.0001;

/// Market outcome for a three-way event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeId {
    Home,
    Draw,
    Away,
}

impl OutcomeId {
    /// Fixed iteration order; also the index order of the `q` vector.
    pub const ALL: [OutcomeId; 3] = [OutcomeId::Home, OutcomeId::Draw, OutcomeId::Away];

    /// Parse from string (API boundary conversion)
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "home" => Ok(OutcomeId::Home),
            "draw" => Ok(OutcomeId::Draw),
            "away" => Ok(OutcomeId::Away),
            _ => Err(format!(
                "Invalid outcome: '{}', expected 'home', 'draw' or 'away'",
                s
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeId::Home => "home",
            OutcomeId::Draw => "draw",
            OutcomeId::Away => "away",
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        match self {
            OutcomeId::Home => 0,
            OutcomeId::Draw => 1,
            OutcomeId::Away => 2,
        }
    }
}

impl fmt::Display for OutcomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome vector. Used both for pool state and for probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pools {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

/// Probabilities share the pool vector layout.
pub type Probabilities = Pools;

impl Pools {
    pub fn new(home: f64, draw: f64, away: f64) -> Self {
        Self { home, draw, away }
    }

    pub fn from_q(q: [f64; 3]) -> Self {
        Self::new(q[0], q[1], q[2])
    }

    #[inline]
    pub fn q(&self) -> [f64; 3] {
        [self.home, self.draw, self.away]
    }

    #[inline]
    pub fn get(&self, outcome: OutcomeId) -> f64 {
        self.q()[outcome.index()]
    }

    pub fn set(&mut self, outcome: OutcomeId, value: f64) {
        match outcome {
            OutcomeId::Home => self.home = value,
            OutcomeId::Draw => self.draw = value,
            OutcomeId::Away => self.away = value,
        }
    }

    /// Copy with `delta` added to one outcome.
    pub fn shifted(&self, outcome: OutcomeId, delta: f64) -> Self {
        let mut next = *self;
        next.set(outcome, self.get(outcome) + delta);
        next
    }

    pub fn total(&self) -> f64 {
        self.home + self.draw + self.away
    }

    pub fn is_finite(&self) -> bool {
        self.q().iter().all(|x| x.is_finite())
    }

    /// Outcome with the largest entry (ties resolve in `ALL` order).
    pub fn argmax(&self) -> OutcomeId {
        OutcomeId::ALL
            .into_iter()
            .fold(OutcomeId::Home, |best, o| if self.get(o) > self.get(best) { o } else { best })
    }
}

/// Result of inverting the cost function for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub delta: f64,
    pub avg_price: f64,
}

// -----------------------
// Numerically stable math
// -----------------------

/// Liquidity parameter derived from the pool total.
#[inline]
pub fn liquidity_b(total_pool: f64) -> f64 {
    let total = if total_pool == 0.0 { DEFAULT_TOTAL_POOL } else { total_pool };
    (total / 4.0).max(MIN_LIQUIDITY_B)
}

#[inline]
pub fn liquidity_b_for(pools: &Pools) -> f64 {
    liquidity_b(pools.total())
}

#[inline]
pub fn log_sum_exp(a: &[f64; 3]) -> f64 {
    let m = a.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    m + a.iter().map(|v| (v - m).exp()).sum::<f64>().ln()
}

/// `C(q) = b * ln(sum_i exp(q_i / b))`, evaluated with max subtraction.
#[inline]
pub fn cost(q: [f64; 3], b: f64) -> f64 {
    debug_assert!(b > 0.0 && b.is_finite(), "b invalid");
    let a = [q[0] / b, q[1] / b, q[2] / b];
    b * log_sum_exp(&a)
}

/// Softmax spot prices; always sum to one.
pub fn prices(pools: &Pools, b: f64) -> Probabilities {
    let a = pools.q().map(|x| x / b);
    let m = a.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let e = a.map(|v| (v - m).exp());
    let sum: f64 = e.iter().sum();
    Pools::new(e[0] / sum, e[1] / sum, e[2] / sum)
}

/// Cost of moving `outcome` by `delta` shares (negative delta sells).
pub fn payment_for_delta(pools: &Pools, b: f64, outcome: OutcomeId, delta: f64) -> f64 {
    let before = cost(pools.q(), b);
    let after = cost(pools.shifted(outcome, delta).q(), b);
    after - before
}

/// Shares purchasable for `payment`, found by bisection over `[0, payment * 5]`.
///
/// Returns `None` for non-positive or non-finite payments and whenever the
/// search ends on a non-positive delta or a non-finite cost.
pub fn delta_for_payment(pools: &Pools, b: f64, outcome: OutcomeId, payment: f64) -> Option<Fill> {
    if !(payment > 0.0) || !payment.is_finite() {
        return None;
    }

    let mut lo = 0.0_f64;
    let mut hi = (payment * BISECTION_SLACK).max(BISECTION_MIN_HI);
    for _ in 0..BISECTION_ITERATIONS {
        let mid = (lo + hi) / 2.0;
        let c = payment_for_delta(pools, b, outcome, mid);
        if (c - payment).abs() < BISECTION_TOLERANCE {
            lo = mid;
            hi = mid;
            break;
        }
        if c > payment {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    let delta = (lo + hi) / 2.0;
    let final_cost = payment_for_delta(pools, b, outcome, delta);
    if delta <= 0.0 || !final_cost.is_finite() {
        return None;
    }
    Some(Fill {
        delta,
        avg_price: final_cost / delta,
    })
}

/// Cash returned for selling `delta` shares of `outcome`.
pub fn sell_payout(pools: &Pools, b: f64, outcome: OutcomeId, delta: f64) -> f64 {
    -payment_for_delta(pools, b, outcome, -delta)
}

// -----------------------
// Tests
// -----------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_pools() -> Pools {
        Pools::new(1000.0, 900.0, 800.0)
    }

    #[test]
    fn b_follows_pool_total_with_floor() {
        assert_eq!(liquidity_b(2700.0), 675.0);
        assert_eq!(liquidity_b(400.0), MIN_LIQUIDITY_B);
        assert_eq!(liquidity_b(0.0), MIN_LIQUIDITY_B);
        assert_eq!(liquidity_b(8000.0), 2000.0);
    }

    #[test]
    fn reference_price_of_home() {
        let pools = reference_pools();
        let b = liquidity_b_for(&pools);
        let p = prices(&pools, b);
        assert!((p.home - 0.383_749).abs() < 1e-5, "p_home={}", p.home);
        assert!(p.home > p.draw && p.draw > p.away);
        assert!((p.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn reference_bisection_for_hundred_unit_buy() {
        let pools = reference_pools();
        let fill = delta_for_payment(&pools, 675.0, OutcomeId::Home, 100.0).unwrap();
        assert!((fill.delta - 234.845_358_878).abs() < 1e-3, "delta={}", fill.delta);
        let paid = payment_for_delta(&pools, 675.0, OutcomeId::Home, fill.delta);
        assert!((paid - 100.0).abs() < 1e-6);
        assert!((fill.avg_price - 0.425_812).abs() < 1e-5);
    }

    #[test]
    fn cost_is_stable_for_large_pools() {
        let q = [1.0e6, 1.0e6 - 10.0, 5.0e5];
        let c = cost(q, 300.0);
        assert!(c.is_finite());
        assert!(c >= 1.0e6);
        let p = prices(&Pools::from_q(q), 300.0);
        assert!(p.is_finite());
        assert!((p.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_payments_have_no_fill() {
        let pools = reference_pools();
        assert!(delta_for_payment(&pools, 675.0, OutcomeId::Draw, 0.0).is_none());
        assert!(delta_for_payment(&pools, 675.0, OutcomeId::Draw, -5.0).is_none());
        assert!(delta_for_payment(&pools, 675.0, OutcomeId::Draw, f64::NAN).is_none());
        assert!(delta_for_payment(&pools, 675.0, OutcomeId::Draw, f64::INFINITY).is_none());
    }

    #[test]
    fn payment_is_monotonic_in_delta() {
        let pools = reference_pools();
        let mut prev = f64::NEG_INFINITY;
        for step in 0..50 {
            let p = payment_for_delta(&pools, 675.0, OutcomeId::Away, step as f64 * 10.0);
            assert!(p > prev);
            prev = p;
        }
    }

    #[test]
    fn sell_payout_mirrors_buy_cost() {
        let pools = reference_pools();
        let fill = delta_for_payment(&pools, 675.0, OutcomeId::Home, 100.0).unwrap();
        let after = pools.shifted(OutcomeId::Home, fill.delta);
        let payout = sell_payout(&after, 675.0, OutcomeId::Home, fill.delta);
        let paid = payment_for_delta(&pools, 675.0, OutcomeId::Home, fill.delta);
        // the fill is only within the bisection tolerance of the payment
        assert!(payout <= paid + 1e-9, "payout {payout} > paid {paid}");
        assert!((payout - 100.0).abs() < BISECTION_TOLERANCE);
    }

    #[test]
    fn recomputed_b_makes_round_trip_lossy() {
        let pools = reference_pools();
        let b = liquidity_b_for(&pools);
        let fill = delta_for_payment(&pools, b, OutcomeId::Home, 100.0).unwrap();
        let after = pools.shifted(OutcomeId::Home, fill.delta);
        let payout = sell_payout(&after, liquidity_b_for(&after), OutcomeId::Home, fill.delta);
        assert!(payout < 100.0, "payout={}", payout);
    }

    #[test]
    fn outcome_parsing_round_trips() {
        for o in OutcomeId::ALL {
            assert_eq!(OutcomeId::from_str(o.as_str()).unwrap(), o);
        }
        assert_eq!(OutcomeId::from_str("HOME").unwrap(), OutcomeId::Home);
        assert!(OutcomeId::from_str("over").is_err());
    }

    #[test]
    fn argmax_picks_largest_pool() {
        assert_eq!(reference_pools().argmax(), OutcomeId::Home);
        assert_eq!(Pools::new(1.0, 3.0, 2.0).argmax(), OutcomeId::Draw);
    }
}
