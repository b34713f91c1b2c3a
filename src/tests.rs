#[cfg(test)]
mod pricing_property_tests {
    use crate::history::{History, MarketSnapshot};
    use crate::lmsr_core::{self, OutcomeId, Pools};
    use crate::market::default_seed_markets;
    use crate::quote;
    use chrono::Utc;
    use proptest::prelude::*;

    fn outcome() -> impl Strategy<Value = OutcomeId> {
        prop::sample::select(OutcomeId::ALL.to_vec())
    }

    // Pools kept within a band where every spot price clears 0.2, so the
    // bisection bracket of 5x the payment always contains the answer.
    fn balanced_pools() -> impl Strategy<Value = Pools> {
        (800.0f64..1200.0, 800.0f64..1200.0, 800.0f64..1200.0).prop_map(|(h, d, a)| Pools::new(h, d, a))
    }

    proptest! {
        #[test]
        fn prices_form_a_distribution(
            h in 0.0f64..100_000.0,
            d in 0.0f64..100_000.0,
            a in 0.0f64..100_000.0,
        ) {
            let pools = Pools::new(h, d, a);
            let p = lmsr_core::prices(&pools, lmsr_core::liquidity_b_for(&pools));
            prop_assert!((p.total() - 1.0).abs() < 1e-9, "sum = {}", p.total());
            for o in OutcomeId::ALL {
                prop_assert!(p.get(o) >= 0.0 && p.get(o) <= 1.0);
            }
        }

        #[test]
        fn bisection_inverts_cost(pools in balanced_pools(), o in outcome(), fraction in 0.0005f64..0.5) {
            let payment = (pools.total() * fraction).max(1.0);
            let b = lmsr_core::liquidity_b_for(&pools);
            let fill = lmsr_core::delta_for_payment(&pools, b, o, payment);
            prop_assert!(fill.is_some());
            let fill = fill.unwrap();
            let paid = lmsr_core::payment_for_delta(&pools, b, o, fill.delta);
            prop_assert!((paid - payment).abs() < 1e-6, "paid {} for {}", paid, payment);
            prop_assert!(fill.avg_price > 0.0 && fill.avg_price < 1.0);
        }

        #[test]
        fn buying_raises_own_price(pools in balanced_pools(), o in outcome(), payment in 1.0f64..500.0) {
            let b = lmsr_core::liquidity_b_for(&pools);
            let before = lmsr_core::prices(&pools, b).get(o);
            let fill = lmsr_core::delta_for_payment(&pools, b, o, payment).unwrap();
            let after = lmsr_core::prices(&pools.shifted(o, fill.delta), b).get(o);
            prop_assert!(after > before);
            // average fill sits between the spot prices it moved across
            prop_assert!(fill.avg_price >= before - 1e-9 && fill.avg_price <= after + 1e-9);
        }

        #[test]
        fn round_trip_at_fixed_b_is_zero_cost(pools in balanced_pools(), o in outcome(), payment in 1.0f64..500.0) {
            let b = lmsr_core::liquidity_b_for(&pools);
            let fill = lmsr_core::delta_for_payment(&pools, b, o, payment).unwrap();
            let after = pools.shifted(o, fill.delta);
            let payout = lmsr_core::sell_payout(&after, b, o, fill.delta);
            prop_assert!(payout <= payment + 1e-6, "payout {} > payment {}", payout, payment);
            prop_assert!((payout - payment).abs() < 1e-5);
        }

        #[test]
        fn favourite_round_trip_never_profits(pools in balanced_pools(), payment in 1.0f64..500.0) {
            let o = pools.argmax();
            let bought = quote::quote_buy(&pools, o, payment, 0.0).unwrap();
            let after = pools.shifted(o, bought.delta);
            let close = quote::quote_close(&after, o, bought.delta, 0.0);
            prop_assert!(close.net <= payment + 1e-6, "net {} > payment {}", close.net, payment);
        }

        #[test]
        fn fee_split_is_exact(pools in balanced_pools(), o in outcome(), amount in 1.0f64..200.0, rate in 0.0f64..0.5) {
            let q = quote::quote_buy(&pools, o, amount, rate).unwrap();
            prop_assert!((q.fee + q.tradable - amount).abs() < 1e-9);
            prop_assert!(q.delta > 0.0);
        }

        #[test]
        fn clamped_bets_stay_within_cap(
            amount in -1_000.0f64..10_000.0,
            pool in 0.0f64..5_000.0,
            liquidity in 0.0f64..10_000.0,
        ) {
            let mut market = default_seed_markets(Utc::now(), 1).remove(0);
            for o in OutcomeId::ALL {
                market.set_pool(o, pool);
            }
            market.liquidity = liquidity;
            let cap = quote::market_max_bet(&market);
            let clamped = quote::clamp_bet_to_limits(amount, &market);
            prop_assert!(clamped >= 0.0 && clamped <= cap);
            prop_assert!(cap <= market.total_pool() * 0.1 + 1e-9);
            prop_assert!(cap <= liquidity * 0.1 + 1e-9);
        }

        #[test]
        fn synthetic_flow_respects_pool_floor(
            pools in balanced_pools(),
            o in outcome(),
            amount in 1.0f64..300.0,
            is_sell in any::<bool>(),
        ) {
            let flow = quote::simulate_flow(&pools, o, amount, is_sell).unwrap();
            prop_assert!(flow.next_pool >= quote::SIM_POOL_FLOOR);
            if is_sell {
                prop_assert!(flow.delta < 0.0);
                prop_assert!((flow.liquidity_change + amount * 0.4).abs() < 1e-9);
            } else {
                prop_assert!(flow.delta > 0.0);
                prop_assert!((flow.liquidity_change - amount * 0.3).abs() < 1e-9);
            }
        }

        #[test]
        fn history_keeps_newest_entries(capacity in 1usize..60, count in 0usize..150) {
            let mut history = History::with_capacity(capacity);
            let pools = Pools::new(1000.0, 900.0, 800.0);
            for i in 0..count {
                history.record(MarketSnapshot::from_pools(&pools, i as i64 * 1_000));
            }
            prop_assert_eq!(history.len(), count.min(capacity));
            if count > 0 {
                prop_assert_eq!(history.latest().map(|s| s.timestamp), Some((count as i64 - 1) * 1_000));
                let oldest = history.iter().next().map(|s| s.timestamp).unwrap();
                prop_assert_eq!(oldest, count.saturating_sub(capacity) as i64 * 1_000);
            }
        }
    }

    #[test]
    fn display_price_is_floored_and_rounded() {
        assert_eq!(quote::price_from_probability(0.01), 0.05);
        assert_eq!(quote::price_from_probability(0.383_748_9), 0.3837);
        assert_eq!(quote::price_from_probability(1.0), 1.0);
    }
}
