// Pricing throughput benchmark: sequential vs rayon over random pool states
use rand::prelude::*;
use rayon::prelude::*;
use std::time::Instant;
use tracing::info;

use crate::lmsr_core::{self, OutcomeId, Pools};

#[derive(Debug, Clone, Copy)]
struct PricingCase {
    pools: Pools,
    outcome: OutcomeId,
    payment: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkResult {
    pub samples: usize,
    pub sequential_ms: u128,
    pub parallel_ms: u128,
    /// Sum of all deltas found; equal for both passes.
    pub checksum: f64,
}

fn generate_cases(samples: usize, seed: u64) -> Vec<PricingCase> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..samples)
        .map(|_| {
            let pools = Pools::new(
                rng.gen_range(500.0..5000.0),
                rng.gen_range(500.0..5000.0),
                rng.gen_range(500.0..5000.0),
            );
            PricingCase {
                pools,
                outcome: OutcomeId::ALL[rng.gen_range(0..3)],
                payment: rng.gen_range(1.0..pools.total() * 0.05),
            }
        })
        .collect()
}

/// Buy quote plus round-trip payout, the work a trade does against the engine.
fn price(case: &PricingCase) -> f64 {
    let b = lmsr_core::liquidity_b_for(&case.pools);
    match lmsr_core::delta_for_payment(&case.pools, b, case.outcome, case.payment) {
        Some(fill) => {
            let after = case.pools.shifted(case.outcome, fill.delta);
            let _ = lmsr_core::sell_payout(&after, b, case.outcome, fill.delta);
            fill.delta
        }
        None => 0.0,
    }
}

fn benchmark_sequential(cases: &[PricingCase]) -> (u128, f64) {
    let start = Instant::now();
    let checksum = cases.iter().map(price).sum::<f64>();
    (start.elapsed().as_millis(), checksum)
}

fn benchmark_parallel(cases: &[PricingCase]) -> (u128, f64) {
    let start = Instant::now();
    let deltas: Vec<f64> = cases.par_iter().map(price).collect();
    // summed in order so both passes agree bit for bit
    let checksum = deltas.iter().sum::<f64>();
    (start.elapsed().as_millis(), checksum)
}

/// Run the benchmark comparing a sequential and a parallel pass
pub fn run_pricing_benchmark(samples: usize) -> BenchmarkResult {
    info!("\n🔥 PRICING THROUGHPUT BENCHMARK 🔥");
    info!("Bisection buys + sell payouts over {} random markets", samples);

    let cases = generate_cases(samples, 42);
    let mut sequential_times = Vec::new();
    let mut parallel_times = Vec::new();
    let mut checksum = 0.0;

    for iteration in 1..=3 {
        info!("--- Iteration {} ---", iteration);
        let (seq_ms, seq_sum) = benchmark_sequential(&cases);
        let (par_ms, par_sum) = benchmark_parallel(&cases);
        info!("🦀 Sequential: {}ms", seq_ms);
        info!("⚡ Rayon:      {}ms", par_ms);
        sequential_times.push(seq_ms);
        parallel_times.push(par_ms);
        checksum = seq_sum;
        debug_assert_eq!(seq_sum.to_bits(), par_sum.to_bits());
    }

    let avg_seq = sequential_times.iter().sum::<u128>() / sequential_times.len() as u128;
    let avg_par = parallel_times.iter().sum::<u128>() / parallel_times.len() as u128;

    info!("{}", "=".repeat(50));
    info!("📊 Sequential average: {}ms", avg_seq);
    info!("📊 Rayon average:      {}ms", avg_par);
    if avg_par > 0 {
        info!("🏆 Speed-up: {:.1}x", avg_seq as f64 / avg_par as f64);
    }
    info!("{}", "=".repeat(50));

    BenchmarkResult {
        samples,
        sequential_ms: avg_seq,
        parallel_ms: avg_par,
        checksum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_agree() {
        let cases = generate_cases(500, 1);
        let (_, seq) = benchmark_sequential(&cases);
        let (_, par) = benchmark_parallel(&cases);
        assert_eq!(seq.to_bits(), par.to_bits());
        assert!(seq > 0.0);
    }

    #[test]
    fn every_case_prices() {
        for case in generate_cases(200, 2) {
            assert!(price(&case) > 0.0, "{case:?}");
        }
    }
}
