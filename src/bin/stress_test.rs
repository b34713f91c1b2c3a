//! Binary entry point for running stress tests
//! Run with: cargo run --bin stress_test

use anyhow::Result;
use lmsr_venue::benchmark;
use lmsr_venue::config::Config;
use lmsr_venue::stress;
use tracing::info;

const BENCHMARK_SAMPLES: usize = 100_000;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,lmsr_venue=info")
        .init();

    info!("🚀 LMSR Venue Stress Test");
    info!("=========================");

    // Load configuration
    let config = Config::from_env();
    config.print_config();

    let samples = std::env::var("BENCHMARK_SAMPLES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(BENCHMARK_SAMPLES);
    let bench = tokio::task::spawn_blocking(move || benchmark::run_pricing_benchmark(samples)).await?;
    info!(
        samples = bench.samples,
        checksum = bench.checksum,
        "pricing benchmark done"
    );

    info!("Starting stress run...");
    let report = stress::run_stress_test(&config).await?;

    info!(
        placed = report.placed,
        closed = report.closed,
        synthetic = report.synthetic,
        "✅ Stress test completed successfully!"
    );
    Ok(())
}
