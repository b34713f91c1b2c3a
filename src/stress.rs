//! Stress harness for the venue
//!
//! Many user sessions trade concurrently against one shared `InMemoryStore`
//! while a synthetic-flow engine keeps moving the same markets. Afterwards
//! every session and the store are checked for:
//! 1. **Pricing**: probabilities sum to 1, pools positive and finite
//! 2. **Limits**: position cap, history bound, non-negative balances
//! 3. **Settlement**: confirms drain; positions a rollback leaves unsynced are counted

use anyhow::{bail, Result};
use chrono::Utc;
use rand::prelude::*;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{Config, TradingLimits};
use crate::coordinator::VenueState;
use crate::lmsr_core::OutcomeId;
use crate::market::{default_seed_markets, SimulationStatus, DEFAULT_BALANCE};
use crate::reconcile::AuthoritativeStore;
use crate::simulation::{SimulationEngine, TraderPool};
use crate::store::InMemoryStore;
use crate::venue::{Venue, VenueError, VenueHandle};

// Defaults; override via STRESS_* env vars
const NUM_USERS: usize = 50;
const TRADES_PER_USER: usize = 200;
const SYNTHETIC_TICKS: usize = 500;
const CLOSE_PROBABILITY: f64 = 0.25;
const FAILURE_PROBABILITY: f64 = 0.02;
const MIN_AMOUNT: f64 = 1.0;
const MAX_AMOUNT: f64 = 40.0;

const PROB_SUM_TOLERANCE: f64 = 1e-9;
const DRAIN_ATTEMPTS: usize = 200;

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub num_users: usize,
    pub trades_per_user: usize,
    pub synthetic_ticks: usize,
    pub close_probability: f64,
    pub failure_probability: f64,
    pub min_amount: f64,
    pub max_amount: f64,
}

impl StressConfig {
    pub fn from_env() -> Self {
        let min_amount = env_f64_min("STRESS_MIN_AMOUNT", MIN_AMOUNT, 0.01);
        Self {
            num_users: env_usize("STRESS_NUM_USERS", NUM_USERS),
            trades_per_user: env_usize("STRESS_TRADES_PER_USER", TRADES_PER_USER),
            synthetic_ticks: env_usize("STRESS_SYNTHETIC_TICKS", SYNTHETIC_TICKS),
            close_probability: env_f64_clamped("STRESS_CLOSE_PROBABILITY", CLOSE_PROBABILITY, 0.0, 1.0),
            failure_probability: env_f64_clamped("STRESS_FAILURE_PROBABILITY", FAILURE_PROBABILITY, 0.0, 1.0),
            min_amount,
            max_amount: env_f64_min("STRESS_MAX_AMOUNT", MAX_AMOUNT, min_amount),
        }
    }
}

fn stress_config() -> &'static StressConfig {
    static CONFIG: OnceLock<StressConfig> = OnceLock::new();
    CONFIG.get_or_init(StressConfig::from_env)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_f64_clamped(name: &str, default: f64, min: f64, max: f64) -> f64 {
    env_f64(name, default).clamp(min, max)
}

fn env_f64_min(name: &str, default: f64, min: f64) -> f64 {
    env_f64(name, default).max(min)
}

#[derive(Debug, Default, Clone)]
pub struct StressReport {
    pub placed: u64,
    pub closed: u64,
    pub rejected: HashMap<&'static str, u64>,
    pub synthetic: u64,
    /// Positions a verbatim rollback left unsynced after their own confirm.
    pub unsynced_after_drain: u64,
    pub elapsed: Duration,
    pub violations: Vec<String>,
}

impl StressReport {
    fn merge(&mut self, other: StressReport) {
        self.placed += other.placed;
        self.closed += other.closed;
        self.synthetic += other.synthetic;
        self.unsynced_after_drain += other.unsynced_after_drain;
        for (code, count) in other.rejected {
            *self.rejected.entry(code).or_insert(0) += count;
        }
        self.violations.extend(other.violations);
    }

    fn reject(&mut self, err: &VenueError) {
        let code = match err {
            VenueError::Trade(err) => err.code(),
            VenueError::Closed => "CLOSED",
        };
        *self.rejected.entry(code).or_insert(0) += 1;
    }
}

/// Structural invariants of one session's local state.
pub fn check_state_invariants(label: &str, state: &VenueState, limits: &TradingLimits) -> Vec<String> {
    let mut violations = Vec::new();
    for market in &state.markets {
        let pools = market.pools();
        if !pools.is_finite() || OutcomeId::ALL.iter().any(|o| pools.get(*o) <= 0.0) {
            violations.push(format!("{label}: market {} has invalid pools {:?}", market.id, pools));
        }
        let sum = market.probabilities().total();
        if (sum - 1.0).abs() > PROB_SUM_TOLERANCE {
            violations.push(format!("{label}: market {} probabilities sum to {sum}", market.id));
        }
        if market.history.len() > limits.history_limit {
            violations.push(format!(
                "{label}: market {} history has {} entries",
                market.id,
                market.history.len()
            ));
        }
        if market.liquidity < 0.0 {
            violations.push(format!("{label}: market {} liquidity {}", market.id, market.liquidity));
        }
    }
    if state.positions.len() > limits.max_positions {
        violations.push(format!("{label}: {} open positions", state.positions.len()));
    }
    if state.account.balance < 0.0 {
        violations.push(format!("{label}: negative balance {}", state.account.balance));
    }
    for p in &state.positions {
        if !(p.shares > 0.0) || (p.avg_price - p.amount_spent / p.shares).abs() > 1e-9 {
            violations.push(format!("{label}: inconsistent position {}", p.id));
        }
    }
    violations
}

async fn run_user(
    index: usize,
    venue: VenueHandle,
    store: Arc<InMemoryStore>,
    market_ids: Arc<Vec<String>>,
) -> StressReport {
    let stress = stress_config();
    let user_id = format!("stress-user-{index:04}");
    let mut rng = StdRng::seed_from_u64(index as u64);
    let mut report = StressReport::default();

    for trade_num in 0..stress.trades_per_user {
        if rng.gen_bool(stress.failure_probability) {
            store.fail_next_of("place_bet", 1).await;
        }

        let state = match venue.snapshot().await {
            Ok(state) => state,
            Err(_) => break,
        };
        let synced: Vec<_> = state.positions.iter().filter(|p| p.synced).collect();
        if !synced.is_empty() && rng.gen_bool(stress.close_probability) {
            let position = synced[rng.gen_range(0..synced.len())];
            match venue.close_position(&position.id).await {
                Ok(_) => report.closed += 1,
                Err(err) => report.reject(&err),
            }
        } else {
            let market_id = &market_ids[rng.gen_range(0..market_ids.len())];
            let outcome = OutcomeId::ALL[rng.gen_range(0..OutcomeId::ALL.len())];
            let amount = rng.gen_range(stress.min_amount..=stress.max_amount);
            match venue.place_bet(market_id, outcome, amount, &user_id).await {
                Ok(_) => report.placed += 1,
                Err(err) => report.reject(&err),
            }
        }

        if trade_num % 20 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    report
}

async fn drain(venue: &VenueHandle) -> Option<VenueState> {
    for _ in 0..DRAIN_ATTEMPTS {
        let state = venue.snapshot().await.ok()?;
        if state.positions.iter().all(|p| p.synced) {
            return Some(state);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    venue.snapshot().await.ok()
}

pub async fn run_stress_test(config: &Config) -> Result<StressReport> {
    let stress = stress_config();
    let mut settings = config.market.clone();
    // rate limiting would only measure the clock here
    settings.limits.cooldown_ms = 0;

    let mut rng = StdRng::seed_from_u64(config.simulation.seed.unwrap_or(7));
    let traders = TraderPool::generate(config.simulation.trader_count, &mut rng);
    let now = Utc::now();
    let store = Arc::new(
        InMemoryStore::seeded(now, settings.limits.history_limit, traders.ids())
            .with_position_limit(settings.limits.max_positions),
    );
    let market_ids: Arc<Vec<String>> = Arc::new(
        default_seed_markets(now, settings.limits.history_limit)
            .into_iter()
            .map(|m| m.id)
            .collect(),
    );

    info!("\n🚀 Starting venue stress run...");
    info!(
        "Target: {} user actions ({} users × {} each) + {} synthetic ticks",
        stress.num_users * stress.trades_per_user,
        stress.num_users,
        stress.trades_per_user,
        stress.synthetic_ticks
    );
    let start_time = Instant::now();

    let mut sessions = Vec::with_capacity(stress.num_users);
    for index in 0..stress.num_users {
        let user_id = format!("stress-user-{index:04}");
        store.upsert_user(&user_id, DEFAULT_BALANCE).await;
        let initial = VenueState::new(default_seed_markets(now, settings.limits.history_limit));
        let shared: Arc<dyn AuthoritativeStore> = store.clone();
        let (venue, task) = Venue::spawn(shared, settings.clone(), initial);
        venue.hydrate(Some(user_id)).await?;
        sessions.push((venue, task));
    }

    // One session acts as the simulation controller.
    let controller = sessions[0].0.clone();
    controller.set_simulation(SimulationStatus::Running, None).await?;
    let synthetic = {
        let controller = controller.clone();
        let mut engine = SimulationEngine::new(traders, config.simulation.clone());
        let ticks = stress.synthetic_ticks;
        tokio::spawn(async move {
            let mut report = StressReport::default();
            let mut clock = Utc::now().timestamp_millis();
            for _ in 0..ticks {
                let Ok(state) = controller.snapshot().await else { break };
                clock += state.simulation.interval_ms as i64;
                for tick in engine.plan_tick(&state.markets, clock) {
                    match controller
                        .simulation_tick(&tick.market_id, tick.outcome_id, tick.amount, tick.is_sell)
                        .await
                    {
                        Ok(_) => report.synthetic += 1,
                        Err(err) => report.reject(&err),
                    }
                }
                tokio::task::yield_now().await;
            }
            report
        })
    };

    let mut handles = Vec::with_capacity(sessions.len());
    for (index, (venue, _)) in sessions.iter().enumerate() {
        handles.push(tokio::spawn(run_user(
            index,
            venue.clone(),
            Arc::clone(&store),
            Arc::clone(&market_ids),
        )));
    }

    let mut report = StressReport::default();
    for handle in handles {
        match handle.await {
            Ok(user_report) => report.merge(user_report),
            Err(e) => error!("User task failed: {}", e),
        }
    }
    match synthetic.await {
        Ok(sim_report) => report.merge(sim_report),
        Err(e) => error!("Synthetic flow task failed: {}", e),
    }
    store.clear_failures().await;

    // --- VERIFICATION ---
    info!("\n🔍 Verifying invariants...");
    for (index, (venue, _)) in sessions.iter().enumerate() {
        let label = format!("session {index}");
        match drain(venue).await {
            Some(state) => {
                report
                    .violations
                    .extend(check_state_invariants(&label, &state, &settings.limits));
                report.unsynced_after_drain += state.positions.iter().filter(|p| !p.synced).count() as u64;
            }
            None => report.violations.push(format!("{label}: venue stopped")),
        }
        if let Some(user_id) = venue.snapshot().await.ok().and_then(|s| s.account.id) {
            if store.balance(&user_id).await.unwrap_or(0.0) < 0.0 {
                report.violations.push(format!("store: {user_id} has a negative balance"));
            }
        }
    }
    for (_, task) in &sessions {
        task.abort();
    }

    report.elapsed = start_time.elapsed();
    let total = report.placed + report.closed + report.synthetic + report.rejected.values().sum::<u64>();
    let tps = total as f64 / report.elapsed.as_secs_f64().max(f64::EPSILON);

    info!("\n📊 Stress Test Summary:");
    info!("   - Bets placed: {}", report.placed);
    info!("   - Positions closed: {}", report.closed);
    info!("   - Synthetic ticks: {}", report.synthetic);
    info!("   - Unsynced after drain: {}", report.unsynced_after_drain);
    for (code, count) in &report.rejected {
        info!("   - Rejected {}: {}", code, count);
    }
    info!("   - Duration: {:.2?}", report.elapsed);
    info!("   - Throughput: {:.2} actions/second", tps);
    info!("   - Store trades recorded: {}", store.trades().await.len());

    if !report.violations.is_empty() {
        for violation in &report.violations {
            warn!("   ✗ {}", violation);
        }
        bail!("{} invariant violations", report.violations.len());
    }
    info!("✅ Invariants maintained.");
    Ok(report)
}
