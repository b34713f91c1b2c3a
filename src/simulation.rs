//! Synthetic order flow.
//!
//! `SimulationEngine` is the pure part: given the current markets and a clock
//! it plans `simulation_tick` dispatches, including the shock cascade.
//! `SimulationDriver` runs it on a tokio interval against a `VenueHandle`.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::SimulationSettings;
use crate::lmsr_core::{OutcomeId, Probabilities};
use crate::market::{Market, SimulationStatus};
use crate::quote;
use crate::venue::{VenueError, VenueHandle};

/// Trend strength is multiplied by this every `TREND_DECAY_EVERY` ticks.
pub const TREND_DECAY: f64 = 0.9;
pub const TREND_DECAY_EVERY: u64 = 20;
/// Trends weaker than this are forgotten.
pub const TREND_PRUNE_BELOW: f64 = 0.1;

/// Holdings above this many shares make a sell more likely.
const HEAVY_HOLDING_SHARES: f64 = 3.0;

/// Reaction to a shock: (delay ms, sell on the opposite side, share of shock size).
const SHOCK_CASCADE: [(u64, bool, f64); 4] = [(100, true, 0.6), (200, false, 0.4), (300, true, 0.3), (400, false, 0.2)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingStyle {
    Aggressive,
    Conservative,
    Momentum,
    Contrarian,
}

impl TradingStyle {
    pub const ALL: [TradingStyle; 4] = [
        TradingStyle::Aggressive,
        TradingStyle::Conservative,
        TradingStyle::Momentum,
        TradingStyle::Contrarian,
    ];

    fn sell_probability(&self) -> f64 {
        match self {
            TradingStyle::Conservative => 0.35,
            _ => 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trader {
    pub id: String,
    pub style: TradingStyle,
    /// In `[0, 1]`; scales shock size.
    pub risk_tolerance: f64,
}

/// Fixed population of synthetic traders, built once at start-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraderPool {
    traders: Vec<Trader>,
}

impl TraderPool {
    pub fn new(traders: Vec<Trader>) -> Self {
        let traders = traders
            .into_iter()
            .map(|t| Trader {
                risk_tolerance: t.risk_tolerance.clamp(0.0, 1.0),
                ..t
            })
            .collect();
        Self { traders }
    }

    /// `count` traders cycling through the styles with random risk tolerance.
    pub fn generate<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        let traders = (0..count)
            .map(|i| Trader {
                id: format!("bot-{:02}", i + 1),
                style: TradingStyle::ALL[i % TradingStyle::ALL.len()],
                risk_tolerance: rng.gen_range(0.1..=1.0),
            })
            .collect();
        Self { traders }
    }

    pub fn ids(&self) -> Vec<String> {
        self.traders.iter().map(|t| t.id.clone()).collect()
    }

    pub fn traders(&self) -> &[Trader] {
        &self.traders
    }

    pub fn len(&self) -> usize {
        self.traders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traders.is_empty()
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Trader> {
        if self.traders.is_empty() {
            return None;
        }
        self.traders.get(rng.gen_range(0..self.traders.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    pub outcome: OutcomeId,
    /// In `[0, 1]`.
    pub strength: f64,
}

/// Per-market decaying bias.
#[derive(Debug, Clone, Default)]
pub struct TrendBook {
    trends: HashMap<String, Trend>,
    ticks: u64,
}

impl TrendBook {
    pub fn get(&self, market_id: &str) -> Option<&Trend> {
        self.trends.get(market_id)
    }

    pub fn set(&mut self, market_id: &str, outcome: OutcomeId, strength: f64) {
        self.trends.insert(
            market_id.to_string(),
            Trend {
                outcome,
                strength: strength.clamp(0.0, 1.0),
            },
        );
    }

    /// Advance one scheduler tick; decays and prunes on every 20th.
    pub fn on_tick(&mut self) {
        self.ticks += 1;
        if self.ticks % TREND_DECAY_EVERY != 0 {
            return;
        }
        self.trends.retain(|_, trend| {
            trend.strength *= TREND_DECAY;
            trend.strength >= TREND_PRUNE_BELOW
        });
    }

    pub fn len(&self) -> usize {
        self.trends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trends.is_empty()
    }
}

/// Estimated position of one trader in one market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Holding {
    pub outcome: OutcomeId,
    pub shares: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Buy { outcome: OutcomeId },
    Sell { outcome: OutcomeId },
    Hold,
}

fn random_outcome<R: Rng + ?Sized>(rng: &mut R) -> OutcomeId {
    OutcomeId::ALL[rng.gen_range(0..OutcomeId::ALL.len())]
}

/// The least likely outcome other than `outcome`.
pub fn opposite_outcome(outcome: OutcomeId, probabilities: &Probabilities) -> OutcomeId {
    OutcomeId::ALL
        .into_iter()
        .filter(|o| *o != outcome)
        .min_by(|a, b| probabilities.get(*a).total_cmp(&probabilities.get(*b)))
        .unwrap_or(outcome)
}

/// Ordinary (non-shock) decision for one trader on one market.
pub fn decide<R: Rng + ?Sized>(
    trader: &Trader,
    holding: Option<&Holding>,
    trend: Option<&Trend>,
    probabilities: &Probabilities,
    rng: &mut R,
) -> Decision {
    if let Some(holding) = holding {
        let mut sell_p = trader.style.sell_probability();
        if holding.shares > HEAVY_HOLDING_SHARES {
            sell_p += 0.15;
        }
        if rng.gen::<f64>() < sell_p {
            return Decision::Sell {
                outcome: holding.outcome,
            };
        }
    }

    let roll = rng.gen::<f64>();
    let outcome = match trader.style {
        TradingStyle::Aggressive => (roll < 0.7).then(|| random_outcome(rng)),
        TradingStyle::Conservative => (roll < 0.3).then(|| random_outcome(rng)),
        TradingStyle::Momentum => match trend {
            Some(t) if t.strength > 0.3 => (roll < 0.6).then_some(t.outcome),
            _ => (roll < 0.4).then(|| random_outcome(rng)),
        },
        TradingStyle::Contrarian => match trend {
            Some(t) if t.strength > 0.5 => (roll < 0.5).then(|| opposite_outcome(t.outcome, probabilities)),
            _ => (roll < 0.35).then(|| random_outcome(rng)),
        },
    };
    match outcome {
        Some(outcome) => Decision::Buy { outcome },
        None => Decision::Hold,
    }
}

/// One `simulation_tick` to dispatch `delay_ms` after planning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTick {
    pub delay_ms: u64,
    pub market_id: String,
    pub outcome_id: OutcomeId,
    pub amount: f64,
    pub is_sell: bool,
}

/// Shock buy followed by its reaction cascade.
pub fn plan_shock<R: Rng + ?Sized>(
    trader: &Trader,
    market: &Market,
    settings: &SimulationSettings,
    rng: &mut R,
) -> (Trend, Vec<PlannedTick>) {
    let outcome = random_outcome(rng);
    let percent = rng.gen_range(settings.event_min_percent..=settings.event_max_percent) / 100.0;
    let size = quote::market_max_bet(market) * percent * trader.risk_tolerance;
    let strength = 0.8 + rng.gen::<f64>() * 0.2;
    let opposite = opposite_outcome(outcome, &market.probabilities());

    let mut ticks = Vec::with_capacity(1 + SHOCK_CASCADE.len());
    ticks.push(PlannedTick {
        delay_ms: 0,
        market_id: market.id.clone(),
        outcome_id: outcome,
        amount: size,
        is_sell: false,
    });
    ticks.extend(SHOCK_CASCADE.iter().map(|&(delay_ms, is_sell, share)| PlannedTick {
        delay_ms,
        market_id: market.id.clone(),
        outcome_id: if is_sell { opposite } else { outcome },
        amount: size * share,
        is_sell,
    }));
    (Trend { outcome, strength }, ticks)
}

/// Planning state for the synthetic population.
pub struct SimulationEngine {
    pool: TraderPool,
    settings: SimulationSettings,
    trends: TrendBook,
    holdings: HashMap<(String, String), Holding>,
    last_event_ms: Option<i64>,
    rng: StdRng,
}

impl SimulationEngine {
    pub fn new(pool: TraderPool, settings: SimulationSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            pool,
            settings,
            trends: TrendBook::default(),
            holdings: HashMap::new(),
            last_event_ms: None,
            rng,
        }
    }

    pub fn trends(&self) -> &TrendBook {
        &self.trends
    }

    pub fn holding(&self, trader_id: &str, market_id: &str) -> Option<&Holding> {
        self.holdings.get(&(trader_id.to_string(), market_id.to_string()))
    }

    fn shock_due(&mut self, now_ms: i64) -> bool {
        let last = *self.last_event_ms.get_or_insert(now_ms);
        if now_ms - last >= self.settings.event_interval_ms as i64 {
            self.last_event_ms = Some(now_ms);
            return true;
        }
        false
    }

    /// Plan the dispatches for one scheduler tick.
    pub fn plan_tick(&mut self, markets: &[Market], now_ms: i64) -> Vec<PlannedTick> {
        self.trends.on_tick();
        if markets.is_empty() || self.pool.is_empty() {
            return Vec::new();
        }
        let market = &markets[self.rng.gen_range(0..markets.len())];
        let Some(trader) = self.pool.pick(&mut self.rng).cloned() else {
            return Vec::new();
        };

        if self.shock_due(now_ms) {
            let (trend, ticks) = plan_shock(&trader, market, &self.settings, &mut self.rng);
            info!(
                market_id = %market.id,
                outcome = %trend.outcome,
                amount = ticks[0].amount,
                trader = %trader.id,
                "market shock"
            );
            self.trends.set(&market.id, trend.outcome, trend.strength);
            return ticks;
        }

        let key = (trader.id.clone(), market.id.clone());
        let probabilities = market.probabilities();
        let decision = decide(
            &trader,
            self.holdings.get(&key),
            self.trends.get(&market.id),
            &probabilities,
            &mut self.rng,
        );
        let (outcome, is_sell) = match decision {
            Decision::Buy { outcome } => (outcome, false),
            Decision::Sell { outcome } => (outcome, true),
            Decision::Hold => return Vec::new(),
        };

        let amount = quote::clamp_bet_to_limits(
            self.rng
                .gen_range(self.settings.normal_min_amount..=self.settings.normal_max_amount),
            market,
        );
        if amount <= 0.0 {
            return Vec::new();
        }
        self.track_holding(key, market, outcome, amount, is_sell);

        debug!(market_id = %market.id, outcome = %outcome, amount, is_sell, trader = %trader.id, "synthetic trade");
        vec![PlannedTick {
            delay_ms: 0,
            market_id: market.id.clone(),
            outcome_id: outcome,
            amount,
            is_sell,
        }]
    }

    fn track_holding(&mut self, key: (String, String), market: &Market, outcome: OutcomeId, amount: f64, is_sell: bool) {
        let Some(flow) = quote::simulate_flow(&market.pools(), outcome, amount, is_sell) else {
            return;
        };
        let shares = flow.delta.abs();
        if is_sell {
            if let Some(holding) = self.holdings.get_mut(&key) {
                holding.shares -= shares;
                if holding.shares <= 0.0 {
                    self.holdings.remove(&key);
                }
            }
            return;
        }
        match self.holdings.get_mut(&key) {
            Some(holding) if holding.outcome == outcome => holding.shares += shares,
            _ => {
                self.holdings.insert(key, Holding { outcome, shares });
            }
        }
    }
}

/// Runs a `SimulationEngine` against the venue while the simulation is running.
pub struct SimulationDriver {
    venue: VenueHandle,
    engine: SimulationEngine,
    interval: Duration,
}

impl SimulationDriver {
    pub fn new(venue: VenueHandle, pool: TraderPool, settings: SimulationSettings) -> Self {
        let interval = Duration::from_millis(settings.normal_interval_ms.max(1));
        Self {
            venue,
            engine: SimulationEngine::new(pool, settings),
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "simulation driver started");

        loop {
            ticker.tick().await;
            let state = match self.venue.snapshot().await {
                Ok(state) => state,
                Err(VenueError::Closed) => break,
                Err(err) => {
                    debug!(error = %err, "snapshot failed");
                    continue;
                }
            };
            if state.simulation.status != SimulationStatus::Running {
                continue;
            }
            let now_ms = Utc::now().timestamp_millis();
            for tick in self.engine.plan_tick(&state.markets, now_ms) {
                if tick.delay_ms == 0 {
                    send_tick(&self.venue, &tick).await;
                } else {
                    let venue = self.venue.clone();
                    tokio::spawn(async move {
                        time::sleep(Duration::from_millis(tick.delay_ms)).await;
                        send_tick(&venue, &tick).await;
                    });
                }
            }
        }
        info!("simulation driver stopped");
    }
}

async fn send_tick(venue: &VenueHandle, tick: &PlannedTick) {
    if let Err(err) = venue
        .simulation_tick(&tick.market_id, tick.outcome_id, tick.amount, tick.is_sell)
        .await
    {
        debug!(market_id = %tick.market_id, error = %err, "synthetic trade dropped");
    }
}
