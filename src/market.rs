//! Venue data model: markets, outcomes, positions, account and simulation status.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::history::{History, MarketSnapshot};
use crate::lmsr_core::{self, OutcomeId, Pools, Probabilities};

/// Seed used when the store is unreachable and a local fallback is needed.
pub const DEFAULT_SEED: u64 = 123_456;
/// Starting balance for accounts created without a store record.
pub const DEFAULT_BALANCE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: OutcomeId,
    pub label: String,
    pub pool: f64,
}

impl Outcome {
    pub fn new(id: OutcomeId, pool: f64) -> Self {
        Self {
            id,
            label: default_label(id).to_string(),
            pool,
        }
    }
}

pub fn default_label(id: OutcomeId) -> &'static str {
    match id {
        OutcomeId::Home => "Home",
        OutcomeId::Draw => "Draw",
        OutcomeId::Away => "Away",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub liquidity: f64,
    /// Indexed by `OutcomeId::index`.
    pub outcomes: [Outcome; 3],
    pub history: History,
}

impl Market {
    pub fn pools(&self) -> Pools {
        Pools::new(
            self.outcomes[0].pool,
            self.outcomes[1].pool,
            self.outcomes[2].pool,
        )
    }

    pub fn pool(&self, outcome: OutcomeId) -> f64 {
        self.outcomes[outcome.index()].pool
    }

    pub fn set_pool(&mut self, outcome: OutcomeId, pool: f64) {
        self.outcomes[outcome.index()].pool = pool;
    }

    pub fn total_pool(&self) -> f64 {
        self.pools().total()
    }

    /// Liquidity parameter of the cost function for the current pools.
    pub fn b(&self) -> f64 {
        lmsr_core::liquidity_b(self.total_pool())
    }

    pub fn probabilities(&self) -> Probabilities {
        lmsr_core::prices(&self.pools(), self.b())
    }

    /// Append the post-mutation price snapshot.
    pub fn record_snapshot(&mut self, now_ms: i64) -> MarketSnapshot {
        let pools = self.pools();
        self.history.record_pools(&pools, now_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub market_id: String,
    pub outcome_id: OutcomeId,
    pub shares: f64,
    pub avg_price: f64,
    pub amount_spent: f64,
    pub created_at: DateTime<Utc>,
    /// False until the store confirms the opening trade.
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<String>,
    pub balance: f64,
    pub authenticated: bool,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: None,
            balance: 0.0,
            authenticated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationState {
    pub status: SimulationStatus,
    pub interval_ms: u64,
    pub controller_id: Option<String>,
    pub last_tick_at: Option<i64>,
}

impl Default for SimulationState {
    fn default() -> Self {
        Self {
            status: SimulationStatus::Idle,
            interval_ms: 900,
            controller_id: None,
            last_tick_at: None,
        }
    }
}

struct Fixture {
    id: &'static str,
    sport: &'static str,
    league: &'static str,
    home_team: &'static str,
    away_team: &'static str,
    start_offset_hours: i64,
}

const FIXTURES: [Fixture; 3] = [
    Fixture {
        id: "match-1",
        sport: "Football",
        league: "UEFA Champions League",
        home_team: "Bratislava Titans",
        away_team: "Praha Royals",
        start_offset_hours: 4,
    },
    Fixture {
        id: "match-2",
        sport: "Hockey",
        league: "NHL Exhibition",
        home_team: "Toronto Blades",
        away_team: "New York Storm",
        start_offset_hours: 12,
    },
    Fixture {
        id: "match-3",
        sport: "Basketball",
        league: "EuroLeague",
        home_team: "Berlin Rockets",
        away_team: "Madrid Comets",
        start_offset_hours: 28,
    },
];

const BASE_LIQUIDITY: f64 = 3000.0;

/// Seeded fixtures with staggered liquidity and one initial snapshot each.
pub fn seed_markets<R: Rng>(now: DateTime<Utc>, rng: &mut R, history_limit: usize) -> Vec<Market> {
    FIXTURES
        .iter()
        .enumerate()
        .map(|(index, fixture)| {
            let stagger = BASE_LIQUIDITY + index as f64 * 250.0;
            let pools = Pools::new(
                stagger * (0.38 + rng.gen::<f64>() * 0.1),
                stagger * (0.32 + rng.gen::<f64>() * 0.1),
                stagger * (0.30 + rng.gen::<f64>() * 0.1),
            );

            let b = (stagger / 4.0).max(lmsr_core::MIN_LIQUIDITY_B);
            let mut history = History::with_capacity(history_limit);
            history.record(MarketSnapshot {
                timestamp: now.timestamp_millis(),
                probabilities: lmsr_core::prices(&pools, b),
            });

            Market {
                id: fixture.id.to_string(),
                sport: fixture.sport.to_string(),
                league: fixture.league.to_string(),
                home_team: fixture.home_team.to_string(),
                away_team: fixture.away_team.to_string(),
                start_time: now + Duration::hours(fixture.start_offset_hours),
                liquidity: stagger,
                outcomes: OutcomeId::ALL.map(|id| Outcome::new(id, pools.get(id))),
                history,
            }
        })
        .collect()
}

/// `seed_markets` with the default deterministic RNG.
pub fn default_seed_markets(now: DateTime<Utc>, history_limit: usize) -> Vec<Market> {
    let mut rng = StdRng::seed_from_u64(DEFAULT_SEED);
    seed_markets(now, &mut rng, history_limit)
}
