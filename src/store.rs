//! In-process authoritative store.
//!
//! Holds the markets/outcomes/positions/history/users/trades tables behind one
//! async lock and executes the three RPC actions with the same `quote` helpers
//! the local reducer uses. Every mutation is broadcast as a `PushUpdate`
//! numbered with a per-market sequence.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::TradingLimits;
use crate::coordinator::TradeSide;
use crate::history::{History, MarketSnapshot};
use crate::lmsr_core::OutcomeId;
use crate::market::{default_seed_markets, Market, Position, DEFAULT_SEED};
use crate::quote;
use crate::reconcile::{AuthoritativeStore, PushUpdate, StoreAction, StoreReply, StoreSnapshot};

const PUSH_CAPACITY: usize = 1024;
/// Snapshots kept per market; `load` only ever hands out the newest `history_limit`.
const STORE_HISTORY_CAP: usize = 1000;

/// Row of the write-only `trades` audit table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub user_id: String,
    pub market_id: String,
    pub outcome_id: OutcomeId,
    pub side: TradeSide,
    pub shares: f64,
    pub price: f64,
    pub amount: f64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PositionRow {
    user_id: String,
    position: Position,
}

#[derive(Debug, Default)]
struct FailurePlan {
    /// Reject the next `remaining` executes, of `only` if set.
    remaining: usize,
    only: Option<&'static str>,
    /// Reject every execute of these action names.
    actions: HashSet<&'static str>,
    /// Reject `load`.
    unavailable: bool,
}

struct Tables {
    markets: Vec<Market>,
    history: HashMap<String, History>,
    positions: Vec<PositionRow>,
    users: HashMap<String, f64>,
    trades: Vec<TradeRecord>,
    seq: HashMap<String, u64>,
    failures: FailurePlan,
    rng: StdRng,
}

impl Tables {
    fn market_mut(&mut self, market_id: &str) -> Result<&mut Market> {
        self.markets
            .iter_mut()
            .find(|m| m.id == market_id)
            .ok_or_else(|| anyhow!("market {} not found", market_id))
    }

    fn next_seq(&mut self, market_id: &str) -> u64 {
        let seq = self.seq.entry(market_id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn user_positions(&self, user_id: &str) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| Position {
                synced: true,
                ..row.position.clone()
            })
            .collect()
    }

    fn open_positions(&self, user_id: &str) -> usize {
        self.positions.iter().filter(|row| row.user_id == user_id).count()
    }

    fn find_position(&self, user_id: &str, market_id: &str, outcome_id: OutcomeId) -> Option<usize> {
        self.positions.iter().position(|row| {
            row.user_id == user_id
                && row.position.market_id == market_id
                && row.position.outcome_id == outcome_id
        })
    }

    /// Merge a buy into the (user, market, outcome) row, creating it if absent.
    fn upsert_position(
        &mut self,
        user_id: &str,
        position_id: String,
        market_id: &str,
        outcome_id: OutcomeId,
        delta: f64,
        amount: f64,
        now: DateTime<Utc>,
    ) {
        match self.find_position(user_id, market_id, outcome_id) {
            Some(index) => {
                let p = &mut self.positions[index].position;
                p.shares += delta;
                p.amount_spent += amount;
                p.avg_price = if p.shares > 0.0 { p.amount_spent / p.shares } else { 0.0 };
            }
            None => self.positions.push(PositionRow {
                user_id: user_id.to_string(),
                position: Position {
                    id: position_id,
                    market_id: market_id.to_string(),
                    outcome_id,
                    shares: delta,
                    avg_price: if delta > 0.0 { amount / delta } else { 0.0 },
                    amount_spent: amount,
                    created_at: now,
                    synced: true,
                },
            }),
        }
    }

    /// Record the post-trade snapshot and collect the market pushes.
    fn market_pushes(&mut self, market_id: &str, outcome_id: OutcomeId, now_ms: i64) -> Result<Vec<PushUpdate>> {
        let market = self.market_mut(market_id)?;
        let pool = market.pool(outcome_id);
        let liquidity = market.liquidity;
        let snapshot = MarketSnapshot::from_pools(&market.pools(), now_ms);
        self.history
            .entry(market_id.to_string())
            .or_insert_with(|| History::with_capacity(STORE_HISTORY_CAP))
            .record(snapshot);

        let mut pushes = Vec::with_capacity(3);
        pushes.push(PushUpdate::OutcomePool {
            market_id: market_id.to_string(),
            outcome_id,
            pool,
            seq: self.next_seq(market_id),
        });
        pushes.push(PushUpdate::MarketLiquidity {
            market_id: market_id.to_string(),
            liquidity,
            seq: self.next_seq(market_id),
        });
        pushes.push(PushUpdate::HistoryInsert {
            market_id: market_id.to_string(),
            snapshot,
            seq: self.next_seq(market_id),
        });
        Ok(pushes)
    }

    fn user_pushes(&self, user_id: &str, balance: f64) -> [PushUpdate; 2] {
        [
            PushUpdate::Balance {
                user_id: user_id.to_string(),
                balance,
            },
            PushUpdate::Positions {
                user_id: user_id.to_string(),
                positions: self.user_positions(user_id),
            },
        ]
    }
}

/// Authoritative store kept in memory, with failure injection for tests.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    pushes: broadcast::Sender<PushUpdate>,
    bot_ids: Vec<String>,
    max_positions: usize,
}

impl InMemoryStore {
    /// Store seeded with `markets`; simulation ticks are attributed to `bot_ids`.
    pub fn new(markets: Vec<Market>, bot_ids: Vec<String>) -> Self {
        let history = markets
            .iter()
            .map(|m| {
                let mut history = History::with_capacity(STORE_HISTORY_CAP);
                for snapshot in m.history.iter() {
                    history.record(*snapshot);
                }
                (m.id.clone(), history)
            })
            .collect();
        let (pushes, _) = broadcast::channel(PUSH_CAPACITY);
        Self {
            tables: Mutex::new(Tables {
                markets,
                history,
                positions: Vec::new(),
                users: HashMap::new(),
                trades: Vec::new(),
                seq: HashMap::new(),
                failures: FailurePlan::default(),
                rng: StdRng::seed_from_u64(DEFAULT_SEED),
            }),
            pushes,
            bot_ids,
            max_positions: TradingLimits::default().max_positions,
        }
    }

    /// Open (market, outcome) rows allowed per user.
    pub fn with_position_limit(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }

    /// Store over the deterministic fixture markets.
    pub fn seeded(now: DateTime<Utc>, history_limit: usize, bot_ids: Vec<String>) -> Self {
        Self::new(default_seed_markets(now, history_limit), bot_ids)
    }

    pub async fn upsert_user(&self, user_id: &str, balance: f64) {
        self.tables.lock().await.users.insert(user_id.to_string(), balance);
    }

    pub async fn balance(&self, user_id: &str) -> Option<f64> {
        self.tables.lock().await.users.get(user_id).copied()
    }

    pub async fn positions(&self, user_id: &str) -> Vec<Position> {
        self.tables.lock().await.user_positions(user_id)
    }

    pub async fn market(&self, market_id: &str) -> Option<Market> {
        let tables = self.tables.lock().await;
        tables.markets.iter().find(|m| m.id == market_id).cloned()
    }

    pub async fn trades(&self) -> Vec<TradeRecord> {
        self.tables.lock().await.trades.clone()
    }

    /// Reject the next `count` executes.
    pub async fn fail_next(&self, count: usize) {
        let mut tables = self.tables.lock().await;
        tables.failures.remaining = count;
        tables.failures.only = None;
    }

    /// Reject the next `count` executes of `action`; other actions pass.
    pub async fn fail_next_of(&self, action: &'static str, count: usize) {
        let mut tables = self.tables.lock().await;
        tables.failures.remaining = count;
        tables.failures.only = Some(action);
    }

    /// Reject every execute of `action` (`"place_bet"`, ...) until cleared.
    pub async fn fail_action(&self, action: &'static str) {
        self.tables.lock().await.failures.actions.insert(action);
    }

    pub async fn clear_failures(&self) {
        self.tables.lock().await.failures = FailurePlan::default();
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.tables.lock().await.failures.unavailable = unavailable;
    }

    fn publish(&self, updates: impl IntoIterator<Item = PushUpdate>) {
        for update in updates {
            // No subscribers is fine.
            let _ = self.pushes.send(update);
        }
    }

    fn place_bet(
        &self,
        tables: &mut Tables,
        user_id: &str,
        position_id: String,
        market_id: &str,
        outcome_id: OutcomeId,
        amount: f64,
        fee_rate: f64,
    ) -> Result<(StoreReply, Vec<PushUpdate>)> {
        let now = Utc::now();
        if !(amount > 0.0) {
            bail!("amount must be positive");
        }
        let balance = *tables
            .users
            .get(user_id)
            .ok_or_else(|| anyhow!("user {} not found", user_id))?;
        if balance < amount {
            bail!("insufficient balance: {:.2} < {:.2}", balance, amount);
        }
        if tables.find_position(user_id, market_id, outcome_id).is_none()
            && tables.open_positions(user_id) >= self.max_positions
        {
            bail!("position limit of {} reached", self.max_positions);
        }

        let market = tables.market_mut(market_id)?;
        let cap = quote::market_max_bet(market);
        if amount > cap {
            bail!("amount {:.2} exceeds cap {:.2}", amount, cap);
        }
        let q = quote::quote_buy(&market.pools(), outcome_id, amount, fee_rate)?;
        market.set_pool(outcome_id, market.pool(outcome_id) + q.delta);
        market.liquidity += q.tradable;

        tables.upsert_position(user_id, position_id, market_id, outcome_id, q.delta, amount, now);
        let new_balance = balance - amount;
        tables.users.insert(user_id.to_string(), new_balance);
        tables.trades.push(TradeRecord {
            user_id: user_id.to_string(),
            market_id: market_id.to_string(),
            outcome_id,
            side: TradeSide::Buy,
            shares: q.delta,
            price: q.avg_price,
            amount,
            executed_at: now,
        });

        let mut pushes = tables.market_pushes(market_id, outcome_id, now.timestamp_millis())?;
        pushes.extend(tables.user_pushes(user_id, new_balance));
        Ok((
            StoreReply {
                balance: Some(new_balance),
                ..Default::default()
            },
            pushes,
        ))
    }

    fn close_position(
        tables: &mut Tables,
        user_id: &str,
        position_id: &str,
        market_id: &str,
        outcome_id: OutcomeId,
        fee_rate: f64,
    ) -> Result<(StoreReply, Vec<PushUpdate>)> {
        let now = Utc::now();
        let index = tables
            .positions
            .iter()
            .position(|row| row.user_id == user_id && row.position.id == position_id)
            .or_else(|| tables.find_position(user_id, market_id, outcome_id))
            .ok_or_else(|| anyhow!("position {} not found", position_id))?;
        let shares = tables.positions[index].position.shares;

        let market = tables.market_mut(market_id)?;
        let q = quote::quote_close(&market.pools(), outcome_id, shares, fee_rate);
        market.set_pool(outcome_id, q.next_pool);
        market.liquidity = (market.liquidity - q.raw_payout).max(0.0);

        tables.positions.remove(index);
        let balance = tables.users.get(user_id).copied().unwrap_or(0.0) + q.net;
        tables.users.insert(user_id.to_string(), balance);
        tables.trades.push(TradeRecord {
            user_id: user_id.to_string(),
            market_id: market_id.to_string(),
            outcome_id,
            side: TradeSide::Sell,
            shares,
            price: if shares > 0.0 { q.raw_payout / shares } else { 0.0 },
            amount: q.net,
            executed_at: now,
        });

        let mut pushes = tables.market_pushes(market_id, outcome_id, now.timestamp_millis())?;
        pushes.extend(tables.user_pushes(user_id, balance));
        Ok((
            StoreReply {
                balance: Some(balance),
                payout: Some(q.net),
                bot_user_id: None,
            },
            pushes,
        ))
    }

    fn simulation_tick(
        &self,
        tables: &mut Tables,
        market_id: &str,
        outcome_id: OutcomeId,
        amount: f64,
        is_sell: bool,
    ) -> Result<(StoreReply, Vec<PushUpdate>)> {
        let now = Utc::now();
        let market = tables.market_mut(market_id)?;
        let flow = quote::simulate_flow(&market.pools(), outcome_id, amount, is_sell)
            .ok_or_else(|| anyhow!("pricing failed for synthetic trade"))?;
        market.set_pool(outcome_id, flow.next_pool);
        market.liquidity = (market.liquidity + flow.liquidity_change).max(0.0);

        let bot_id = if self.bot_ids.is_empty() {
            None
        } else {
            let pick = tables.rng.gen_range(0..self.bot_ids.len());
            Some(self.bot_ids[pick].clone())
        };
        if let Some(bot) = &bot_id {
            if is_sell {
                if let Some(index) = tables.find_position(bot, market_id, outcome_id) {
                    let p = &mut tables.positions[index].position;
                    p.shares += flow.delta;
                    if p.shares <= 0.0 {
                        tables.positions.remove(index);
                    }
                }
            } else {
                tables.upsert_position(
                    bot,
                    uuid::Uuid::new_v4().to_string(),
                    market_id,
                    outcome_id,
                    flow.delta,
                    amount,
                    now,
                );
            }
            tables.trades.push(TradeRecord {
                user_id: bot.clone(),
                market_id: market_id.to_string(),
                outcome_id,
                side: if is_sell { TradeSide::Sell } else { TradeSide::Buy },
                shares: flow.delta.abs(),
                price: flow.avg_price,
                amount,
                executed_at: now,
            });
        }

        let pushes = tables.market_pushes(market_id, outcome_id, now.timestamp_millis())?;
        Ok((
            StoreReply {
                bot_user_id: bot_id,
                ..Default::default()
            },
            pushes,
        ))
    }
}

#[async_trait]
impl AuthoritativeStore for InMemoryStore {
    async fn execute(&self, action: StoreAction) -> Result<StoreReply> {
        let mut tables = self.tables.lock().await;
        let name = action.name();

        let failures = &mut tables.failures;
        let next_fails = failures.remaining > 0 && failures.only.map_or(true, |only| only == name);
        if next_fails || failures.actions.contains(name) {
            if next_fails {
                failures.remaining -= 1;
            }
            warn!(action = name, market_id = action.market_id(), "store write rejected (injected)");
            bail!("{} rejected by store", name);
        }

        let outcome = match action {
            StoreAction::PlaceBet {
                market_id,
                outcome_id,
                amount,
                user_id,
                position_id,
                fee_rate,
            } => {
                let user_id = user_id.ok_or_else(|| anyhow!("unauthorized"))?;
                self.place_bet(&mut tables, &user_id, position_id, &market_id, outcome_id, amount, fee_rate)
            }
            StoreAction::ClosePosition {
                position_id,
                market_id,
                outcome_id,
                fee_rate,
                user_id,
            } => {
                let user_id = user_id.ok_or_else(|| anyhow!("unauthorized"))?;
                Self::close_position(&mut tables, &user_id, &position_id, &market_id, outcome_id, fee_rate)
            }
            StoreAction::SimulationTick {
                market_id,
                outcome_id,
                amount,
                is_sell,
            } => self.simulation_tick(&mut tables, &market_id, outcome_id, amount, is_sell),
        };

        match outcome {
            Ok((reply, pushes)) => {
                drop(tables);
                debug!(action = name, pushes = pushes.len(), "store write applied");
                self.publish(pushes);
                Ok(reply)
            }
            Err(err) => {
                warn!(action = name, error = %err, "store write failed");
                Err(err)
            }
        }
    }

    async fn load(&self, user_id: Option<&str>, history_limit: usize) -> Result<StoreSnapshot> {
        let tables = self.tables.lock().await;
        if tables.failures.unavailable {
            bail!("store unavailable");
        }

        let markets = tables
            .markets
            .iter()
            .map(|m| {
                let mut history = History::with_capacity(history_limit);
                let stored = tables
                    .history
                    .get(&m.id)
                    .map(|h| h.iter().copied().collect())
                    .unwrap_or_default();
                history.replace(stored);
                Market {
                    history,
                    ..m.clone()
                }
            })
            .collect::<Vec<_>>();
        let (positions, balance) = match user_id {
            Some(id) => (tables.user_positions(id), tables.users.get(id).copied()),
            None => (Vec::new(), None),
        };
        info!(markets = markets.len(), positions = positions.len(), "store snapshot loaded");

        Ok(StoreSnapshot {
            markets,
            positions,
            balance,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<PushUpdate> {
        self.pushes.subscribe()
    }
}
