//! Optimistic-apply-then-confirm protocol against the authoritative store.
//!
//! The reducer mutates local state first and hands back a `PendingConfirm`.
//! The venue sends its `StoreAction` once the transition has completed and
//! feeds the reply back through `apply_confirm`. Store pushes are merged
//! with `apply_push`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::coordinator::VenueState;
use crate::error::TradeError;
use crate::history::MarketSnapshot;
use crate::lmsr_core::OutcomeId;
use crate::market::{Market, Position};

/// RPC sent to the authoritative compute boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum StoreAction {
    #[serde(rename_all = "camelCase")]
    PlaceBet {
        market_id: String,
        outcome_id: OutcomeId,
        amount: f64,
        user_id: Option<String>,
        /// Local id so both sides agree on the position identity.
        position_id: String,
        fee_rate: f64,
    },
    #[serde(rename_all = "camelCase")]
    ClosePosition {
        position_id: String,
        market_id: String,
        outcome_id: OutcomeId,
        fee_rate: f64,
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SimulationTick {
        market_id: String,
        outcome_id: OutcomeId,
        amount: f64,
        #[serde(default)]
        is_sell: bool,
    },
}

impl StoreAction {
    pub fn name(&self) -> &'static str {
        match self {
            StoreAction::PlaceBet { .. } => "place_bet",
            StoreAction::ClosePosition { .. } => "close_position",
            StoreAction::SimulationTick { .. } => "simulation_tick",
        }
    }

    pub fn market_id(&self) -> &str {
        match self {
            StoreAction::PlaceBet { market_id, .. }
            | StoreAction::ClosePosition { market_id, .. }
            | StoreAction::SimulationTick { market_id, .. } => market_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReply {
    pub balance: Option<f64>,
    pub payout: Option<f64>,
    pub bot_user_id: Option<String>,
}

/// Everything needed to hydrate local state.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub markets: Vec<Market>,
    pub positions: Vec<Position>,
    pub balance: Option<f64>,
}

/// Change pushed by the store, independent of any local action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushUpdate {
    OutcomePool {
        market_id: String,
        outcome_id: OutcomeId,
        pool: f64,
        seq: u64,
    },
    MarketLiquidity {
        market_id: String,
        liquidity: f64,
        seq: u64,
    },
    HistoryInsert {
        market_id: String,
        snapshot: MarketSnapshot,
        seq: u64,
    },
    Positions {
        user_id: String,
        positions: Vec<Position>,
    },
    Balance {
        user_id: String,
        balance: f64,
    },
}

/// The authoritative store as seen from the venue.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    /// Apply one confirmed action; `Err` means the write was rejected.
    async fn execute(&self, action: StoreAction) -> anyhow::Result<StoreReply>;

    /// Markets with their latest `history_limit` snapshots, plus the user's positions and balance.
    async fn load(&self, user_id: Option<&str>, history_limit: usize) -> anyhow::Result<StoreSnapshot>;

    /// Push channel of store-side changes.
    fn subscribe(&self) -> broadcast::Receiver<PushUpdate>;
}

/// Verbatim copy of the state a place-bet touched, taken before mutating.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackSnapshot {
    pub positions: Vec<Position>,
    pub markets: Vec<Market>,
    pub balance: f64,
}

impl RollbackSnapshot {
    pub fn capture(state: &VenueState) -> Self {
        Self {
            positions: state.positions.clone(),
            markets: state.markets.clone(),
            balance: state.account.balance,
        }
    }

    fn restore(self, state: &mut VenueState) {
        state.positions = self.positions;
        state.markets = self.markets;
        state.account.balance = self.balance;
    }
}

/// What the reply should do to local state.
#[derive(Debug, Clone, PartialEq)]
pub enum OnConfirm {
    PlaceBet {
        position_id: String,
        amount: f64,
        rollback: RollbackSnapshot,
    },
    ClosePosition {
        net_payout: f64,
    },
    SimulationTick,
}

/// A confirm registered by a transition, not yet sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConfirm {
    pub request: StoreAction,
    pub on_confirm: OnConfirm,
}

/// Result of applying a store reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    BetSynced { position_id: String },
    BetRolledBack { error: TradeError },
    PositionClosed { credited: f64 },
    /// The close was applied locally but the store rejected it; not reverted.
    CloseUnconfirmed { reason: String },
    TickConfirmed,
    TickDropped,
}

pub fn apply_confirm(
    state: &mut VenueState,
    confirm: PendingConfirm,
    result: Result<StoreReply, String>,
) -> ConfirmOutcome {
    let market_id = confirm.request.market_id().to_string();
    match (confirm.on_confirm, result) {
        (
            OnConfirm::PlaceBet {
                position_id,
                amount,
                ..
            },
            Ok(reply),
        ) => {
            if let Some(position) = state.positions.iter_mut().find(|p| p.id == position_id) {
                position.synced = true;
            }
            let settled = reply.balance.unwrap_or(state.account.balance - amount);
            state.account.balance = settled.max(0.0);
            state.last_message = Some("Bet confirmed.".to_string());
            debug!(%market_id, %position_id, balance = state.account.balance, "place_bet confirmed");
            ConfirmOutcome::BetSynced { position_id }
        }
        (OnConfirm::PlaceBet { rollback, .. }, Err(reason)) => {
            warn!(%market_id, %reason, "place_bet rejected by store, rolling back");
            rollback.restore(state);
            let error = TradeError::WriteFailed;
            state.last_message = Some(error.to_string());
            ConfirmOutcome::BetRolledBack { error }
        }
        (OnConfirm::ClosePosition { net_payout }, Ok(reply)) => {
            let credited = reply.payout.unwrap_or(net_payout);
            // the store balance already includes the payout; a balance push may have landed first
            state.account.balance = reply
                .balance
                .unwrap_or(state.account.balance + credited);
            state.last_message = Some("Position closed.".to_string());
            debug!(%market_id, credited, balance = state.account.balance, "close_position confirmed");
            ConfirmOutcome::PositionClosed { credited }
        }
        (OnConfirm::ClosePosition { .. }, Err(reason)) => {
            warn!(%market_id, %reason, "close_position rejected by store; local close kept");
            state.last_message = Some("Closing was not confirmed by the store.".to_string());
            ConfirmOutcome::CloseUnconfirmed { reason }
        }
        (OnConfirm::SimulationTick, Ok(_)) => ConfirmOutcome::TickConfirmed,
        (OnConfirm::SimulationTick, Err(reason)) => {
            debug!(%market_id, %reason, "simulation_tick dropped by store");
            ConfirmOutcome::TickDropped
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Merged,
    /// History entry matching an optimistic local snapshot.
    Duplicate,
    /// Sequence number not newer than one already applied.
    Stale,
    /// Unknown market or another user's data.
    Ignored,
}

/// Accept `seq` for `market_id` if it is newer than the last one applied.
fn advance_seq(state: &mut VenueState, market_id: &str, seq: u64) -> bool {
    let last = state.market_versions.entry(market_id.to_string()).or_insert(0);
    if seq <= *last {
        return false;
    }
    *last = seq;
    true
}

/// Field-level, last-write-wins merge of one store push.
pub fn apply_push(state: &mut VenueState, push: PushUpdate) -> PushOutcome {
    match push {
        PushUpdate::OutcomePool {
            market_id,
            outcome_id,
            pool,
            seq,
        } => {
            if state.market(&market_id).is_none() {
                return PushOutcome::Ignored;
            }
            if !advance_seq(state, &market_id, seq) {
                return PushOutcome::Stale;
            }
            if let Some(market) = state.market_mut(&market_id) {
                market.set_pool(outcome_id, pool);
            }
            PushOutcome::Merged
        }
        PushUpdate::MarketLiquidity {
            market_id,
            liquidity,
            seq,
        } => {
            if state.market(&market_id).is_none() {
                return PushOutcome::Ignored;
            }
            if !advance_seq(state, &market_id, seq) {
                return PushOutcome::Stale;
            }
            if let Some(market) = state.market_mut(&market_id) {
                market.liquidity = liquidity;
            }
            PushOutcome::Merged
        }
        PushUpdate::HistoryInsert {
            market_id,
            snapshot,
            seq,
        } => {
            if state.market(&market_id).is_none() {
                return PushOutcome::Ignored;
            }
            if !advance_seq(state, &market_id, seq) {
                return PushOutcome::Stale;
            }
            match state.market_mut(&market_id) {
                Some(market) => {
                    if market.history.ingest_remote(snapshot) {
                        PushOutcome::Merged
                    } else {
                        PushOutcome::Duplicate
                    }
                }
                None => PushOutcome::Ignored,
            }
        }
        PushUpdate::Positions { user_id, positions } => {
            if state.account.id.as_deref() != Some(user_id.as_str()) {
                return PushOutcome::Ignored;
            }
            let mut merged: Vec<Position> = positions
                .into_iter()
                .map(|p| Position { synced: true, ..p })
                .collect();
            // bets still awaiting their own confirm are not in the store's set yet
            let pending = std::mem::take(&mut state.positions)
                .into_iter()
                .filter(|p| !p.synced && !merged.iter().any(|m| m.id == p.id))
                .collect::<Vec<_>>();
            merged.extend(pending);
            state.positions = merged;
            PushOutcome::Merged
        }
        PushUpdate::Balance { user_id, balance } => {
            if state.account.id.as_deref() != Some(user_id.as_str()) {
                return PushOutcome::Ignored;
            }
            state.account.balance = balance;
            PushOutcome::Merged
        }
    }
}
