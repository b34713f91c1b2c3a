//! Trade coordinator: the synchronous reducer behind every venue action.
//!
//! One action is validated and applied to completion before the next one is
//! looked at. Actions that touch the authoritative store return a
//! `PendingConfirm` in their `Transition`; nothing is sent from in here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MarketSettings;
use crate::error::TradeError;
use crate::lmsr_core::OutcomeId;
use crate::market::{Account, Market, Position, SimulationState, SimulationStatus};
use crate::quote;
use crate::reconcile::{
    self, ConfirmOutcome, OnConfirm, PendingConfirm, RollbackSnapshot, StoreAction, StoreReply,
};

/// Local view of the venue for one signed-in session.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueState {
    pub markets: Vec<Market>,
    pub selected_market_id: Option<String>,
    pub positions: Vec<Position>,
    pub account: Account,
    pub simulation: SimulationState,
    /// Last accepted bet per actor, epoch ms.
    pub bet_cooldowns: HashMap<String, i64>,
    pub last_message: Option<String>,
    /// Highest store push sequence applied per market.
    pub market_versions: HashMap<String, u64>,
}

impl VenueState {
    pub fn new(markets: Vec<Market>) -> Self {
        let selected_market_id = markets.first().map(|m| m.id.clone());
        Self {
            markets,
            selected_market_id,
            positions: Vec::new(),
            account: Account::default(),
            simulation: SimulationState::default(),
            bet_cooldowns: HashMap::new(),
            last_message: None,
            market_versions: HashMap::new(),
        }
    }

    pub fn market(&self, market_id: &str) -> Option<&Market> {
        self.markets.iter().find(|m| m.id == market_id)
    }

    pub fn market_mut(&mut self, market_id: &str) -> Option<&mut Market> {
        self.markets.iter_mut().find(|m| m.id == market_id)
    }

    pub fn position(&self, position_id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == position_id)
    }
}

/// Actions understood by the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SelectMarket {
        market_id: String,
    },
    SetMessage {
        message: Option<String>,
    },
    ToggleSimulation {
        status: SimulationStatus,
        controller_id: Option<String>,
    },
    /// Session collaborator handing over the signed-in account.
    SetAccount(Account),
    PlaceBet {
        market_id: String,
        outcome_id: OutcomeId,
        amount: f64,
        actor: String,
    },
    ClosePosition {
        position_id: String,
    },
    SimulationTick {
        market_id: String,
        outcome_id: OutcomeId,
        amount: f64,
        is_sell: bool,
    },
    /// Follow-up carrying the store's answer to an earlier confirm.
    Confirmed {
        confirm: PendingConfirm,
        result: Result<StoreReply, String>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SelectMarket { .. } => "select_market",
            Action::SetMessage { .. } => "set_message",
            Action::ToggleSimulation { .. } => "toggle_simulation",
            Action::SetAccount(_) => "set_account",
            Action::PlaceBet { .. } => "place_bet",
            Action::ClosePosition { .. } => "close_position",
            Action::SimulationTick { .. } => "simulation_tick",
            Action::Confirmed { .. } => "confirmed",
        }
    }
}

/// Explicit inputs for one dispatch: settings snapshot and the clock.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub settings: MarketSettings,
    pub now: DateTime<Utc>,
}

impl DispatchContext {
    pub fn new(settings: MarketSettings, now: DateTime<Utc>) -> Self {
        Self { settings, now }
    }

    pub fn now_ms(&self) -> i64 {
        self.now.timestamp_millis()
    }

    fn fee_rate(&self) -> f64 {
        self.settings.fee.effective_rate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Local execution details of a pricing-affecting action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeReceipt {
    pub market_id: String,
    pub outcome_id: OutcomeId,
    pub side: TradeSide,
    pub shares: f64,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub position_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionReport {
    pub message: Option<String>,
    pub receipt: Option<TradeReceipt>,
    pub confirm_outcome: Option<ConfirmOutcome>,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub report: ActionReport,
    /// At most one confirm per dispatched action.
    pub confirm: Option<PendingConfirm>,
}

impl Transition {
    fn local(message: Option<String>) -> Self {
        Self {
            report: ActionReport {
                message,
                ..Default::default()
            },
            confirm: None,
        }
    }
}

/// Owns `VenueState` and applies actions to it.
#[derive(Debug, Clone)]
pub struct TradeCoordinator {
    state: VenueState,
}

impl TradeCoordinator {
    pub fn new(state: VenueState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &VenueState {
        &self.state
    }

    /// Swap in freshly hydrated state.
    pub fn replace_state(&mut self, state: VenueState) {
        self.state = state;
    }

    pub fn state_mut(&mut self) -> &mut VenueState {
        &mut self.state
    }

    /// Apply one action. On `Err` nothing but `last_message` has changed.
    pub fn dispatch(&mut self, action: Action, ctx: &DispatchContext) -> Result<Transition, TradeError> {
        let name = action.name();
        let result = match action {
            Action::SelectMarket { market_id } => self.select_market(market_id),
            Action::SetMessage { message } => {
                self.state.last_message = message.clone();
                Ok(Transition::local(message))
            }
            Action::ToggleSimulation {
                status,
                controller_id,
            } => Ok(self.toggle_simulation(status, controller_id)),
            Action::SetAccount(account) => {
                self.state.account = account;
                Ok(Transition::local(None))
            }
            Action::PlaceBet {
                market_id,
                outcome_id,
                amount,
                actor,
            } => self.place_bet(&market_id, outcome_id, amount, &actor, ctx),
            Action::ClosePosition { position_id } => self.close_position(&position_id, ctx),
            Action::SimulationTick {
                market_id,
                outcome_id,
                amount,
                is_sell,
            } => self.simulation_tick(&market_id, outcome_id, amount, is_sell, ctx),
            Action::Confirmed { confirm, result } => {
                let outcome = reconcile::apply_confirm(&mut self.state, confirm, result);
                Ok(Transition {
                    report: ActionReport {
                        message: self.state.last_message.clone(),
                        confirm_outcome: Some(outcome),
                        ..Default::default()
                    },
                    confirm: None,
                })
            }
        };

        if let Err(err) = &result {
            debug!(action = name, code = err.code(), "action rejected: {}", err);
            if name != "simulation_tick" {
                self.state.last_message = Some(err.to_string());
            }
        }
        result
    }

    fn select_market(&mut self, market_id: String) -> Result<Transition, TradeError> {
        if self.state.market(&market_id).is_none() {
            return Err(TradeError::MarketNotFound(market_id));
        }
        self.state.selected_market_id = Some(market_id);
        Ok(Transition::local(None))
    }

    fn toggle_simulation(&mut self, status: SimulationStatus, controller_id: Option<String>) -> Transition {
        let controller_id = controller_id.or_else(|| self.state.account.id.clone());
        let sim = &mut self.state.simulation;
        sim.status = status;
        sim.controller_id = controller_id;
        self.state.last_message = None;
        info!(?status, "simulation toggled");
        Transition::local(None)
    }

    fn place_bet(
        &mut self,
        market_id: &str,
        outcome_id: OutcomeId,
        amount: f64,
        actor: &str,
        ctx: &DispatchContext,
    ) -> Result<Transition, TradeError> {
        let limits = &ctx.settings.limits;
        let now_ms = ctx.now_ms();
        let state = &self.state;

        if !state.account.authenticated {
            return Err(TradeError::AuthRequired);
        }
        if !(amount > 0.0) || !amount.is_finite() {
            return Err(TradeError::InvalidAmount);
        }
        if let Some(last) = state.bet_cooldowns.get(actor) {
            let elapsed = now_ms - last;
            if elapsed < limits.cooldown_ms {
                return Err(TradeError::Cooldown {
                    remaining_ms: limits.cooldown_ms - elapsed,
                });
            }
        }
        let market = state
            .market(market_id)
            .ok_or_else(|| TradeError::MarketNotFound(market_id.to_string()))?;
        let cap = quote::market_max_bet(market);
        if amount > cap {
            return Err(TradeError::AmountTooLarge { cap });
        }
        let existing = state
            .positions
            .iter()
            .position(|p| p.market_id == market_id && p.outcome_id == outcome_id);
        if existing.is_none() && state.positions.len() >= limits.max_positions {
            return Err(TradeError::PositionLimit {
                max: limits.max_positions,
            });
        }
        if state.account.balance < amount {
            return Err(TradeError::InsufficientFunds {
                balance: state.account.balance,
                needed: amount,
            });
        }
        let fee_rate = ctx.fee_rate();
        let q = quote::quote_buy(&market.pools(), outcome_id, amount, fee_rate)?;

        // Validation passed; everything below mutates.
        let rollback = RollbackSnapshot::capture(state);

        let market = self
            .state
            .market_mut(market_id)
            .ok_or_else(|| TradeError::MarketNotFound(market_id.to_string()))?;
        market.set_pool(outcome_id, market.pool(outcome_id) + q.delta);
        market.liquidity += q.tradable;
        market.record_snapshot(now_ms);

        let position_id = match existing {
            Some(index) => {
                let position = &mut self.state.positions[index];
                position.shares += q.delta;
                position.amount_spent += amount;
                position.avg_price = position.amount_spent / position.shares;
                position.id.clone()
            }
            None => {
                let position = Position {
                    id: Uuid::new_v4().to_string(),
                    market_id: market_id.to_string(),
                    outcome_id,
                    shares: q.delta,
                    avg_price: q.avg_price,
                    amount_spent: amount,
                    created_at: ctx.now,
                    synced: false,
                };
                let id = position.id.clone();
                self.state.positions.push(position);
                id
            }
        };
        self.state.bet_cooldowns.insert(actor.to_string(), now_ms);

        let fee_note = if ctx.settings.fee.enabled {
            format!(" with {:.1}% fee", ctx.settings.fee.rate * 100.0)
        } else {
            String::new()
        };
        let message = format!(
            "Bet {:.2}{} on {}. Awaiting confirmation...",
            amount, fee_note, outcome_id
        );
        self.state.last_message = Some(message.clone());
        info!(
            %market_id,
            outcome = %outcome_id,
            amount,
            shares = q.delta,
            avg_price = q.avg_price,
            actor,
            "place_bet applied"
        );

        Ok(Transition {
            report: ActionReport {
                message: Some(message),
                receipt: Some(TradeReceipt {
                    market_id: market_id.to_string(),
                    outcome_id,
                    side: TradeSide::Buy,
                    shares: q.delta,
                    price: q.avg_price,
                    amount,
                    fee: q.fee,
                    position_id: Some(position_id.clone()),
                }),
                confirm_outcome: None,
            },
            confirm: Some(PendingConfirm {
                request: StoreAction::PlaceBet {
                    market_id: market_id.to_string(),
                    outcome_id,
                    amount,
                    user_id: self.state.account.id.clone(),
                    position_id: position_id.clone(),
                    fee_rate,
                },
                on_confirm: OnConfirm::PlaceBet {
                    position_id,
                    amount,
                    rollback,
                },
            }),
        })
    }

    fn close_position(&mut self, position_id: &str, ctx: &DispatchContext) -> Result<Transition, TradeError> {
        if !self.state.account.authenticated {
            return Err(TradeError::AuthRequired);
        }
        let index = self
            .state
            .positions
            .iter()
            .position(|p| p.id == position_id)
            .ok_or_else(|| TradeError::PositionNotFound(position_id.to_string()))?;
        let position = &self.state.positions[index];
        if !position.synced {
            return Err(TradeError::NotSynced);
        }
        let market = self
            .state
            .market(&position.market_id)
            .ok_or_else(|| TradeError::MarketNotFound(position.market_id.clone()))?;

        let fee_rate = ctx.fee_rate();
        let q = quote::quote_close(&market.pools(), position.outcome_id, position.shares, fee_rate);

        let position = self.state.positions.remove(index);
        if let Some(market) = self.state.market_mut(&position.market_id) {
            market.set_pool(position.outcome_id, q.next_pool);
            market.record_snapshot(ctx.now_ms());
        }

        let message = "Closing position, awaiting confirmation...".to_string();
        self.state.last_message = Some(message.clone());
        info!(
            market_id = %position.market_id,
            outcome = %position.outcome_id,
            shares = position.shares,
            net = q.net,
            "close_position applied"
        );

        let price = if position.shares > 0.0 {
            q.raw_payout / position.shares
        } else {
            0.0
        };
        Ok(Transition {
            report: ActionReport {
                message: Some(message),
                receipt: Some(TradeReceipt {
                    market_id: position.market_id.clone(),
                    outcome_id: position.outcome_id,
                    side: TradeSide::Sell,
                    shares: position.shares,
                    price,
                    amount: q.net,
                    fee: q.fee,
                    position_id: Some(position.id.clone()),
                }),
                confirm_outcome: None,
            },
            confirm: Some(PendingConfirm {
                request: StoreAction::ClosePosition {
                    position_id: position.id,
                    market_id: position.market_id,
                    outcome_id: position.outcome_id,
                    fee_rate,
                    user_id: self.state.account.id.clone(),
                },
                on_confirm: OnConfirm::ClosePosition { net_payout: q.net },
            }),
        })
    }

    fn simulation_tick(
        &mut self,
        market_id: &str,
        outcome_id: OutcomeId,
        amount: f64,
        is_sell: bool,
        ctx: &DispatchContext,
    ) -> Result<Transition, TradeError> {
        if !(amount > 0.0) || !amount.is_finite() {
            return Err(TradeError::InvalidAmount);
        }
        let now_ms = ctx.now_ms();
        let market = self
            .state
            .market_mut(market_id)
            .ok_or_else(|| TradeError::MarketNotFound(market_id.to_string()))?;
        let flow = quote::simulate_flow(&market.pools(), outcome_id, amount, is_sell)
            .ok_or(TradeError::PricingFailed)?;

        market.set_pool(outcome_id, flow.next_pool);
        market.liquidity = (market.liquidity + flow.liquidity_change).max(0.0);
        market.record_snapshot(now_ms);
        self.state.simulation.last_tick_at = Some(now_ms);

        debug!(%market_id, outcome = %outcome_id, amount, is_sell, delta = flow.delta, "simulation_tick applied");

        Ok(Transition {
            report: ActionReport {
                message: None,
                receipt: Some(TradeReceipt {
                    market_id: market_id.to_string(),
                    outcome_id,
                    side: if is_sell { TradeSide::Sell } else { TradeSide::Buy },
                    shares: flow.delta.abs(),
                    price: flow.avg_price,
                    amount,
                    fee: 0.0,
                    position_id: None,
                }),
                confirm_outcome: None,
            },
            confirm: Some(PendingConfirm {
                request: StoreAction::SimulationTick {
                    market_id: market_id.to_string(),
                    outcome_id,
                    amount,
                    is_sell,
                },
                on_confirm: OnConfirm::SimulationTick,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeSettings, TradingLimits};
    use crate::lmsr_core::Pools;
    use crate::market::{default_seed_markets, Outcome};
    use crate::reconcile::{PushOutcome, PushUpdate};
    use chrono::Duration;

    const ACTOR: &str = "user-1";

    fn reference_market() -> Market {
        let mut market = default_seed_markets(Utc::now(), 40).remove(0);
        let pools = Pools::new(1000.0, 900.0, 800.0);
        market.outcomes = OutcomeId::ALL.map(|id| Outcome::new(id, pools.get(id)));
        market.liquidity = 5000.0;
        market
    }

    fn coordinator() -> TradeCoordinator {
        let mut markets = default_seed_markets(Utc::now(), 40);
        markets[0] = reference_market();
        let mut state = VenueState::new(markets);
        state.account = Account {
            id: Some(ACTOR.into()),
            balance: 1000.0,
            authenticated: true,
        };
        TradeCoordinator::new(state)
    }

    fn ctx_at(now: DateTime<Utc>, fee: bool) -> DispatchContext {
        DispatchContext::new(
            MarketSettings {
                fee: FeeSettings {
                    enabled: fee,
                    rate: 0.02,
                },
                limits: TradingLimits::default(),
            },
            now,
        )
    }

    fn bet(market: &str, outcome: OutcomeId, amount: f64) -> Action {
        Action::PlaceBet {
            market_id: market.into(),
            outcome_id: outcome,
            amount,
            actor: ACTOR.into(),
        }
    }

    #[test]
    fn place_bet_applies_optimistically() {
        let mut c = coordinator();
        let ctx = ctx_at(Utc::now(), false);
        let t = c.dispatch(bet("match-1", OutcomeId::Home, 100.0), &ctx).unwrap();

        let m = c.state().market("match-1").unwrap();
        let receipt = t.report.receipt.unwrap();
        assert!((receipt.shares - 234.845_358_878).abs() < 1e-3);
        assert!((m.pool(OutcomeId::Home) - (1000.0 + receipt.shares)).abs() < 1e-9);
        assert_eq!(m.liquidity, 5100.0);
        assert_eq!(m.history.len(), 2);

        let p = &c.state().positions[0];
        assert!(!p.synced);
        assert_eq!(p.amount_spent, 100.0);
        // balance only moves on settlement
        assert_eq!(c.state().account.balance, 1000.0);
        assert!(matches!(
            t.confirm.unwrap().request,
            StoreAction::PlaceBet { amount, .. } if amount == 100.0
        ));
    }

    #[test]
    fn unauthenticated_bet_is_rejected_first() {
        let mut c = coordinator();
        c.state_mut().account.authenticated = false;
        let before = c.state().clone();
        let err = c
            .dispatch(bet("match-1", OutcomeId::Home, -1.0), &ctx_at(Utc::now(), true))
            .unwrap_err();
        assert_eq!(err, TradeError::AuthRequired);
        assert_eq!(c.state().markets, before.markets);
        assert_eq!(c.state().last_message.as_deref(), Some("sign in before trading"));
    }

    #[test]
    fn non_positive_amount_is_invalid() {
        let mut c = coordinator();
        let ctx = ctx_at(Utc::now(), true);
        assert_eq!(
            c.dispatch(bet("match-1", OutcomeId::Home, 0.0), &ctx).unwrap_err(),
            TradeError::InvalidAmount
        );
        assert_eq!(
            c.dispatch(bet("match-1", OutcomeId::Home, f64::NAN), &ctx).unwrap_err(),
            TradeError::InvalidAmount
        );
    }

    #[test]
    fn second_bet_within_cooldown_is_rejected() {
        let mut c = coordinator();
        let t0 = Utc::now();
        c.dispatch(bet("match-1", OutcomeId::Home, 10.0), &ctx_at(t0, true)).unwrap();

        // Even an oversized amount reports the cooldown first.
        let err = c
            .dispatch(
                bet("match-1", OutcomeId::Draw, 1.0e9),
                &ctx_at(t0 + Duration::milliseconds(999), true),
            )
            .unwrap_err();
        assert_eq!(err, TradeError::Cooldown { remaining_ms: 1 });

        c.dispatch(
            bet("match-1", OutcomeId::Draw, 10.0),
            &ctx_at(t0 + Duration::milliseconds(1000), true),
        )
        .unwrap();
    }

    #[test]
    fn oversized_bet_reports_cap() {
        let mut c = coordinator();
        let err = c
            .dispatch(bet("match-1", OutcomeId::Home, 271.0), &ctx_at(Utc::now(), true))
            .unwrap_err();
        assert_eq!(err, TradeError::AmountTooLarge { cap: 270.0 });
        assert!(c.state().positions.is_empty());
    }

    #[test]
    fn merge_buy_accumulates_cost_basis() {
        let mut c = coordinator();
        let t0 = Utc::now();
        let first = c.dispatch(bet("match-1", OutcomeId::Away, 40.0), &ctx_at(t0, true)).unwrap();
        let second = c
            .dispatch(
                bet("match-1", OutcomeId::Away, 60.0),
                &ctx_at(t0 + Duration::seconds(2), true),
            )
            .unwrap();

        assert_eq!(c.state().positions.len(), 1);
        let p = &c.state().positions[0];
        let shares = first.report.receipt.unwrap().shares + second.report.receipt.unwrap().shares;
        assert_eq!(p.amount_spent, 100.0);
        assert!((p.shares - shares).abs() < 1e-9);
        assert_eq!(p.avg_price, p.amount_spent / p.shares);
    }

    #[test]
    fn fourth_distinct_position_hits_limit() {
        let mut c = coordinator();
        let t0 = Utc::now();
        let picks = [
            ("match-1", OutcomeId::Home),
            ("match-1", OutcomeId::Draw),
            ("match-2", OutcomeId::Away),
        ];
        for (i, (m, o)) in picks.iter().enumerate() {
            c.dispatch(bet(m, *o, 10.0), &ctx_at(t0 + Duration::seconds(i as i64 * 2), true))
                .unwrap();
        }
        let before = c.state().positions.clone();
        let err = c
            .dispatch(
                bet("match-3", OutcomeId::Home, 10.0),
                &ctx_at(t0 + Duration::seconds(10), true),
            )
            .unwrap_err();
        assert_eq!(err, TradeError::PositionLimit { max: 3 });
        assert_eq!(c.state().positions, before);

        // Adding to an existing position is still allowed.
        c.dispatch(
            bet("match-1", OutcomeId::Home, 10.0),
            &ctx_at(t0 + Duration::seconds(12), true),
        )
        .unwrap();
    }

    #[test]
    fn insufficient_funds_rejected() {
        let mut c = coordinator();
        c.state_mut().account.balance = 50.0;
        let err = c
            .dispatch(bet("match-1", OutcomeId::Home, 60.0), &ctx_at(Utc::now(), true))
            .unwrap_err();
        assert!(matches!(err, TradeError::InsufficientFunds { .. }));
    }

    #[test]
    fn full_fee_rejected_before_pricing() {
        let mut c = coordinator();
        let mut ctx = ctx_at(Utc::now(), true);
        ctx.settings.fee.rate = 1.0;
        let err = c.dispatch(bet("match-1", OutcomeId::Home, 10.0), &ctx).unwrap_err();
        assert_eq!(err, TradeError::FeeTooLarge);
    }

    #[test]
    fn failed_confirm_restores_snapshot_bit_for_bit() {
        let mut c = coordinator();
        let before = c.state().clone();
        let ctx = ctx_at(Utc::now(), true);
        let t = c.dispatch(bet("match-1", OutcomeId::Draw, 50.0), &ctx).unwrap();
        let confirm = t.confirm.unwrap();

        let t = c
            .dispatch(
                Action::Confirmed {
                    confirm,
                    result: Err("boom".into()),
                },
                &ctx,
            )
            .unwrap();
        assert!(matches!(
            t.report.confirm_outcome,
            Some(ConfirmOutcome::BetRolledBack { error: TradeError::WriteFailed })
        ));
        assert_eq!(c.state().positions, before.positions);
        assert_eq!(c.state().markets, before.markets);
        assert_eq!(c.state().account.balance.to_bits(), before.account.balance.to_bits());
    }

    #[test]
    fn confirmed_bet_syncs_and_settles_balance() {
        let mut c = coordinator();
        let ctx = ctx_at(Utc::now(), true);
        let confirm = c
            .dispatch(bet("match-1", OutcomeId::Draw, 50.0), &ctx)
            .unwrap()
            .confirm
            .unwrap();
        c.dispatch(
            Action::Confirmed {
                confirm,
                result: Ok(StoreReply {
                    balance: Some(950.0),
                    ..Default::default()
                }),
            },
            &ctx,
        )
        .unwrap();
        assert!(c.state().positions[0].synced);
        assert_eq!(c.state().account.balance, 950.0);
    }

    #[test]
    fn close_requires_sync_then_credits_on_confirm() {
        let mut c = coordinator();
        let ctx = ctx_at(Utc::now(), true);
        let t = c.dispatch(bet("match-1", OutcomeId::Home, 100.0), &ctx).unwrap();
        let position_id = t.report.receipt.unwrap().position_id.unwrap();

        let err = c
            .dispatch(
                Action::ClosePosition {
                    position_id: position_id.clone(),
                },
                &ctx,
            )
            .unwrap_err();
        assert_eq!(err, TradeError::NotSynced);

        c.dispatch(
            Action::Confirmed {
                confirm: t.confirm.unwrap(),
                result: Ok(StoreReply {
                    balance: Some(900.0),
                    ..Default::default()
                }),
            },
            &ctx,
        )
        .unwrap();

        let t = c
            .dispatch(Action::ClosePosition { position_id }, &ctx)
            .unwrap();
        assert!(c.state().positions.is_empty());
        let receipt = t.report.receipt.unwrap();
        // fee on the way in, fee on the way out, and a wider b after the buy
        assert!(receipt.amount < 100.0, "net={}", receipt.amount);
        assert_eq!(c.state().market("match-1").unwrap().history.len(), 3);

        c.dispatch(
            Action::Confirmed {
                confirm: t.confirm.unwrap(),
                result: Ok(StoreReply::default()),
            },
            &ctx,
        )
        .unwrap();
        assert!((c.state().account.balance - (900.0 + receipt.amount)).abs() < 1e-9);
    }

    #[test]
    fn rejected_close_is_not_rolled_back() {
        let mut c = coordinator();
        let ctx = ctx_at(Utc::now(), false);
        c.state_mut().positions.push(Position {
            id: "p-1".into(),
            market_id: "match-1".into(),
            outcome_id: OutcomeId::Home,
            shares: 20.0,
            avg_price: 0.4,
            amount_spent: 8.0,
            created_at: Utc::now(),
            synced: true,
        });
        let t = c
            .dispatch(Action::ClosePosition { position_id: "p-1".into() }, &ctx)
            .unwrap();
        let t = c
            .dispatch(
                Action::Confirmed {
                    confirm: t.confirm.unwrap(),
                    result: Err("store down".into()),
                },
                &ctx,
            )
            .unwrap();
        assert!(matches!(
            t.report.confirm_outcome,
            Some(ConfirmOutcome::CloseUnconfirmed { .. })
        ));
        assert!(c.state().positions.is_empty());
        assert_eq!(c.state().account.balance, 1000.0);
        assert_eq!(c.state().market("match-1").unwrap().pool(OutcomeId::Home), 980.0);
    }

    #[test]
    fn simulation_tick_skips_trading_rules() {
        let mut c = coordinator();
        c.state_mut().account.authenticated = false;
        let ctx = ctx_at(Utc::now(), true);
        let tick = |is_sell| Action::SimulationTick {
            market_id: "match-1".into(),
            outcome_id: OutcomeId::Draw,
            amount: 40.0,
            is_sell,
        };
        c.dispatch(tick(false), &ctx).unwrap();
        let m = c.state().market("match-1").unwrap();
        assert!(m.pool(OutcomeId::Draw) > 900.0);
        assert_eq!(m.liquidity, 5012.0);

        let pool_before = m.pool(OutcomeId::Draw);
        c.dispatch(tick(true), &ctx).unwrap();
        let m = c.state().market("match-1").unwrap();
        assert!(m.pool(OutcomeId::Draw) < pool_before);
        assert_eq!(m.liquidity, 4996.0);
        assert_eq!(m.history.len(), 3);
        assert!(c.state().bet_cooldowns.is_empty());
    }

    #[test]
    fn positions_push_during_pending_bets_keeps_limit() {
        let mut c = coordinator();
        let now = Utc::now();
        let ctx = DispatchContext::new(
            MarketSettings {
                fee: FeeSettings {
                    enabled: false,
                    rate: 0.02,
                },
                limits: TradingLimits {
                    cooldown_ms: 0,
                    ..TradingLimits::default()
                },
            },
            now,
        );
        let first = c.dispatch(bet("match-1", OutcomeId::Home, 10.0), &ctx).unwrap();
        c.dispatch(bet("match-2", OutcomeId::Draw, 10.0), &ctx).unwrap();
        c.dispatch(bet("match-3", OutcomeId::Away, 10.0), &ctx).unwrap();

        // store has applied only the first bet when its positions push lands
        let first_id = first.report.receipt.unwrap().position_id.unwrap();
        let stored = Position {
            synced: true,
            ..c.state().position(&first_id).unwrap().clone()
        };
        let push = PushUpdate::Positions {
            user_id: ACTOR.into(),
            positions: vec![stored],
        };
        assert_eq!(reconcile::apply_push(c.state_mut(), push), PushOutcome::Merged);
        assert_eq!(c.state().positions.len(), 3);

        let err = c
            .dispatch(bet("match-1", OutcomeId::Away, 10.0), &ctx)
            .unwrap_err();
        assert_eq!(err, TradeError::PositionLimit { max: 3 });

        // the second bet's confirm still finds its position
        let pending: Vec<_> = c.state().positions.iter().filter(|p| !p.synced).collect();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn auxiliary_actions_update_session_state() {
        let mut c = coordinator();
        let ctx = ctx_at(Utc::now(), true);

        c.dispatch(Action::SelectMarket { market_id: "match-2".into() }, &ctx)
            .unwrap();
        assert_eq!(c.state().selected_market_id.as_deref(), Some("match-2"));

        let err = c
            .dispatch(Action::SelectMarket { market_id: "nope".into() }, &ctx)
            .unwrap_err();
        assert_eq!(err.code(), "MARKET_NOT_FOUND");
        assert_eq!(c.state().selected_market_id.as_deref(), Some("match-2"));
        assert_eq!(c.state().last_message, Some(err.to_string()));

        c.dispatch(Action::SetMessage { message: None }, &ctx).unwrap();
        assert_eq!(c.state().last_message, None);

        c.dispatch(Action::SetAccount(Account::default()), &ctx).unwrap();
        let err = c.dispatch(bet("match-1", OutcomeId::Home, 10.0), &ctx).unwrap_err();
        assert_eq!(err, TradeError::AuthRequired);
    }

    #[test]
    fn toggle_simulation_defaults_controller_to_account() {
        let mut c = coordinator();
        c.dispatch(
            Action::ToggleSimulation {
                status: SimulationStatus::Running,
                controller_id: None,
            },
            &ctx_at(Utc::now(), true),
        )
        .unwrap();
        assert_eq!(c.state().simulation.status, SimulationStatus::Running);
        assert_eq!(c.state().simulation.controller_id.as_deref(), Some(ACTOR));
    }
}
