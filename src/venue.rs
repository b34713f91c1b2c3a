//! Venue actor.
//!
//! A single task owns the `TradeCoordinator` and drains one command channel,
//! so every action is applied to completion before the next is read. Store
//! confirms run as separate tasks spawned after the transition and re-enter
//! the channel as `Action::Confirmed`. Store pushes arrive the same way.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MarketSettings;
use crate::coordinator::{Action, ActionReport, DispatchContext, TradeCoordinator, TradeReceipt, VenueState};
use crate::error::TradeError;
use crate::lmsr_core::OutcomeId;
use crate::market::{default_seed_markets, Account, SimulationStatus, DEFAULT_BALANCE};
use crate::reconcile::{self, AuthoritativeStore, ConfirmOutcome, PendingConfirm, PushOutcome, PushUpdate};

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VenueError {
    #[error(transparent)]
    Trade(#[from] TradeError),

    #[error("venue is not running")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HydrationSource {
    Store,
    /// Store unreachable or empty; deterministic fixtures were used.
    Seed,
}

/// Notifications for UI/API listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VenueEvent {
    Applied {
        action: &'static str,
        receipt: Option<TradeReceipt>,
    },
    Rejected {
        action: &'static str,
        code: &'static str,
        message: String,
    },
    BetSynced {
        position_id: String,
    },
    WriteFailed {
        message: String,
    },
    PositionClosed {
        credited: f64,
    },
    CloseUnconfirmed {
        reason: String,
    },
    PushMerged {
        kind: &'static str,
    },
    Hydrated {
        source: HydrationSource,
    },
}

enum Command {
    Dispatch {
        action: Action,
        reply: oneshot::Sender<Result<ActionReport, TradeError>>,
    },
    Confirmed {
        confirm: PendingConfirm,
        result: Result<crate::reconcile::StoreReply, String>,
    },
    Push(PushUpdate),
    Snapshot {
        reply: oneshot::Sender<VenueState>,
    },
    Hydrate {
        user_id: Option<String>,
        reply: oneshot::Sender<HydrationSource>,
    },
}

fn push_kind(update: &PushUpdate) -> &'static str {
    match update {
        PushUpdate::OutcomePool { .. } => "outcome_pool",
        PushUpdate::MarketLiquidity { .. } => "market_liquidity",
        PushUpdate::HistoryInsert { .. } => "history_insert",
        PushUpdate::Positions { .. } => "positions",
        PushUpdate::Balance { .. } => "balance",
    }
}

pub struct Venue {
    coordinator: TradeCoordinator,
    store: Arc<dyn AuthoritativeStore>,
    settings: watch::Receiver<MarketSettings>,
    commands: mpsc::Receiver<Command>,
    loopback: mpsc::WeakSender<Command>,
    events: broadcast::Sender<VenueEvent>,
}

impl Venue {
    /// Start the actor and the store push forwarder.
    pub fn spawn(
        store: Arc<dyn AuthoritativeStore>,
        settings: MarketSettings,
        initial: VenueState,
    ) -> (VenueHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        spawn_push_forwarder(store.subscribe(), tx.downgrade());

        let venue = Venue {
            coordinator: TradeCoordinator::new(initial),
            store,
            settings: settings_rx,
            commands: rx,
            loopback: tx.downgrade(),
            events: events.clone(),
        };
        let task = tokio::spawn(venue.run());

        let handle = VenueHandle {
            commands: tx,
            settings: Arc::new(settings_tx),
            events,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!("venue started");
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Dispatch { action, reply } => {
                    let result = self.dispatch(action);
                    let _ = reply.send(result);
                }
                Command::Confirmed { confirm, result } => {
                    let _ = self.dispatch(Action::Confirmed { confirm, result });
                }
                Command::Push(update) => self.merge_push(update),
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.coordinator.state().clone());
                }
                Command::Hydrate { user_id, reply } => {
                    let source = self.hydrate(user_id).await;
                    let _ = reply.send(source);
                }
            }
        }
        info!("venue stopped");
    }

    fn emit(&self, event: VenueEvent) {
        let _ = self.events.send(event);
    }

    fn dispatch(&mut self, action: Action) -> Result<ActionReport, TradeError> {
        let ctx = DispatchContext::new(self.settings.borrow().clone(), Utc::now());
        let name = action.name();
        let transition = match self.coordinator.dispatch(action, &ctx) {
            Ok(transition) => transition,
            Err(err) => {
                // synthetic flow failures are dropped
                if name != "simulation_tick" {
                    self.emit(VenueEvent::Rejected {
                        action: name,
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
                return Err(err);
            }
        };

        match &transition.report.confirm_outcome {
            Some(outcome) => self.emit_confirm(outcome),
            None => self.emit(VenueEvent::Applied {
                action: name,
                receipt: transition.report.receipt.clone(),
            }),
        }
        if let Some(confirm) = transition.confirm {
            self.spawn_confirm(confirm);
        }
        Ok(transition.report)
    }

    fn emit_confirm(&self, outcome: &ConfirmOutcome) {
        let event = match outcome {
            ConfirmOutcome::BetSynced { position_id } => VenueEvent::BetSynced {
                position_id: position_id.clone(),
            },
            ConfirmOutcome::BetRolledBack { error } => VenueEvent::WriteFailed {
                message: error.to_string(),
            },
            ConfirmOutcome::PositionClosed { credited } => VenueEvent::PositionClosed { credited: *credited },
            ConfirmOutcome::CloseUnconfirmed { reason } => VenueEvent::CloseUnconfirmed {
                reason: reason.clone(),
            },
            ConfirmOutcome::TickConfirmed | ConfirmOutcome::TickDropped => return,
        };
        self.emit(event);
    }

    /// Send the confirm on its own task; the reply comes back through the channel.
    fn spawn_confirm(&self, confirm: PendingConfirm) {
        let store = Arc::clone(&self.store);
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let action = confirm.request.name();
            let result = store
                .execute(confirm.request.clone())
                .await
                .map_err(|err| err.to_string());
            if let Err(reason) = &result {
                debug!(action, %reason, "confirm rejected");
            }
            match loopback.upgrade() {
                Some(tx) => {
                    if tx.send(Command::Confirmed { confirm, result }).await.is_err() {
                        warn!(action, "venue gone before confirm could be applied");
                    }
                }
                None => warn!(action, "venue gone before confirm could be applied"),
            }
        });
    }

    fn merge_push(&mut self, update: PushUpdate) {
        let kind = push_kind(&update);
        match reconcile::apply_push(self.coordinator.state_mut(), update) {
            PushOutcome::Merged => self.emit(VenueEvent::PushMerged { kind }),
            outcome => debug!(kind, ?outcome, "push not merged"),
        }
    }

    async fn hydrate(&mut self, user_id: Option<String>) -> HydrationSource {
        let settings = self.settings.borrow().clone();
        let limit = settings.limits.history_limit;
        let loaded = self.store.load(user_id.as_deref(), limit).await;

        let (state, source) = match loaded {
            Ok(snapshot) if !snapshot.markets.is_empty() => {
                let mut state = VenueState::new(snapshot.markets);
                state.positions = snapshot.positions;
                state.account = Account {
                    authenticated: user_id.is_some(),
                    balance: snapshot.balance.unwrap_or(DEFAULT_BALANCE),
                    id: user_id,
                };
                (state, HydrationSource::Store)
            }
            other => {
                match other {
                    Err(err) => error!(error = %err, "store load failed, using seeded markets"),
                    Ok(_) => warn!("store returned no markets, using seeded markets"),
                }
                let mut state = VenueState::new(default_seed_markets(Utc::now(), limit));
                state.account = Account {
                    id: None,
                    balance: DEFAULT_BALANCE,
                    authenticated: false,
                };
                (state, HydrationSource::Seed)
            }
        };

        let simulation = self.coordinator.state().simulation.clone();
        self.coordinator.replace_state(VenueState { simulation, ..state });
        info!(?source, "venue hydrated");
        self.emit(VenueEvent::Hydrated { source });
        source
    }
}

fn spawn_push_forwarder(mut pushes: broadcast::Receiver<PushUpdate>, loopback: mpsc::WeakSender<Command>) {
    tokio::spawn(async move {
        loop {
            match pushes.recv().await {
                Ok(update) => {
                    let Some(tx) = loopback.upgrade() else { break };
                    if tx.send(Command::Push(update)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("push forwarder stopped");
    });
}

/// Cloneable front door to the venue actor.
#[derive(Clone)]
pub struct VenueHandle {
    commands: mpsc::Sender<Command>,
    settings: Arc<watch::Sender<MarketSettings>>,
    events: broadcast::Sender<VenueEvent>,
}

impl VenueHandle {
    pub async fn dispatch(&self, action: Action) -> Result<ActionReport, VenueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch { action, reply })
            .await
            .map_err(|_| VenueError::Closed)?;
        Ok(rx.await.map_err(|_| VenueError::Closed)??)
    }

    pub async fn place_bet(
        &self,
        market_id: &str,
        outcome_id: OutcomeId,
        amount: f64,
        actor: &str,
    ) -> Result<ActionReport, VenueError> {
        self.dispatch(Action::PlaceBet {
            market_id: market_id.to_string(),
            outcome_id,
            amount,
            actor: actor.to_string(),
        })
        .await
    }

    pub async fn close_position(&self, position_id: &str) -> Result<ActionReport, VenueError> {
        self.dispatch(Action::ClosePosition {
            position_id: position_id.to_string(),
        })
        .await
    }

    pub async fn simulation_tick(
        &self,
        market_id: &str,
        outcome_id: OutcomeId,
        amount: f64,
        is_sell: bool,
    ) -> Result<ActionReport, VenueError> {
        self.dispatch(Action::SimulationTick {
            market_id: market_id.to_string(),
            outcome_id,
            amount,
            is_sell,
        })
        .await
    }

    pub async fn set_simulation(
        &self,
        status: SimulationStatus,
        controller_id: Option<String>,
    ) -> Result<ActionReport, VenueError> {
        self.dispatch(Action::ToggleSimulation { status, controller_id })
            .await
    }

    pub async fn snapshot(&self) -> Result<VenueState, VenueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| VenueError::Closed)?;
        rx.await.map_err(|_| VenueError::Closed)
    }

    /// Reload state from the store, falling back to the seeded fixtures.
    pub async fn hydrate(&self, user_id: Option<String>) -> Result<HydrationSource, VenueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Hydrate { user_id, reply })
            .await
            .map_err(|_| VenueError::Closed)?;
        rx.await.map_err(|_| VenueError::Closed)
    }

    /// Merge an externally received push, same path as the store subscription.
    pub async fn push(&self, update: PushUpdate) -> Result<(), VenueError> {
        self.commands
            .send(Command::Push(update))
            .await
            .map_err(|_| VenueError::Closed)
    }

    pub fn settings(&self) -> MarketSettings {
        self.settings.borrow().clone()
    }

    /// Takes effect from the next dispatched action.
    pub fn update_settings(&self, settings: MarketSettings) {
        self.settings.send_replace(settings);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VenueEvent> {
        self.events.subscribe()
    }
}
