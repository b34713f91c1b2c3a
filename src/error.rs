use serde::Serialize;
use thiserror::Error;

/// Coarse classification used by callers that only care about the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any mutation.
    Validation,
    /// Cost-function inversion failed; nothing mutated.
    Pricing,
    /// Disagreement with the authoritative store.
    Sync,
}

/// Every way a trade action can be refused or undone.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    #[error("sign in before trading")]
    AuthRequired,

    #[error("enter a positive amount")]
    InvalidAmount,

    #[error("wait {remaining_ms}ms between bets")]
    Cooldown { remaining_ms: i64 },

    #[error("maximum single bet is {cap:.2}")]
    AmountTooLarge { cap: f64 },

    #[error("you already hold {max} open positions; close one first")]
    PositionLimit { max: usize },

    #[error("insufficient funds: balance {balance:.2}, needed {needed:.2}")]
    InsufficientFunds { balance: f64, needed: f64 },

    #[error("amount after fee is too small")]
    FeeTooLarge,

    #[error("pricing failed for this amount")]
    PricingFailed,

    #[error("position is still waiting for confirmation; close it once synced")]
    NotSynced,

    #[error("write to the authoritative store failed; bet reverted")]
    WriteFailed,

    #[error("unknown market '{0}'")]
    MarketNotFound(String),

    #[error("unknown position '{0}'")]
    PositionNotFound(String),
}

impl TradeError {
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::AuthRequired => "AUTH_REQUIRED",
            TradeError::InvalidAmount => "INVALID_AMOUNT",
            TradeError::Cooldown { .. } => "COOLDOWN",
            TradeError::AmountTooLarge { .. } => "AMOUNT_TOO_LARGE",
            TradeError::PositionLimit { .. } => "POSITION_LIMIT",
            TradeError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TradeError::FeeTooLarge => "FEE_TOO_LARGE",
            TradeError::PricingFailed => "PRICING_FAILED",
            TradeError::NotSynced => "NOT_SYNCED",
            TradeError::WriteFailed => "WRITE_FAILED",
            TradeError::MarketNotFound(_) => "MARKET_NOT_FOUND",
            TradeError::PositionNotFound(_) => "POSITION_NOT_FOUND",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TradeError::PricingFailed => ErrorKind::Pricing,
            TradeError::NotSynced | TradeError::WriteFailed => ErrorKind::Sync,
            _ => ErrorKind::Validation,
        }
    }
}
