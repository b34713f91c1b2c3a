//! Configuration management for the venue
//! Supports environment variables and default values for fees, trading limits and simulation

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

/// Configuration for the venue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Settings every trade action is evaluated against
    pub market: MarketSettings,

    /// Synthetic order-flow tuning
    pub simulation: SimulationSettings,

    /// HTTP listener
    pub server: ServerConfig,
}

/// Snapshot handed to the reducer with each dispatched action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSettings {
    pub fee: FeeSettings,
    pub limits: TradingLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSettings {
    /// Charge a fee on bets and closes (default: true)
    pub enabled: bool,

    /// Fraction of the traded amount kept as fee (default: 0.02)
    pub rate: f64,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 0.02,
        }
    }
}

impl FeeSettings {
    /// Rate actually applied, zero when fees are off.
    pub fn effective_rate(&self) -> f64 {
        if self.enabled {
            self.rate
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingLimits {
    /// Open positions allowed per account (default: 3)
    pub max_positions: usize,

    /// Minimum spacing between bets of one actor (default: 1000)
    pub cooldown_ms: i64,

    /// Snapshots kept per market (default: 40)
    pub history_limit: usize,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            max_positions: 3,
            cooldown_ms: 1000,
            history_limit: crate::history::HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSettings {
    /// Scheduler tick for ordinary synthetic trades (default: 900)
    pub normal_interval_ms: u64,

    /// Minimum spacing between shock events (default: 3000)
    pub event_interval_ms: u64,

    /// Ordinary trade size range (default: 5..45)
    pub normal_min_amount: f64,
    pub normal_max_amount: f64,

    /// Shock size as percent of the market cap (default: 50..100)
    pub event_min_percent: f64,
    pub event_max_percent: f64,

    /// Number of synthetic traders (default: 8)
    #[serde(default = "default_trader_count")]
    pub trader_count: usize,

    /// Fixed RNG seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_trader_count() -> usize {
    8
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            normal_interval_ms: 900,
            event_interval_ms: 3000,
            normal_min_amount: 5.0,
            normal_max_amount: 45.0,
            event_min_percent: 50.0,
            event_max_percent: 100.0,
            trader_count: default_trader_count(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn override_from_env<T: FromStr>(target: &mut T, name: &str) {
    if let Some(value) = env_parse(name) {
        *target = value;
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        override_from_env(&mut config.market.fee.enabled, "VENUE_FEE_ENABLED");
        override_from_env(&mut config.market.fee.rate, "VENUE_FEE_RATE");
        override_from_env(&mut config.market.limits.max_positions, "VENUE_MAX_POSITIONS");
        override_from_env(&mut config.market.limits.cooldown_ms, "VENUE_COOLDOWN_MS");
        override_from_env(&mut config.market.limits.history_limit, "VENUE_HISTORY_LIMIT");

        let sim = &mut config.simulation;
        override_from_env(&mut sim.normal_interval_ms, "SIM_NORMAL_INTERVAL_MS");
        override_from_env(&mut sim.event_interval_ms, "SIM_EVENT_INTERVAL_MS");
        override_from_env(&mut sim.normal_min_amount, "SIM_NORMAL_MIN_AMOUNT");
        override_from_env(&mut sim.normal_max_amount, "SIM_NORMAL_MAX_AMOUNT");
        override_from_env(&mut sim.event_min_percent, "SIM_EVENT_MIN_PERCENT");
        override_from_env(&mut sim.event_max_percent, "SIM_EVENT_MAX_PERCENT");
        override_from_env(&mut sim.trader_count, "SIM_TRADER_COUNT");
        if let Some(seed) = env_parse::<u64>("SIM_SEED") {
            sim.seed = Some(seed);
        }

        override_from_env(&mut config.server.host, "VENUE_HOST");
        override_from_env(&mut config.server.port, "VENUE_PORT");

        // Validate configuration
        config.validate();

        config
    }

    /// Validate configuration values, resetting anything unusable
    pub fn validate(&mut self) {
        let defaults = Config::default();

        let fee = &mut self.market.fee;
        if !fee.rate.is_finite() || fee.rate < 0.0 || fee.rate >= 1.0 {
            warn!(rate = fee.rate, "Invalid fee rate, using default");
            fee.rate = defaults.market.fee.rate;
        }

        let limits = &mut self.market.limits;
        if limits.cooldown_ms < 0 {
            warn!(cooldown_ms = limits.cooldown_ms, "Negative cooldown, using default");
            limits.cooldown_ms = defaults.market.limits.cooldown_ms;
        }
        if limits.history_limit == 0 {
            warn!("History limit must be positive, using default");
            limits.history_limit = defaults.market.limits.history_limit;
        }

        let sim = &mut self.simulation;
        if sim.normal_interval_ms == 0 {
            warn!("normal_interval_ms must be positive, using default");
            sim.normal_interval_ms = defaults.simulation.normal_interval_ms;
        }
        if sim.event_interval_ms == 0 {
            warn!("event_interval_ms must be positive, using default");
            sim.event_interval_ms = defaults.simulation.event_interval_ms;
        }
        if !(sim.normal_min_amount > 0.0) || sim.normal_min_amount > sim.normal_max_amount {
            warn!(
                min = sim.normal_min_amount,
                max = sim.normal_max_amount,
                "Invalid normal amount range, using default"
            );
            sim.normal_min_amount = defaults.simulation.normal_min_amount;
            sim.normal_max_amount = defaults.simulation.normal_max_amount;
        }
        let pct_ok = |p: f64| (0.0..=100.0).contains(&p);
        if !pct_ok(sim.event_min_percent)
            || !pct_ok(sim.event_max_percent)
            || sim.event_min_percent > sim.event_max_percent
        {
            warn!(
                min = sim.event_min_percent,
                max = sim.event_max_percent,
                "Invalid event percent range, using default"
            );
            sim.event_min_percent = defaults.simulation.event_min_percent;
            sim.event_max_percent = defaults.simulation.event_max_percent;
        }
        if sim.trader_count == 0 {
            warn!("trader_count must be positive, using default");
            sim.trader_count = defaults.simulation.trader_count;
        }
    }

    /// Log current configuration for debugging
    pub fn print_config(&self) {
        info!("🔧 Venue Configuration:");
        info!("   Fee Enabled: {}", self.market.fee.enabled);
        info!("   Fee Rate: {}", self.market.fee.rate);
        info!("   Max Positions: {}", self.market.limits.max_positions);
        info!("   Cooldown: {}ms", self.market.limits.cooldown_ms);
        info!("   History Limit: {}", self.market.limits.history_limit);
        info!(
            "   Simulation: every {}ms, shocks every {}ms, {} traders",
            self.simulation.normal_interval_ms,
            self.simulation.event_interval_ms,
            self.simulation.trader_count
        );
        info!("   Listen: {}:{}", self.server.host, self.server.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings_store() {
        let c = Config::default();
        assert!(c.market.fee.enabled);
        assert_eq!(c.market.fee.rate, 0.02);
        assert_eq!(c.market.limits.max_positions, 3);
        assert_eq!(c.market.limits.cooldown_ms, 1000);
        assert_eq!(c.market.limits.history_limit, 40);
        assert_eq!(c.simulation.normal_interval_ms, 900);
        assert_eq!(c.simulation.event_interval_ms, 3000);
        assert_eq!(c.simulation.event_max_percent, 100.0);
    }

    #[test]
    fn validate_repairs_bad_values() {
        let mut c = Config::default();
        c.market.fee.rate = 1.5;
        c.simulation.normal_min_amount = 50.0;
        c.simulation.normal_max_amount = 10.0;
        c.simulation.event_min_percent = 120.0;
        c.simulation.trader_count = 0;
        c.validate();
        assert_eq!(c, Config::default());
    }

    #[test]
    fn effective_rate_respects_toggle() {
        let mut fee = FeeSettings::default();
        assert_eq!(fee.effective_rate(), 0.02);
        fee.enabled = false;
        assert_eq!(fee.effective_rate(), 0.0);
    }

    #[test]
    fn settings_json_uses_camel_case() {
        let json = serde_json::to_value(&SimulationSettings::default()).unwrap();
        assert_eq!(json["normalIntervalMs"], 900);
        assert_eq!(json["eventMinPercent"], 50.0);
    }
}
