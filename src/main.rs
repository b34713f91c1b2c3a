use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{info, warn};

use lmsr_venue::api;
use lmsr_venue::config::Config;
use lmsr_venue::coordinator::VenueState;
use lmsr_venue::market::{default_seed_markets, DEFAULT_BALANCE, DEFAULT_SEED};
use lmsr_venue::simulation::{SimulationDriver, TraderPool};
use lmsr_venue::store::InMemoryStore;
use lmsr_venue::venue::Venue;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lmsr_venue=debug".into()),
        )
        .init();

    info!("🦀 Starting LMSR venue...");
    let config = Config::from_env();
    config.print_config();

    let mut rng = StdRng::seed_from_u64(config.simulation.seed.unwrap_or(DEFAULT_SEED));
    let traders = TraderPool::generate(config.simulation.trader_count, &mut rng);
    let history_limit = config.market.limits.history_limit;

    let store = Arc::new(
        InMemoryStore::seeded(Utc::now(), history_limit, traders.ids())
            .with_position_limit(config.market.limits.max_positions),
    );
    let user_id = std::env::var("VENUE_USER_ID").ok();
    if let Some(id) = &user_id {
        store.upsert_user(id, DEFAULT_BALANCE).await;
    }

    let initial = VenueState::new(default_seed_markets(Utc::now(), history_limit));
    let (venue, venue_task) = Venue::spawn(store, config.market.clone(), initial);
    let source = venue.hydrate(user_id).await?;
    info!(?source, "initial state loaded");

    let driver = SimulationDriver::new(venue.clone(), traders, config.simulation.clone()).spawn();

    let served = api::serve(&config.server, venue).await;
    if let Err(err) = &served {
        warn!(error = %err, "HTTP server stopped");
    }
    driver.abort();
    venue_task.abort();
    served
}
