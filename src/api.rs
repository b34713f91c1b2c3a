//! HTTP surface over the venue actor.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::{MarketSettings, ServerConfig};
use crate::coordinator::{ActionReport, VenueState};
use crate::error::{ErrorKind, TradeError};
use crate::history::MarketSnapshot;
use crate::lmsr_core::OutcomeId;
use crate::market::{Market, SimulationStatus};
use crate::quote;
use crate::venue::{VenueError, VenueHandle};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn trade_status(err: &TradeError) -> StatusCode {
    match err {
        TradeError::AuthRequired => StatusCode::UNAUTHORIZED,
        TradeError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
        TradeError::MarketNotFound(_) | TradeError::PositionNotFound(_) => StatusCode::NOT_FOUND,
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Pricing => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Sync => StatusCode::CONFLICT,
        },
    }
}

fn api_error(err: VenueError) -> ApiError {
    match err {
        VenueError::Trade(err) => (
            trade_status(&err),
            Json(json!({ "code": err.code(), "error": err.to_string() })),
        ),
        VenueError::Closed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "code": "UNAVAILABLE", "error": "venue is not running" })),
        ),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeView {
    pub id: OutcomeId,
    pub label: String,
    pub pool: f64,
    pub probability: f64,
    pub price: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketView {
    pub id: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub liquidity: f64,
    pub max_bet: f64,
    pub outcomes: Vec<OutcomeView>,
    pub history: Vec<MarketSnapshot>,
}

impl From<&Market> for MarketView {
    fn from(market: &Market) -> Self {
        let probabilities = market.probabilities();
        Self {
            id: market.id.clone(),
            sport: market.sport.clone(),
            league: market.league.clone(),
            home_team: market.home_team.clone(),
            away_team: market.away_team.clone(),
            start_time: market.start_time,
            liquidity: market.liquidity,
            max_bet: quote::market_max_bet(market),
            outcomes: market
                .outcomes
                .iter()
                .map(|o| {
                    let probability = probabilities.get(o.id);
                    OutcomeView {
                        id: o.id,
                        label: o.label.clone(),
                        pool: o.pool,
                        probability,
                        price: quote::price_from_probability(probability),
                    }
                })
                .collect(),
            history: market.history.iter().copied().collect(),
        }
    }
}

fn report_json(report: ActionReport) -> Value {
    json!({
        "message": report.message,
        "receipt": report.receipt,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRequest {
    pub market_id: String,
    pub outcome_id: OutcomeId,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SimulationRequest {
    pub status: SimulationStatus,
}

pub fn router(venue: VenueHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/session", post(start_session))
        .route("/markets", get(list_markets))
        .route("/markets/:market_id", get(get_market))
        .route("/positions", get(list_positions))
        .route("/positions/:position_id/close", post(close_position))
        .route("/account", get(get_account))
        .route("/bets", post(place_bet))
        .route("/simulation", post(set_simulation))
        .route("/settings", get(get_settings).put(put_settings))
        .layer(cors)
        .with_state(venue)
}

/// Bind and serve until the listener fails.
pub async fn serve(config: &ServerConfig, venue: VenueHandle) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🚀 Venue listening on http://{}", addr);
    axum::serve(listener, router(venue)).await?;
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "lmsr-venue"
    }))
}

async fn snapshot(venue: &VenueHandle) -> Result<VenueState, ApiError> {
    venue.snapshot().await.map_err(api_error)
}

async fn start_session(State(venue): State<VenueHandle>, Json(req): Json<SessionRequest>) -> ApiResult<Value> {
    let source = venue.hydrate(req.user_id).await.map_err(api_error)?;
    let state = snapshot(&venue).await?;
    Ok(Json(json!({ "source": source, "account": state.account })))
}

async fn list_markets(State(venue): State<VenueHandle>) -> ApiResult<Vec<MarketView>> {
    let state = snapshot(&venue).await?;
    Ok(Json(state.markets.iter().map(MarketView::from).collect()))
}

async fn get_market(State(venue): State<VenueHandle>, Path(market_id): Path<String>) -> ApiResult<MarketView> {
    let state = snapshot(&venue).await?;
    state
        .market(&market_id)
        .map(|m| Json(MarketView::from(m)))
        .ok_or_else(|| api_error(TradeError::MarketNotFound(market_id).into()))
}

async fn list_positions(State(venue): State<VenueHandle>) -> ApiResult<Value> {
    let state = snapshot(&venue).await?;
    Ok(Json(json!({ "positions": state.positions })))
}

async fn get_account(State(venue): State<VenueHandle>) -> ApiResult<Value> {
    let state = snapshot(&venue).await?;
    Ok(Json(json!({
        "account": state.account,
        "simulation": state.simulation,
        "message": state.last_message,
    })))
}

async fn place_bet(State(venue): State<VenueHandle>, Json(req): Json<BetRequest>) -> ApiResult<Value> {
    let state = snapshot(&venue).await?;
    let actor = state.account.id.unwrap_or_else(|| "anonymous".to_string());
    let report = venue
        .place_bet(&req.market_id, req.outcome_id, req.amount, &actor)
        .await
        .map_err(api_error)?;
    Ok(Json(report_json(report)))
}

async fn close_position(State(venue): State<VenueHandle>, Path(position_id): Path<String>) -> ApiResult<Value> {
    let report = venue.close_position(&position_id).await.map_err(api_error)?;
    Ok(Json(report_json(report)))
}

async fn set_simulation(State(venue): State<VenueHandle>, Json(req): Json<SimulationRequest>) -> ApiResult<Value> {
    venue.set_simulation(req.status, None).await.map_err(api_error)?;
    let state = snapshot(&venue).await?;
    Ok(Json(json!({ "simulation": state.simulation })))
}

async fn get_settings(State(venue): State<VenueHandle>) -> Json<MarketSettings> {
    Json(venue.settings())
}

async fn put_settings(State(venue): State<VenueHandle>, Json(settings): Json<MarketSettings>) -> ApiResult<MarketSettings> {
    if !settings.fee.rate.is_finite() || !(0.0..1.0).contains(&settings.fee.rate) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "INVALID_SETTINGS", "error": "fee rate must be in [0, 1)" })),
        ));
    }
    info!(fee_enabled = settings.fee.enabled, fee_rate = settings.fee.rate, "settings updated");
    venue.update_settings(settings.clone());
    Ok(Json(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::VenueState;
    use crate::market::default_seed_markets;
    use crate::store::InMemoryStore;
    use crate::venue::Venue;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> Router {
        let store = Arc::new(InMemoryStore::seeded(Utc::now(), 40, vec!["bot-01".into()]));
        store.upsert_user("user-1", 1000.0).await;
        let state = VenueState::new(default_seed_markets(Utc::now(), 40));
        let (venue, _task) = Venue::spawn(store, MarketSettings::default(), state);
        router(venue)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_and_markets() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = call(&app, "GET", "/markets", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
        assert_eq!(body[0]["outcomes"][0]["id"], "home");

        let (status, body) = call(&app, "GET", "/markets/nope", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "MARKET_NOT_FOUND");
    }

    #[tokio::test]
    async fn bet_requires_session() {
        let app = app().await;
        let bet = json!({ "marketId": "match-1", "outcomeId": "home", "amount": 10.0 });
        let (status, body) = call(&app, "POST", "/bets", bet.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "AUTH_REQUIRED");

        let (status, body) = call(&app, "POST", "/session", json!({ "userId": "user-1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "store");

        let (status, body) = call(&app, "POST", "/bets", bet).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["receipt"]["side"], "buy");
    }

    #[tokio::test]
    async fn settings_round_trip_and_validation() {
        let app = app().await;
        let (_, mut settings) = call(&app, "GET", "/settings", Value::Null).await;
        settings["fee"]["rate"] = json!(0.05);
        let (status, _) = call(&app, "PUT", "/settings", settings.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let (_, current) = call(&app, "GET", "/settings", Value::Null).await;
        assert_eq!(current["fee"]["rate"], 0.05);

        settings["fee"]["rate"] = json!(1.0);
        let (status, body) = call(&app, "PUT", "/settings", settings).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SETTINGS");
    }
}
