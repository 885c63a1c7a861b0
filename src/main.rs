mod config;
mod domain;
mod infrastructure;
mod persistence;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TradingConfig;
use crate::domain::entities::signal::{ExecutionMode, OrderIntent, TradeSignal};
use crate::domain::entities::trade::{Trade, TradeStatus};
use crate::domain::errors::EngineError;
use crate::domain::services::lifecycle::{LifecycleEngine, TriggerOutcome};
use crate::domain::services::reconciler::EventReconciler;
use crate::domain::services::sweeper::StaleOrderSweeper;
use crate::domain::services::trade_locks::TradeLocks;
use crate::infrastructure::bybit_client::{BybitClient, BybitConfig};
use crate::infrastructure::private_stream::{self, PrivateStreamConfig};
use crate::persistence::models::TradeFilter;
use crate::persistence::repository::{TradeRepository, TradeUpdateLogRepository};
use crate::persistence::{init_database, RetryPolicy};

#[derive(Clone)]
struct AppState {
    engine: Arc<LifecycleEngine>,
    config: Arc<TradingConfig>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echelon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(TradingConfig::from_env());
    info!(
        "Echelon trading engine starting ({})",
        if config.testnet { "testnet" } else { "mainnet" }
    );

    let pool = init_database(&config.database_url).await?;
    let retry = RetryPolicy {
        attempts: config.store_retry_attempts,
        base_delay: Duration::from_millis(config.store_retry_base_delay_ms),
    };
    let trades = TradeRepository::new(pool.clone(), retry.clone());
    let journal = TradeUpdateLogRepository::new(pool, retry);

    let gateway = Arc::new(BybitClient::new(
        BybitConfig::new(&config.bybit_api_key, &config.bybit_api_secret, config.testnet),
        Duration::from_millis(config.gateway_timeout_ms),
    )?);

    let engine = Arc::new(LifecycleEngine::new(
        gateway,
        trades.clone(),
        journal,
        Arc::new(TradeLocks::new()),
        config.clone(),
    ));

    // Cooperative shutdown: flipping the flag stops every loop; in-flight
    // gateway calls finish before tasks exit.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Private order stream feeds the reconciler through a channel so the
    // websocket read loop never blocks on event handling.
    let (event_tx, event_rx) = mpsc::channel(256);
    private_stream::spawn(
        PrivateStreamConfig {
            api_key: config.bybit_api_key.clone(),
            api_secret: config.bybit_api_secret.clone(),
            testnet: config.testnet,
        },
        event_tx,
        shutdown_rx.clone(),
    );

    let reconciler = EventReconciler::new(
        engine.clone(),
        trades.clone(),
        config.event_lookup_attempts,
        Duration::from_millis(config.event_lookup_delay_ms),
    );
    tokio::spawn(reconciler.run(event_rx, shutdown_rx.clone()));

    let sweeper = StaleOrderSweeper::new(
        engine.clone(),
        trades,
        Duration::from_secs(config.sweep_interval_secs),
        chrono::Duration::minutes(config.stale_order_max_age_mins),
    );
    tokio::spawn(sweeper.run(shutdown_rx));

    let state = AppState {
        engine,
        config: config.clone(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/orders/limit", post(create_order_limit))
        .route("/api/v1/positions/:id", put(update_position))
        .route("/api/v1/positions/:id/stoploss", put(update_stoploss))
        .route("/api/v1/positions/:id/close", post(close_position))
        .route("/api/v1/cancel_order", post(cancel_order))
        .route("/api/v1/trades/:id", get(get_trade))
        .route("/api/v1/trades", get(list_trades))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    info!("Echelon trading engine stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then flip the shared shutdown flag.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down background tasks...");
    let _ = shutdown_tx.send(true);
}

fn error_response(error: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &error {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::TradeNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Gateway(_) => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": error.to_string()})))
}

fn decimal_param(name: &str, value: f64) -> Result<Decimal, (StatusCode, Json<Value>)> {
    Decimal::from_f64_retain(value).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("{name} is not a finite number")})),
        )
    })
}

fn trade_json(trade: &Trade) -> Value {
    json!({
        "id": trade.id,
        "order_id": trade.order_id,
        "symbol": trade.symbol,
        "side": trade.side.as_str(),
        "entry_price": trade.entry_price.to_f64(),
        "quantity": trade.quantity.to_f64(),
        "position_size": trade.position_size.to_f64(),
        "leverage": trade.leverage,
        "tp1_price": trade.tp1_price.and_then(|p| p.to_f64()),
        "tp2_price": trade.tp2_price.and_then(|p| p.to_f64()),
        "tp3_price": trade.tp3_price.and_then(|p| p.to_f64()),
        "sl_price": trade.sl_price.to_f64(),
        "current_sl": trade.current_sl.to_f64(),
        "current_tp": trade.current_tp.and_then(|p| p.to_f64()),
        "strategy_type": trade.strategy_type,
        "status": trade.status.as_str(),
        "bot_name": trade.bot_name,
        "pnl": trade.pnl.to_f64(),
        "pnl_percent": trade.pnl_percent.to_f64(),
        "filled_at": trade.filled_at,
        "closed_at": trade.closed_at,
        "created_at": trade.created_at,
        "updated_at": trade.updated_at,
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "exchange": "bybit",
        "testnet": state.config.testnet,
    }))
}

async fn create_with_mode(
    state: AppState,
    signal: TradeSignal,
    mode: ExecutionMode,
) -> (StatusCode, Json<Value>) {
    let intent = match OrderIntent::try_from_signal(&signal, mode, &state.config) {
        Ok(intent) => intent,
        Err(e) => return error_response(e),
    };
    match state.engine.create_trade(intent).await {
        Ok(created) => (
            StatusCode::CREATED,
            Json(json!({
                "trade_id": created.trade_id,
                "order_id": created.order_id,
                "status": created.status.as_str(),
                "bot_name": signal.bot,
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn create_order(
    State(state): State<AppState>,
    Json(signal): Json<TradeSignal>,
) -> (StatusCode, Json<Value>) {
    create_with_mode(state, signal, ExecutionMode::Market).await
}

async fn create_order_limit(
    State(state): State<AppState>,
    Json(signal): Json<TradeSignal>,
) -> (StatusCode, Json<Value>) {
    create_with_mode(state, signal, ExecutionMode::Limit).await
}

#[derive(Deserialize)]
struct UpdatePositionRequest {
    current_price: f64,
}

async fn update_position(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdatePositionRequest>,
) -> (StatusCode, Json<Value>) {
    let price = match decimal_param("current_price", request.current_price) {
        Ok(price) => price,
        Err(response) => return response,
    };
    match state.engine.evaluate_price_trigger(id, price).await {
        Ok(outcome) => {
            let body = match outcome {
                TriggerOutcome::Unchanged { status, pnl } => json!({
                    "status": status.as_str(),
                    "message": "No update required",
                    "pnl": pnl.to_f64(),
                }),
                TriggerOutcome::Tp1Ratcheted { pnl } => json!({
                    "status": TradeStatus::Tp1Hit.as_str(),
                    "message": "Stoploss moved to entry",
                    "pnl": pnl.to_f64(),
                }),
                TriggerOutcome::Tp2Ratcheted { pnl } => json!({
                    "status": TradeStatus::Tp2Hit.as_str(),
                    "message": "Stoploss moved to TP1",
                    "pnl": pnl.to_f64(),
                }),
                TriggerOutcome::ClosedAtStop { pnl } => json!({
                    "status": TradeStatus::Closed.as_str(),
                    "message": "Position closed at stoploss",
                    "pnl": pnl.to_f64(),
                }),
            };
            (StatusCode::OK, Json(body))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct UpdateStopRequest {
    new_sl: f64,
}

async fn update_stoploss(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateStopRequest>,
) -> (StatusCode, Json<Value>) {
    let new_stop = match decimal_param("new_sl", request.new_sl) {
        Ok(stop) => stop,
        Err(response) => return response,
    };
    match state.engine.update_stop_loss(id, new_stop).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"message": format!("Stoploss updated to {} for trade {}", new_stop, id)})),
        ),
        Err(e) => error_response(e),
    }
}

fn default_percentage() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct ClosePositionRequest {
    #[serde(default = "default_percentage")]
    percentage: f64,
    current_price: f64,
}

async fn close_position(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ClosePositionRequest>,
) -> (StatusCode, Json<Value>) {
    let percentage = match decimal_param("percentage", request.percentage) {
        Ok(pct) => pct,
        Err(response) => return response,
    };
    let price = match decimal_param("current_price", request.current_price) {
        Ok(price) => price,
        Err(response) => return response,
    };
    match state.engine.close_position(id, percentage, price).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "status": status.as_str(),
                "message": format!("Closed {}% of position for trade {}", request.percentage * 100.0, id),
            })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CancelOrderRequest {
    symbol: String,
    #[serde(rename = "orderId")]
    order_id: String,
}

async fn cancel_order(
    State(state): State<AppState>,
    Json(request): Json<CancelOrderRequest>,
) -> (StatusCode, Json<Value>) {
    match state.engine.cancel_order(&request.symbol, &request.order_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"retCode": 0}))),
        Err(e) => error_response(e),
    }
}

async fn get_trade(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    match state.engine.get_trade(id).await {
        Ok(Some(trade)) => (StatusCode::OK, Json(trade_json(&trade))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Trade not found"})),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ListTradesQuery {
    bot_name: Option<String>,
    status: Option<String>,
}

async fn list_trades(
    State(state): State<AppState>,
    Query(query): Query<ListTradesQuery>,
) -> (StatusCode, Json<Value>) {
    let status = match query.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => match TradeStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("unknown status '{raw}'")})),
                )
            }
        },
    };
    let filter = TradeFilter {
        bot_name: query.bot_name.filter(|b| !b.is_empty()),
        status,
    };
    match state.engine.list_trades(&filter).await {
        Ok(trades) => {
            let views: Vec<Value> = trades.iter().map(trade_json).collect();
            (StatusCode::OK, Json(Value::Array(views)))
        }
        Err(e) => error_response(e),
    }
}
