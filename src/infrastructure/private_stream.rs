//! Bybit private order stream
//!
//! Long-lived websocket subscription to the authenticated `order` topic.
//! Parsed events are forwarded into an mpsc channel, so handling one batch
//! never blocks reading the next; the reconciler consumes the channel in
//! delivery order. The connection reconnects with capped exponential
//! backoff until the shutdown flag flips.

use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::domain::entities::order_event::{OrderEventStatus, OrderUpdateEvent, TriggerKind};

const BYBIT_PRIVATE_WS: &str = "wss://stream.bybit.com/v5/private";
const BYBIT_PRIVATE_WS_TESTNET: &str = "wss://stream-testnet.bybit.com/v5/private";
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct PrivateStreamConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<Vec<OrderPayload>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    order_id: String,
    symbol: String,
    order_status: String,
    #[serde(default)]
    stop_order_type: Option<String>,
}

/// Parse one websocket text frame into order events. Non-order frames
/// (pong, subscription acks) yield an empty batch; a failed auth ack is an
/// error.
fn parse_events(text: &str) -> Result<Vec<OrderUpdateEvent>, String> {
    let message: StreamMessage =
        serde_json::from_str(text).map_err(|e| format!("unparseable frame: {e}"))?;

    if message.op.as_deref() == Some("auth") && message.success == Some(false) {
        return Err("authentication rejected by exchange".to_string());
    }

    if message.topic.as_deref() != Some("order") {
        return Ok(Vec::new());
    }

    let events = message
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|payload| OrderUpdateEvent {
            order_id: payload.order_id,
            symbol: payload.symbol,
            status: OrderEventStatus::from_exchange(&payload.order_status),
            trigger: payload
                .stop_order_type
                .as_deref()
                .and_then(TriggerKind::from_stop_order_type),
        })
        .collect();
    Ok(events)
}

fn auth_signature(api_secret: &str, expires: i64) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| format!("hmac error: {e}"))?;
    mac.update(format!("GET/realtime{expires}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Spawn the stream task. Events flow into `events`; the task ends when the
/// shutdown flag flips or the event channel closes.
pub fn spawn(
    config: PrivateStreamConfig,
    events: mpsc::Sender<OrderUpdateEvent>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(config, events, shutdown))
}

async fn run(
    config: PrivateStreamConfig,
    events: mpsc::Sender<OrderUpdateEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected_at = Instant::now();
        match connect_and_stream(&config, &events, &mut shutdown).await {
            Ok(()) => break,
            Err(e) => {
                // A connection that held for a while earns a fresh backoff.
                if connected_at.elapsed() > Duration::from_secs(60) {
                    backoff = Duration::from_secs(1);
                }
                warn!(
                    "Private order stream disconnected: {}; reconnecting in {:?}",
                    e, backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    info!("Private order stream stopped");
}

async fn connect_and_stream(
    config: &PrivateStreamConfig,
    events: &mpsc::Sender<OrderUpdateEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), String> {
    let url = if config.testnet {
        BYBIT_PRIVATE_WS_TESTNET
    } else {
        BYBIT_PRIVATE_WS
    };

    let (mut ws, _) = connect_async(url).await.map_err(|e| e.to_string())?;
    info!("Private order stream connected to {}", url);

    // Authenticate, then subscribe to the order topic.
    let expires = Utc::now().timestamp_millis() + 10_000;
    let signature = auth_signature(&config.api_secret, expires)?;
    let auth = json!({"op": "auth", "args": [config.api_key, expires, signature]});
    ws.send(Message::Text(auth.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    let subscribe = json!({"op": "subscribe", "args": ["order"]});
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    let mut ping = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            }
            _ = ping.tick() => {
                let ping_frame = json!({"op": "ping"});
                ws.send(Message::Text(ping_frame.to_string()))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_events(&text)? {
                            debug!(
                                "Order event: {} {:?} (trigger {:?})",
                                event.order_id, event.status, event.trigger
                            );
                            if events.send(event).await.is_err() {
                                // Consumer is gone; nothing left to do.
                                let _ = ws.close(None).await;
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws.send(Message::Pong(payload)).await.map_err(|e| e.to_string())?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Err("stream closed by server".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order_batch() {
        let frame = r#"{
            "topic": "order",
            "data": [
                {"orderId": "o-1", "symbol": "BTCUSDT", "orderStatus": "Filled", "stopOrderType": ""},
                {"orderId": "o-2", "symbol": "BTCUSDT", "orderStatus": "Cancelled"},
                {"orderId": "o-3", "symbol": "ETHUSDT", "orderStatus": "Filled", "stopOrderType": "StopLoss"}
            ]
        }"#;
        let events = parse_events(frame).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].status, OrderEventStatus::Filled);
        assert_eq!(events[0].trigger, None);
        assert_eq!(events[1].status, OrderEventStatus::Cancelled);
        assert_eq!(events[2].trigger, Some(TriggerKind::StopLoss));
    }

    #[test]
    fn test_non_order_frames_yield_nothing() {
        assert!(parse_events(r#"{"op": "pong"}"#).unwrap().is_empty());
        assert!(parse_events(r#"{"op": "subscribe", "success": true}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rejected_auth_is_an_error() {
        let frame = r#"{"op": "auth", "success": false}"#;
        assert!(parse_events(frame).is_err());
    }

    #[test]
    fn test_auth_signature_shape() {
        let a = auth_signature("secret", 1700000000000).unwrap();
        let b = auth_signature("secret", 1700000000000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // different expiry, different signature
        assert_ne!(a, auth_signature("secret", 1700000000001).unwrap());
    }
}
