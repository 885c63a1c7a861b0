//! Bybit v5 REST client
//!
//! Concrete [`ExchangeGateway`] implementation for Bybit linear perpetuals.
//! Requests are signed with HMAC-SHA256 over
//! `timestamp + api_key + recv_window + payload`, hex-encoded, and carried
//! in the `X-BAPI-*` headers. A non-zero retCode maps to a typed error;
//! retCode 110017 (position is zero) has its own variant so callers can
//! treat an already-flat position as success.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;

use crate::domain::entities::trade::Side;
use crate::domain::repositories::exchange_gateway::{
    ExchangeGateway, GatewayError, GatewayResult, OpenOrderView, OrderKind, OrderReceipt,
    OrderRequest, PositionView,
};

const BYBIT_API_BASE: &str = "https://api.bybit.com";
const BYBIT_TESTNET_BASE: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";

/// Bybit's retCode for a reduce-only order against a flat position.
const RET_CODE_POSITION_ZERO: i64 = 110017;

type HmacSha256 = Hmac<Sha256>;

/// Bybit connection configuration
#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub api_base: String,
    pub api_key: String,
    pub api_secret: String,
}

impl BybitConfig {
    pub fn new(api_key: &str, api_secret: &str, testnet: bool) -> Self {
        Self {
            api_base: if testnet {
                BYBIT_TESTNET_BASE.to_string()
            } else {
                BYBIT_API_BASE.to_string()
            },
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }
}

/// Response envelope shared by all v5 endpoints.
#[derive(Debug, Deserialize)]
struct BybitEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

impl BybitEnvelope {
    fn into_result(self) -> GatewayResult<serde_json::Value> {
        match self.ret_code {
            0 => Ok(self.result),
            RET_CODE_POSITION_ZERO => Err(GatewayError::PositionAlreadyZero),
            code => Err(GatewayError::Rejected {
                code,
                message: self.ret_msg,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default)]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResult {
    order_id: String,
    #[serde(default)]
    avg_price: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionPayload {
    symbol: String,
    #[serde(default)]
    side: String,
    size: String,
    #[serde(default)]
    leverage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderPayload {
    order_id: String,
    symbol: String,
    side: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentPayload {
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
}

fn parse_decimal(value: &str) -> GatewayResult<Decimal> {
    value
        .parse()
        .map_err(|_| GatewayError::BadResponse(format!("invalid decimal '{value}'")))
}

fn map_request_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(error.to_string())
    }
}

/// Bybit v5 client
pub struct BybitClient {
    client: Client,
    config: BybitConfig,
}

impl BybitClient {
    /// Create a client with the bounded request timeout the engine expects
    /// of blocking gateway calls.
    pub fn new(config: BybitConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn sign(&self, timestamp: &str, payload: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        mac.update(
            format!("{timestamp}{}{RECV_WINDOW}{payload}", self.config.api_key).as_bytes(),
        );
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn get(&self, path: &str, query: &str) -> GatewayResult<serde_json::Value> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, query)?;
        let url = format!("{}{}?{}", self.config.api_base, path, query);

        let response = self
            .client
            .get(url)
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(map_request_error)?;

        let envelope: BybitEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;
        envelope.into_result()
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> GatewayResult<serde_json::Value> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let payload = body.to_string();
        let signature = self.sign(&timestamp, &payload)?;
        let url = format!("{}{}", self.config.api_base, path);

        let response = self
            .client
            .post(url)
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(map_request_error)?;

        let envelope: BybitEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;
        envelope.into_result()
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    fn name(&self) -> &str {
        "Bybit"
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderReceipt> {
        let order_type = match request.kind {
            OrderKind::Market => "Market",
            OrderKind::Limit => "Limit",
        };
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": order_type,
            "qty": request.quantity.to_string(),
            "timeInForce": "GTC",
            "positionIdx": request.position_idx,
            "reduceOnly": request.reduce_only,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(stop) = request.stop_loss {
            body["stopLoss"] = json!(stop.to_string());
        }

        let result = self.post("/v5/order/create", body).await?;
        let order: OrderResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;

        let avg_price = match order.avg_price.as_deref() {
            Some(value) if !value.is_empty() => Some(parse_decimal(value)?),
            _ => None,
        };
        Ok(OrderReceipt {
            order_id: order.order_id,
            avg_price,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.post("/v5/order/cancel", body).await?;
        Ok(())
    }

    async fn positions(&self, symbol: &str) -> GatewayResult<Vec<PositionView>> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self.get("/v5/position/list", &query).await?;
        let payload: ListResult<PositionPayload> = serde_json::from_value(result)
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;

        let mut positions = Vec::new();
        for row in payload.list {
            // One-way rows for a flat book come back with side "None".
            let Some(side) = Side::parse(&row.side) else {
                continue;
            };
            let size = parse_decimal(&row.size)?;
            let leverage = row
                .leverage
                .as_deref()
                .and_then(|l| l.parse::<f64>().ok())
                .map(|l| l as u32)
                .unwrap_or(1);
            positions.push(PositionView {
                symbol: row.symbol,
                side,
                size,
                leverage,
            });
        }
        Ok(positions)
    }

    async fn open_orders(&self, symbol: &str, side: Option<Side>) -> GatewayResult<Vec<OpenOrderView>> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self.get("/v5/order/realtime", &query).await?;
        let payload: ListResult<OpenOrderPayload> = serde_json::from_value(result)
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;

        let orders = payload
            .list
            .into_iter()
            .filter_map(|row| {
                let row_side = Side::parse(&row.side)?;
                if side.is_some() && side != Some(row_side) {
                    return None;
                }
                Some(OpenOrderView {
                    order_id: row.order_id,
                    symbol: row.symbol,
                    side: row_side,
                })
            })
            .collect();
        Ok(orders)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.post("/v5/position/set-leverage", body).await?;
        Ok(())
    }

    async fn set_stop_loss(&self, symbol: &str, side: Side, stop: Decimal) -> GatewayResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "stopLoss": stop.to_string(),
            "positionIdx": side.position_idx(),
        });
        self.post("/v5/position/trading-stop", body).await?;
        Ok(())
    }

    async fn instrument_step(&self, symbol: &str) -> GatewayResult<Decimal> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self.get("/v5/market/instruments-info", &query).await?;
        let payload: ListResult<InstrumentPayload> = serde_json::from_value(result)
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;

        let instrument = payload
            .list
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::BadResponse(format!("no instrument info for {symbol}")))?;
        parse_decimal(&instrument.lot_size_filter.qty_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_config_host_selection() {
        let testnet = BybitConfig::new("key", "secret", true);
        assert_eq!(testnet.api_base, BYBIT_TESTNET_BASE);
        let mainnet = BybitConfig::new("key", "secret", false);
        assert_eq!(mainnet.api_base, BYBIT_API_BASE);
    }

    #[test]
    fn test_envelope_ret_code_mapping() {
        let ok = BybitEnvelope {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            result: json!({"orderId": "abc"}),
        };
        assert!(ok.into_result().is_ok());

        let zero = BybitEnvelope {
            ret_code: RET_CODE_POSITION_ZERO,
            ret_msg: "position is zero".to_string(),
            result: serde_json::Value::Null,
        };
        assert!(matches!(
            zero.into_result(),
            Err(GatewayError::PositionAlreadyZero)
        ));

        let rejected = BybitEnvelope {
            ret_code: 10001,
            ret_msg: "params error".to_string(),
            result: serde_json::Value::Null,
        };
        assert!(matches!(
            rejected.into_result(),
            Err(GatewayError::Rejected { code: 10001, .. })
        ));
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("0.001").unwrap(), dec!(0.001));
        assert!(parse_decimal("not-a-number").is_err());
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let client = BybitClient::new(
            BybitConfig::new("key", "secret", true),
            Duration::from_secs(5),
        )
        .unwrap();
        let a = client.sign("1700000000000", "category=linear").unwrap();
        let b = client.sign("1700000000000", "category=linear").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_position_payload_parsing() {
        let value = json!({
            "list": [
                {"symbol": "BTCUSDT", "side": "Buy", "size": "0.006", "leverage": "5"},
                {"symbol": "BTCUSDT", "side": "None", "size": "0"}
            ]
        });
        let payload: ListResult<PositionPayload> = serde_json::from_value(value).unwrap();
        assert_eq!(payload.list.len(), 2);
        assert_eq!(payload.list[0].size, "0.006");
    }
}
