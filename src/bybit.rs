use hex::encode;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

use crate::strategy::config::{ExchangeCredentials, ServiceConfig};
use crate::strategy::errors::ExchangeError;
use crate::strategy::execution_backend::ExchangeBackend;
use crate::strategy::symbol_meta::{parse_instruments, SymbolMeta};
use crate::strategy::types::{
    LimitOrderRequest, MarginMode, MarketOrderRequest, OpenOrder, PositionInfo,
};

type HmacSha256 = Hmac<Sha256>;

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";
const INSTRUMENTS_PAGE_LIMIT: &str = "1000";
/// "leverage not modified"
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Signed REST client for Bybit v5 linear perpetuals.
pub struct BybitClient {
    client: Client,
    base_url: String,
    credentials: Option<ExchangeCredentials>,
    recv_window: String,
    // server_time - local_time, in milliseconds
    time_offset_ms: AtomicI64,
}

impl BybitClient {
    pub fn new(base_url: impl Into<String>, credentials: Option<ExchangeCredentials>, recv_window_ms: u64) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            recv_window: recv_window_ms.to_string(),
            time_offset_ms: AtomicI64::new(0),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.base_url.clone(), config.credentials.clone(), config.recv_window_ms)
    }

    /// Measure the offset to Bybit server time and apply it to every
    /// following request timestamp.
    pub async fn sync_server_time(&self) -> Result<i64, ExchangeError> {
        let before = chrono::Utc::now().timestamp_millis();
        let response = self.public_get("/v5/market/time", &[]).await?;
        let after = chrono::Utc::now().timestamp_millis();

        let server_time = parse_server_time(&response)
            .ok_or_else(|| ExchangeError::decode("market/time: missing timeNano/timeSecond"))?;

        let local = (before + after) / 2;
        let offset = server_time - local;
        self.time_offset_ms.store(offset, Ordering::Relaxed);

        info!(offset_ms = offset, server_time, "[BYBIT] Time synchronized");
        Ok(offset)
    }

    fn timestamp(&self) -> String {
        (chrono::Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)).to_string()
    }

    fn credentials(&self) -> Result<&ExchangeCredentials, ExchangeError> {
        self.credentials.as_ref().ok_or(ExchangeError::MissingCredentials)
    }

    async fn read_envelope(response: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let text = response.text().await?;
        debug!(%status, body = %text, "[BYBIT] Response");

        if text.is_empty() {
            return Err(ExchangeError::decode(format!("empty response (HTTP {})", status)));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn public_get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ExchangeError> {
        let query = query_string(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!(%url, "[BYBIT] GET");

        let response = self.client.get(&url).send().await?;
        check_ret_code(Self::read_envelope(response).await?)
    }

    async fn signed_get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ExchangeError> {
        let creds = self.credentials()?;
        let query = query_string(params);
        let timestamp = self.timestamp();
        let signature = sign(&creds.api_secret, &timestamp, &creds.api_key, &self.recv_window, &query);

        let url = format!("{}{}?{}", self.base_url, path, query);
        debug!(%url, "[BYBIT] GET (signed)");

        let response = self
            .client
            .get(&url)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", &self.recv_window)
            .send()
            .await?;
        check_ret_code(Self::read_envelope(response).await?)
    }

    /// Signed POST returning the raw envelope; callers decide how to treat `retCode`.
    async fn signed_post_raw(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        let creds = self.credentials()?;
        // The exact bytes signed are the bytes sent.
        let body = serde_json::to_string(body)?;
        let timestamp = self.timestamp();
        let signature = sign(&creds.api_secret, &timestamp, &creds.api_key, &self.recv_window, &body);

        let url = format!("{}{}", self.base_url, path);
        debug!(%url, %body, "[BYBIT] POST");

        let response = self
            .client
            .post(&url)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", &self.recv_window)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        Self::read_envelope(response).await
    }

    async fn signed_post(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        check_ret_code(self.signed_post_raw(path, body).await?)
    }

    async fn create_order(&self, body: Value) -> Result<String, ExchangeError> {
        let response = self.signed_post("/v5/order/create", &body).await?;
        response
            .get("result")
            .and_then(|r| r.get("orderId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::decode("order/create: missing result.orderId"))
    }
}

#[async_trait::async_trait]
impl ExchangeBackend for BybitClient {
    async fn get_instrument_meta(&self) -> Result<HashMap<String, SymbolMeta>, ExchangeError> {
        let mut all = HashMap::new();
        let mut cursor = String::new();

        loop {
            let mut params = vec![("category", CATEGORY), ("limit", INSTRUMENTS_PAGE_LIMIT)];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }
            let response = self.public_get("/v5/market/instruments-info", &params).await?;
            all.extend(parse_instruments(&response)?);

            let next = response
                .get("result")
                .and_then(|r| r.get("nextPageCursor"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next.to_string();
        }

        info!(symbols = all.len(), "[BYBIT] Instrument metadata loaded");
        Ok(all)
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let response = self
            .signed_get("/v5/account/wallet-balance", &[("accountType", "UNIFIED")])
            .await?;
        parse_wallet_balance(&response, SETTLE_COIN)
    }

    async fn set_leverage_and_mode(
        &self,
        symbol: &str,
        buy_leverage: u32,
        sell_leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<bool, ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": buy_leverage.to_string(),
            "sellLeverage": sell_leverage.to_string(),
            "marginMode": margin_mode.as_str(),
        });
        let response = self.signed_post_raw("/v5/position/set-leverage", &body).await?;

        match ret_code(&response) {
            Some(0) | Some(RET_LEVERAGE_NOT_MODIFIED) => Ok(true),
            code => {
                warn!(symbol, ?code, msg = %ret_msg(&response), "[BYBIT] set-leverage refused");
                Ok(false)
            }
        }
    }

    async fn get_position(&self, symbol: &str, position_idx: u8) -> Result<PositionInfo, ExchangeError> {
        let response = self
            .signed_get("/v5/position/list", &[("category", CATEGORY), ("symbol", symbol)])
            .await?;
        parse_position(&response, position_idx)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let response = self
            .public_get("/v5/market/tickers", &[("category", CATEGORY), ("symbol", symbol)])
            .await?;
        parse_last_price(&response)
    }

    async fn submit_market_order(&self, order: MarketOrderRequest) -> Result<String, ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "orderType": "Market",
            "qty": order.qty,
            "positionIdx": order.position_idx,
            "reduceOnly": order.reduce_only,
            "orderLinkId": order.order_link_id,
        });
        let order_id = self.create_order(body).await?;
        info!(symbol = %order.symbol, side = order.side.as_str(), qty = %order.qty, %order_id, "[BYBIT] Market order accepted");
        Ok(order_id)
    }

    async fn submit_limit_order(&self, order: LimitOrderRequest) -> Result<String, ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "orderType": "Limit",
            "qty": order.qty,
            "price": order.price,
            "timeInForce": "GTC",
            "positionIdx": order.position_idx,
            "reduceOnly": order.reduce_only,
            "orderLinkId": order.order_link_id,
        });
        let order_id = self.create_order(body).await?;
        info!(symbol = %order.symbol, side = order.side.as_str(), price = %order.price, %order_id, "[BYBIT] Limit order accepted");
        Ok(order_id)
    }

    async fn set_native_stop(
        &self,
        symbol: &str,
        position_idx: u8,
        take_profit: Option<String>,
        stop_loss: Option<String>,
    ) -> Result<(), ExchangeError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "positionIdx": position_idx,
        });
        if let Some(tp) = take_profit {
            body["takeProfit"] = Value::String(tp);
        }
        if let Some(sl) = stop_loss {
            body["stopLoss"] = Value::String(sl);
        }
        self.signed_post("/v5/position/trading-stop", &body).await?;
        Ok(())
    }

    async fn clear_native_stop(&self, symbol: &str, position_idx: u8) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "positionIdx": position_idx,
            "takeProfit": "",
            "stopLoss": "",
        });
        self.signed_post("/v5/position/trading-stop", &body).await?;
        Ok(())
    }

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let response = self
            .signed_get("/v5/order/realtime", &[("category", CATEGORY), ("symbol", symbol)])
            .await?;
        parse_open_orders(&response)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.signed_post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "Bybit"
    }
}

/// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex encoded.
/// `payload` is the sorted query string for GET and the JSON body for POST.
pub fn sign(secret: &str, timestamp: &str, api_key: &str, recv_window: &str, payload: &str) -> String {
    let message = format!("{}{}{}{}", timestamp, api_key, recv_window, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    encode(mac.finalize().into_bytes())
}

/// `k=v` pairs joined with `&`, sorted by key.
pub fn query_string(params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn ret_code(response: &Value) -> Option<i64> {
    response.get("retCode").and_then(|v| v.as_i64())
}

fn ret_msg(response: &Value) -> String {
    response
        .get("retMsg")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string()
}

fn check_ret_code(response: Value) -> Result<Value, ExchangeError> {
    match ret_code(&response) {
        Some(0) => Ok(response),
        Some(code) => Err(ExchangeError::Api {
            code,
            message: ret_msg(&response),
        }),
        None => Err(ExchangeError::decode("missing retCode")),
    }
}

fn str_f64(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
}

fn result_list(response: &Value) -> Option<&Vec<Value>> {
    response
        .get("result")
        .and_then(|r| r.get("list"))
        .and_then(|l| l.as_array())
}

fn parse_server_time(response: &Value) -> Option<i64> {
    let result = response.get("result")?;
    result
        .get("timeNano")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
        .map(|nano| nano / 1_000_000)
        .or_else(|| {
            result
                .get("timeSecond")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<i64>().ok())
                .map(|sec| sec * 1000)
        })
}

fn parse_wallet_balance(response: &Value, coin: &str) -> Result<f64, ExchangeError> {
    let coins = result_list(response)
        .and_then(|l| l.first())
        .and_then(|account| account.get("coin"))
        .and_then(|c| c.as_array())
        .ok_or_else(|| ExchangeError::decode("wallet-balance: missing result.list[0].coin"))?;

    // An account that never held the coin has no entry for it.
    Ok(coins
        .iter()
        .find(|c| c.get("coin").and_then(|v| v.as_str()) == Some(coin))
        .and_then(|c| str_f64(c.get("walletBalance")))
        .unwrap_or(0.0))
}

fn parse_position(response: &Value, position_idx: u8) -> Result<PositionInfo, ExchangeError> {
    let list = result_list(response).ok_or_else(|| ExchangeError::decode("position/list: missing result.list"))?;

    let Some(entry) = list
        .iter()
        .find(|p| p.get("positionIdx").and_then(|v| v.as_u64()) == Some(position_idx as u64))
    else {
        return Ok(PositionInfo::default());
    };

    Ok(PositionInfo {
        size: str_f64(entry.get("size")).unwrap_or(0.0),
        avg_price: str_f64(entry.get("avgPrice")).filter(|p| *p > 0.0),
        mark_price: str_f64(entry.get("markPrice")).filter(|p| *p > 0.0),
    })
}

fn parse_last_price(response: &Value) -> Result<f64, ExchangeError> {
    result_list(response)
        .and_then(|l| l.first())
        .and_then(|t| str_f64(t.get("lastPrice")))
        .ok_or_else(|| ExchangeError::decode("tickers: missing lastPrice"))
}

fn parse_open_orders(response: &Value) -> Result<Vec<OpenOrder>, ExchangeError> {
    let list = result_list(response).ok_or_else(|| ExchangeError::decode("order/realtime: missing result.list"))?;
    Ok(list
        .iter()
        .filter_map(|o| {
            Some(OpenOrder {
                order_id: o.get("orderId")?.as_str()?.to_string(),
                order_link_id: o
                    .get("orderLinkId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_known_vector() {
        let query = query_string(&[("symbol", "BTCUSDT"), ("category", "linear")]);
        assert_eq!(query, "category=linear&symbol=BTCUSDT");

        let sig = sign("secret", "1700000000000", "key", "5000", &query);
        assert_eq!(sig, "3906b813750309cce9879a975510651953382a28592d69104d0b599e3d201f40");
    }

    #[test]
    fn test_check_ret_code() {
        assert!(check_ret_code(json!({"retCode": 0, "result": {}})).is_ok());

        match check_ret_code(json!({"retCode": 10001, "retMsg": "params error"})) {
            Err(ExchangeError::Api { code, message }) => {
                assert_eq!(code, 10001);
                assert_eq!(message, "params error");
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(check_ret_code(json!({})), Err(ExchangeError::Decode(_))));
    }

    #[test]
    fn test_parse_server_time() {
        let nano = json!({"retCode": 0, "result": {"timeSecond": "1700000000", "timeNano": "1700000000123456789"}});
        assert_eq!(parse_server_time(&nano), Some(1_700_000_000_123));

        let secs = json!({"retCode": 0, "result": {"timeSecond": "1700000000"}});
        assert_eq!(parse_server_time(&secs), Some(1_700_000_000_000));
    }

    #[test]
    fn test_parse_wallet_balance() {
        let response = json!({
            "retCode": 0,
            "result": {"list": [{"coin": [
                {"coin": "BTC", "walletBalance": "0.5"},
                {"coin": "USDT", "walletBalance": "1234.56", "equity": "1300"}
            ]}]}
        });
        assert_eq!(parse_wallet_balance(&response, "USDT").unwrap(), 1234.56);
        assert_eq!(parse_wallet_balance(&response, "ETH").unwrap(), 0.0);
    }

    #[test]
    fn test_parse_position_picks_slot() {
        let response = json!({
            "retCode": 0,
            "result": {"list": [
                {"positionIdx": 1, "size": "0.01", "avgPrice": "50000", "markPrice": "50100"},
                {"positionIdx": 2, "size": "0", "avgPrice": "0", "markPrice": "50100"}
            ]}
        });

        let long = parse_position(&response, 1).unwrap();
        assert_eq!(long.size, 0.01);
        assert_eq!(long.avg_price, Some(50000.0));
        assert_eq!(long.mark_price, Some(50100.0));

        let short = parse_position(&response, 2).unwrap();
        assert_eq!(short.size, 0.0);
        assert_eq!(short.avg_price, None);

        let empty = json!({"retCode": 0, "result": {"list": []}});
        assert_eq!(parse_position(&empty, 1).unwrap().size, 0.0);
    }

    #[test]
    fn test_parse_last_price_and_orders() {
        let tickers = json!({"retCode": 0, "result": {"list": [{"symbol": "BTCUSDT", "lastPrice": "64000.5"}]}});
        assert_eq!(parse_last_price(&tickers).unwrap(), 64000.5);

        let orders = json!({"retCode": 0, "result": {"list": [
            {"orderId": "1", "orderLinkId": "tp_abc"},
            {"orderId": "2"}
        ]}});
        let parsed = parse_open_orders(&orders).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].order_link_id, "tp_abc");
        assert_eq!(parsed[1].order_link_id, "");
    }

    #[tokio::test]
    async fn test_private_call_without_credentials() {
        let client = BybitClient::new("http://127.0.0.1:9", None, 5000);
        assert!(matches!(client.get_balance().await, Err(ExchangeError::MissingCredentials)));
    }
}
