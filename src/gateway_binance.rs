// ===============================
// src/gateway_binance.rs
// ===============================
//
// Binance USDⓈ-M futures: REST for the Exchange contract, plus the user data
// stream (listenKey + WS) that reports realized PnL as Fills.
//
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::{
    sync::mpsc,
    time::{interval, sleep, Duration, MissedTickBehavior},
};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::{
    encode_params, fmt_decimal, num, parse_kline, sign_query, timestamp_ms, ApiErrorBody, BalanceEntry, ExchangeInfo,
    ListenKey, OrderResponse, PositionRisk, TickerPrice, WsEnvelope,
};
use crate::config::BinanceCfg;
use crate::domain::{Candle, Fill, OrderAck, OrderKind, OrderRequest, PositionInfo, SymbolSpec, Timeframe};
use crate::exchange::{Exchange, ExchangeError};
use crate::metrics::{BIN_LISTEN_KEEPALIVE, BIN_WS_CONNECTED, BIN_WS_RECONNECTS};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// listenKey lives 60 min; Binance asks for a keepalive well before that.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(30 * 60);

pub struct BinanceFutures {
    name: String,
    http: reqwest::Client,
    rest_base: String,
    ws_base: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
}

impl BinanceFutures {
    pub fn new(name: &str, cfg: &BinanceCfg) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            name: name.to_string(),
            http,
            rest_base: cfg.rest_url.trim_end_matches('/').to_string(),
            ws_base: cfg.ws_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            recv_window: cfg.recv_window,
        })
    }

    async fn read<T: DeserializeOwned>(rsp: reqwest::Response) -> Result<T, ExchangeError> {
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(api) => ExchangeError::Api { code: api.code, msg: api.msg },
                Err(_) => ExchangeError::Other(format!("http {status}: {body}")),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T, ExchangeError> {
        let mut url = format!("{}{}", self.rest_base, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&encode_params(params));
        }
        Self::read(self.http.get(url).send().await?).await
    }

    async fn signed<T: DeserializeOwned>(&self, method: Method, path: &str, mut params: Vec<(&str, String)>) -> Result<T, ExchangeError> {
        params.push(("recvWindow", self.recv_window.to_string()));
        params.push(("timestamp", timestamp_ms().to_string()));
        let query = encode_params(&params);
        let sig = sign_query(&self.api_secret, &query);
        let url = format!("{}{}?{}&signature={}", self.rest_base, path, query, sig);
        let rsp = self.http.request(method, url).header("X-MBX-APIKEY", &self.api_key).send().await?;
        Self::read(rsp).await
    }

    async fn listen_key<T: DeserializeOwned>(&self, method: Method) -> Result<T, ExchangeError> {
        let url = format!("{}/fapi/v1/listenKey", self.rest_base);
        let rsp = self.http.request(method, url).header("X-MBX-APIKEY", &self.api_key).send().await?;
        Self::read(rsp).await
    }

    /// Keep one user data stream open forever, forwarding realized-PnL trades.
    pub async fn run_user_stream(self: Arc<Self>, fill_tx: mpsc::Sender<Fill>) {
        let mut attempt: u32 = 0;
        loop {
            match self.listen_key::<ListenKey>(Method::POST).await {
                Ok(lk) => {
                    if self.stream_once(&lk.listen_key, &fill_tx).await {
                        attempt = 0;
                    }
                }
                Err(e) => error!(venue = %self.name, error = %e, "create listenKey failed"),
            }
            if fill_tx.is_closed() {
                info!(venue = %self.name, "fill consumer gone, user stream stopped");
                return;
            }
            BIN_WS_CONNECTED.with_label_values(&[&self.name]).set(0);
            BIN_WS_RECONNECTS.with_label_values(&[&self.name]).inc();

            // Exponential backoff + jitter
            attempt = attempt.saturating_add(1);
            let base_ms = 500u64.saturating_mul(1u64 << attempt.min(6));
            let jitter = rand::thread_rng().gen_range(0..=250);
            sleep(Duration::from_millis(base_ms + jitter)).await;
        }
    }

    /// Returns whether the socket was ever connected.
    async fn stream_once(&self, listen_key: &str, fill_tx: &mpsc::Sender<Fill>) -> bool {
        let ws_url = format!("{}/{}", self.ws_base, listen_key);
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, "bad userDataStream url");
                return false;
            }
        };
        let (mut ws, _) = match connect_async(url).await {
            Ok(c) => c,
            Err(e) => {
                error!(venue = %self.name, ?e, "connect userDataStream failed");
                return false;
            }
        };
        info!(venue = %self.name, "userDataStream connected");
        BIN_WS_CONNECTED.with_label_values(&[&self.name]).set(1);

        let mut keepalive = interval(KEEPALIVE_EVERY);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(m)) if m.is_text() => {
                        let txt = match m.into_text() {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(?e, "failed to read text frame");
                                continue;
                            }
                        };
                        let env = match serde_json::from_str::<WsEnvelope>(&txt) {
                            Ok(env) => env,
                            Err(e) => {
                                debug!(?e, "unparsed user stream event");
                                continue;
                            }
                        };
                        if env.is_listen_key_expired() {
                            warn!(venue = %self.name, "listenKey expired, renewing");
                            return true;
                        }
                        if let Some(fill) = env.into_fill() {
                            if fill_tx.send(fill).await.is_err() {
                                return true;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(venue = %self.name, ?e, "userDataStream ws error");
                        return true;
                    }
                    None => {
                        warn!(venue = %self.name, "userDataStream disconnected, reconnecting");
                        return true;
                    }
                },
                _ = keepalive.tick() => {
                    match self.listen_key::<serde_json::Value>(Method::PUT).await {
                        Ok(_) => BIN_LISTEN_KEEPALIVE.with_label_values(&[&self.name, "ok"]).inc(),
                        Err(e) => {
                            BIN_LISTEN_KEEPALIVE.with_label_values(&[&self.name, "err"]).inc();
                            warn!(venue = %self.name, error = %e, "listenKey keepalive failed");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Exchange for BinanceFutures {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_markets(&self) -> Result<Vec<SymbolSpec>, ExchangeError> {
        let info: ExchangeInfo = self.public("/fapi/v1/exchangeInfo", &[]).await?;
        Ok(info.symbols.into_iter().map(|s| s.into_spec()).collect())
    }

    async fn fetch_balance(&self, quote_asset: &str) -> Result<f64, ExchangeError> {
        let balances: Vec<BalanceEntry> = self.signed(Method::GET, "/fapi/v2/balance", vec![]).await?;
        match balances.into_iter().find(|b| b.asset.eq_ignore_ascii_case(quote_asset)) {
            Some(b) => num("availableBalance", &b.available_balance),
            None => Ok(0.0),
        }
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self.public("/fapi/v1/klines", &params).await?;
        rows.iter().map(|r| parse_kline(r)).collect()
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let t: TickerPrice = self.public("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())]).await?;
        if t.symbol != symbol {
            return Err(ExchangeError::Decode(format!("ticker for {} answered {}", symbol, t.symbol)));
        }
        num("price", &t.price)
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        let rows: Vec<PositionRisk> = self.signed(Method::GET, "/fapi/v2/positionRisk", vec![]).await?;
        rows.into_iter().map(PositionRisk::into_info).collect()
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let (price_p, qty_p) = precision_hint(req);
        let mut params = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.as_str().to_string()),
            ("type", req.kind.as_str().to_string()),
            ("quantity", fmt_decimal(req.quantity, qty_p)),
            ("newClientOrderId", req.client_id.clone()),
        ];
        if let (OrderKind::Limit, Some(px)) = (req.kind, req.price) {
            params.push(("price", fmt_decimal(px, price_p)));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = req.stop_price {
            params.push(("stopPrice", fmt_decimal(stop, price_p)));
        }
        if req.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let rsp: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;
        debug!(symbol = %rsp.symbol, order_id = rsp.order_id, kind = req.kind.as_str(), "order accepted");
        Ok(OrderAck { order_id: rsp.order_id.to_string(), client_id: rsp.client_order_id, symbol: rsp.symbol })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let _: serde_json::Value = self.signed(Method::DELETE, "/fapi/v1/order", params).await?;
        Ok(())
    }
}

/// Decimal places already applied upstream; count them back out of the value
/// so the wire text never carries float noise.
fn precision_hint(req: &OrderRequest) -> (u32, u32) {
    fn places(v: f64) -> u32 {
        (0..=8u32)
            .find(|p| {
                let x = v * 10f64.powi(*p as i32);
                (x - x.round()).abs() < 1e-6
            })
            .unwrap_or(8)
    }
    let price = req.price.or(req.stop_price).map(places).unwrap_or(2);
    (price, places(req.quantity))
}
