// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Control loop --------
pub static CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cycles_total", "control loop cycles completed").unwrap());

pub static CYCLE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cycle_errors_total", "failed cycles by error class"),
        &["class"],
    )
    .unwrap()
});

pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("decisions_total", "multi-timeframe decisions (label: decision)"),
        &["decision"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders submitted (labels: leg, status)"),
        &["leg", "status"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fills_total", "realized-PnL fills received").unwrap());

// -------- Exchange access --------
pub static API_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("api_calls_total", "guarded exchange calls (labels: op, outcome)"),
        &["op", "outcome"],
    )
    .unwrap()
});

pub static BREAKER_COOLDOWNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("breaker_cooldowns_total", "circuit breaker cooldowns served"),
        &["op"],
    )
    .unwrap()
});

pub static CACHE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshot_cache_total", "snapshot cache lookups (label: result)"),
        &["result"],
    )
    .unwrap()
});

// -------- Account & risk --------
pub static DAILY_LOSS: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("daily_loss", "realized loss accumulated today").unwrap());

pub static BALANCE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("balance_available", "available quote balance").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "non-flat positions on the venue").unwrap());

// -------- Binance user-data stream health (used by gateway_binance) --------
pub static BIN_WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "binance_ws_connected",
            "1 if WS userDataStream connected, 0 otherwise",
        ),
        &["venue"],
    )
    .unwrap()
});

pub static BIN_WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "binance_ws_reconnects_total",
            "Number of reconnects to userDataStream WS",
        ),
        &["venue"],
    )
    .unwrap()
});

pub static BIN_LISTEN_KEEPALIVE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "binance_listenkey_keepalive_total",
            "listenKey keepalive calls (labels: venue, outcome)",
        ),
        &["venue", "outcome"],
    )
    .unwrap()
});

// ---- Config visibility (mode / symbols) ----
pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_mode", "venue mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "allowlisted symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(CYCLE_ERRORS.clone())),
        REGISTRY.register(Box::new(DECISIONS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(API_CALLS.clone())),
        REGISTRY.register(Box::new(BREAKER_COOLDOWNS.clone())),
        REGISTRY.register(Box::new(CACHE.clone())),
        REGISTRY.register(Box::new(DAILY_LOSS.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        // Binance WS health
        REGISTRY.register(Box::new(BIN_WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(BIN_WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(BIN_LISTEN_KEEPALIVE.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// One request per connection, headers are not parsed
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}
