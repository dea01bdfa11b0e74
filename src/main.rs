// ===============================
// src/main.rs
// ===============================
/*
 # paper run, satu cycle saja
 MODE=mock cargo run -- --once

 # metrics
 curl -s localhost:9898/metrics | egrep '^(config_mode|config_symbol|decisions_total|orders_total)'
 curl -s localhost:9898/metrics | grep '^daily_loss'
*/
/*
=============================================================================
Project : mtf_bot_rust — multi-timeframe signal fusion futures bot in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Scores thirteen indicators per timeframe, trades only when 1m..4h
          agree, sizes by ATR, brackets every entry, halts on daily loss,
          exposes Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod resilience;
mod exchange;
mod venue;
mod indicators;
mod snapshot;
mod signals;
mod adjust;
mod engine;
mod risk;
mod execution;
mod monitor;
mod control;
mod gateway;          // paper venue (MODE=mock)
mod binance;          // helper (signer/types) for Binance futures
mod gateway_binance;  // real Binance USDT-M futures (REST + user data stream)

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::adjust::Adjuster;
use crate::config::{Cli, MarketMode};
use crate::control::Controller;
use crate::domain::Fill;
use crate::engine::Aggregator;
use crate::exchange::Exchange;
use crate::execution::{Bracket, Executor};
use crate::monitor::Monitor;
use crate::risk::RiskGovernor;
use crate::snapshot::SnapshotProvider;
use crate::venue::{Venue, MARKETS_BACKOFF};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config & limits ----
    let (args, limits) = match config::load(cli.env_file.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        mode = args.mode.as_str(),
        symbols = ?args.symbols,
        quote = %args.quote_asset,
        max_open = limits.max_open_positions,
        daily_loss_limit = limits.daily_loss_limit,
        threshold = limits.base_threshold,
        binance_rest = %args.binance.rest_url,
        "startup config"
    );
    metrics::CONFIG_MODE.with_label_values(&[args.mode.as_str()]).set(1);
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    // ---- Recorder (optional) ----
    let (journal, recorder_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, handle) = recorder::spawn(path);
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    // ---- Exchange ----
    let (fill_tx, fill_rx) = mpsc::channel::<Fill>(1024);
    let exchange: Arc<dyn Exchange> = match args.mode {
        MarketMode::Mock => {
            let paper = gateway::PaperExchange::new(&args.symbols, &args.quote_asset, args.paper_balance);
            Arc::new(paper.with_fills(fill_tx))
        }
        MarketMode::BinanceTestnet | MarketMode::BinanceMainnet => {
            let live = match gateway_binance::BinanceFutures::new(args.mode.as_str(), &args.binance) {
                Ok(g) => Arc::new(g),
                Err(e) => {
                    error!(error = %e, "binance client init failed");
                    process::exit(1);
                }
            };
            tokio::spawn(live.clone().run_user_stream(fill_tx));
            live
        }
    };

    let venue = Arc::new(Venue::new(exchange, &args.quote_asset, args.symbols.clone(), &args.resilience));
    if let Err(e) = venue.load_markets(&MARKETS_BACKOFF).await {
        error!(error = %e, "market rules unavailable, giving up");
        process::exit(1);
    }

    // ---- Risk & monitor ----
    let risk = Arc::new(RiskGovernor::new(limits.daily_loss_limit));
    let (bracket_tx, bracket_rx) = mpsc::channel::<Bracket>(256);
    let mut mon = Monitor::new(venue.clone(), risk.clone(), limits.sizing.trail_fraction);
    if let Some(tx) = &journal {
        mon = mon.with_journal(tx.clone());
    }
    let monitor_task = tokio::spawn(monitor::run(mon, bracket_rx, fill_rx, args.pacing.monitor));

    // ---- Decision + execution ----
    let adjuster = Adjuster::default();
    let mut executor = Executor::new(venue.clone(), adjuster.clone(), limits.sizing).with_monitor(bracket_tx);
    if let Some(tx) = &journal {
        executor = executor.with_journal(tx.clone());
    }

    let ctl = Controller {
        provider: SnapshotProvider::new(venue.clone(), args.cache_ttl),
        aggregator: Aggregator::new(limits.base_weights, limits.base_threshold, adjuster),
        executor,
        venue,
        risk,
        max_open_positions: limits.max_open_positions,
        sizing_timeframe: limits.sizing_timeframe,
        pacing: args.pacing,
        journal,
    };

    control::run(&ctl, cli.once).await;
    info!("control loop finished");

    // release every journal sender so the recorder drains and flushes
    drop(ctl);
    monitor_task.abort();
    let _ = monitor_task.await;
    if let Some(handle) = recorder_task {
        if let Err(e) = handle.await {
            error!(?e, "recorder task failed");
        }
    }
}
