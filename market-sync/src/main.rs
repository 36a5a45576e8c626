//! Market Sync - service entry point
//!
//! Wires configuration, the order book tracker, the outbound throttler and the
//! optional user stream, and serves health and metrics endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use market_sync::data_source::{ChannelDataSource, DataSourceKind, OrderBookDataSource, RestSnapshotSource};
use market_sync::logging;
use market_sync::metrics;
use market_sync::orderbook::OrderBookReader;
use market_sync::throttler::AsyncThrottler;
use market_sync::tracker::OrderBookTracker;
use market_sync::user_stream::{
    AuthenticatedConnection, UserStreamDataSource, UserStreamTracker, WebSocketUserStream,
};
use market_sync::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    logging::init(config.log_format);

    info!(
        exchange = %config.exchange_name,
        trading_pairs = ?config.trading_pairs,
        data_source = ?config.data_source,
        "Starting market sync"
    );

    let throttler = AsyncThrottler::new(config.throttler_config())?;

    // The feed stays alive so an in-process adapter can be attached to it
    let (data_source, _feed) = match config.data_source {
        DataSourceKind::Channel => {
            let (source, feed) = ChannelDataSource::new();
            (OrderBookDataSource::Channel(source), Some(feed))
        }
        DataSourceKind::Rest => {
            let source = RestSnapshotSource::new(
                &config.rest_endpoint,
                throttler.clone(),
                Duration::from_millis(config.snapshot_poll_interval_ms),
            )?;
            (OrderBookDataSource::RestSnapshots(source), None)
        }
    };

    let mut tracker = OrderBookTracker::new(
        &config.exchange_name,
        data_source,
        config.trading_pairs.clone(),
        config.tracker_config(),
    );
    tracker.start().await;

    let mut user_stream = match &config.user_stream_url {
        Some(url) => {
            let mut connection = AuthenticatedConnection::new(url)?;
            if let Some(subscribe) = &config.user_stream_subscribe {
                connection = connection.with_subscribe_message(serde_json::from_str(subscribe)?);
            }
            let source = WebSocketUserStream::new(
                connection,
                Duration::from_millis(config.reconnect_delay_ms),
            );
            let mut user_stream =
                UserStreamTracker::new(&config.exchange_name, UserStreamDataSource::WebSocket(source));
            user_stream.start();
            Some(user_stream)
        }
        None => None,
    };

    let reader = tracker.reader();

    // Periodic book status logging
    let status_reader = reader.clone();
    tokio::spawn(async move {
        let mut status_interval = interval(Duration::from_secs(30));
        loop {
            status_interval.tick().await;
            for state in status_reader.states(0).await {
                if let Some(mid) = state.metrics.mid_price {
                    info!(
                        trading_pair = %state.trading_pair,
                        mid_price = %mid,
                        spread_bps = ?state.metrics.spread_bps,
                        imbalance = ?state.metrics.imbalance,
                        last_update_id = state.last_update_id,
                        "Order book status"
                    );
                }
            }
        }
    });

    let mut advisories = tracker.advisories().subscribe();
    tokio::spawn(async move {
        while let Ok(advisory) = advisories.recv().await {
            warn!(
                component = advisory.component,
                advisory = %advisory.message,
                "Advisory"
            );
        }
    });

    // Start health check server
    let health_port = config.health_port;
    let server = tokio::spawn(async move {
        if let Err(e) = start_health_server(reader, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    throttler.stop();
    if let Some(user_stream) = user_stream.as_mut() {
        user_stream.stop();
    }
    tracker.stop().await;
    server.abort();

    Ok(())
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(reader: OrderBookReader, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(reader);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(reader): State<OrderBookReader>) -> Json<serde_json::Value> {
    let books: Vec<serde_json::Value> = reader
        .states(0)
        .await
        .into_iter()
        .map(|state| {
            serde_json::json!({
                "trading_pair": state.trading_pair,
                "healthy": state.metrics.is_healthy(),
                "last_update_id": state.last_update_id,
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "healthy",
        "component": "market-sync",
        "order_books": books,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn render_metrics() -> Result<String, StatusCode> {
    metrics::global().render().map_err(|e| {
        warn!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
