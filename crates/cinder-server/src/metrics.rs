//! Prometheus metrics and the health-check HTTP endpoint.
//!
//! Installs a prometheus recorder and serves `/metrics` and `/health` on
//! a small hand-rolled hyper HTTP/1 server, separate from the RESP
//! listener. The hot path records per-command counters and latency
//! histograms through the `metrics` facade; a background poller
//! broadcasts a stats request to all shards and publishes keyspace
//! gauges. The engine itself carries no metrics dependency.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cinder_core::{Engine, ShardRequest, ShardResponse};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::ServerContext;

/// Histogram buckets tuned for in-memory command latency (10µs–100ms).
const HISTOGRAM_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.002_5, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Installs the prometheus recorder without starting an HTTP server.
///
/// Returns a handle that renders metrics on demand; the caller spawns
/// the HTTP server and the upkeep task via [`spawn_http_server`].
pub fn install_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .set_buckets(HISTOGRAM_BUCKETS)
        .map_err(|e| format!("failed to set histogram buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))?;
    Ok(handle)
}

/// Spawns the HTTP server for `/metrics` and `/health`, plus the
/// periodic prometheus upkeep task the recorder needs.
pub fn spawn_http_server(addr: SocketAddr, handle: PrometheusHandle) {
    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            upkeep_handle.run_upkeep();
        }
    });

    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("failed to bind metrics endpoint on {addr}: {e}");
                return;
            }
        };

        info!("metrics and health endpoint on http://{addr}");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("metrics listener accept error: {e}");
                    continue;
                }
            };

            let handle = handle.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handle = handle.clone();
                    async move { handle_request(req, &handle) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    // scraper gone mid-request; not worth a warn
                    tracing::debug!("metrics http connection error: {e}");
                }
            });
        }
    });
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    handle: &PrometheusHandle,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => Response::builder()
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(handle.render())))
            .expect("static builder never fails"),
        "/health" => Response::builder()
            .body(Full::new(Bytes::from_static(b"OK")))
            .expect("static builder never fails"),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("static builder never fails"),
    };
    Ok(response)
}

/// Spawns a background task that polls shard stats and publishes them as
/// prometheus gauges. Pull-based so the keyspace stays metrics-free.
pub fn spawn_stats_poller(engine: Engine, ctx: Arc<ServerContext>, poll_interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match engine.broadcast(|| ShardRequest::Stats).await {
                Ok(responses) => {
                    let (mut keys, mut with_expiry, mut expired) = (0usize, 0usize, 0u64);
                    for resp in &responses {
                        if let ShardResponse::Stats(stats) = resp {
                            keys += stats.key_count;
                            with_expiry += stats.keys_with_expiry;
                            expired += stats.keys_expired;
                        }
                    }

                    gauge!("cinder_keys_total").set(keys as f64);
                    gauge!("cinder_keys_with_expiry").set(with_expiry as f64);
                    gauge!("cinder_expired_keys_total").set(expired as f64);
                    gauge!("cinder_uptime_seconds")
                        .set(ctx.start_time.elapsed().as_secs_f64());
                }
                Err(e) => warn!("stats poller broadcast failed: {e}"),
            }
        }
    });
}

/// Records one command execution. Called from the session loop after
/// each command completes.
#[inline]
pub fn record_command(name: &str, duration: Duration, is_error: bool) {
    let labels = [("command", name.to_owned())];
    counter!("cinder_commands_total", &labels).increment(1);
    histogram!("cinder_command_duration_seconds", &labels).record(duration.as_secs_f64());
    if is_error {
        counter!("cinder_commands_errors_total", &labels).increment(1);
    }
}

/// Increments the active-connection gauge and the accepted counter.
#[inline]
pub fn on_connection_accepted() {
    gauge!("cinder_connections_active").increment(1.0);
    counter!("cinder_connections_total").increment(1);
}

/// Decrements the active-connection gauge.
#[inline]
pub fn on_connection_closed() {
    gauge!("cinder_connections_active").decrement(1.0);
}

/// Records a connection closed at the `max_clients` cap.
#[inline]
pub fn on_connection_rejected() {
    counter!("cinder_connections_rejected_total").increment(1);
}
