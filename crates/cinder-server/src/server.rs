//! TCP server: accept loop, connection limits, graceful shutdown.
//!
//! Each accepted connection gets a cheap clone of the engine handle and
//! runs as its own task. A process-wide atomic counts active connections
//! for the `limits.max_clients` cap; at the cap, new accepts are closed
//! immediately after a log line, with no reply. Shutdown stops accepting,
//! lets sessions finish their in-flight batch, and drains up to a
//! bounded deadline before returning.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_core::{Clock, Engine, EngineConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{normalize_addr, Config};
use crate::{connection, metrics};

/// How long shutdown waits for in-flight connections before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-process state shared by sessions, INFO, and the metrics side.
/// Immutable after startup apart from the connection counters.
#[derive(Debug)]
pub struct ServerContext {
    pub version: &'static str,
    pub start_time: Instant,
    /// `None` disables the auth gate.
    pub auth_password: Option<String>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_pipeline: usize,
    pub max_clients: usize,
    pub shard_count: usize,
    pub connections_active: AtomicUsize,
    pub connections_accepted: AtomicU64,
}

/// A bound server, ready to run its accept loop.
pub struct Server {
    listener: TcpListener,
    engine: Engine,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Spawns the sharded engine and binds the listen socket.
    pub async fn bind(config: &Config, clock: Clock) -> std::io::Result<Server> {
        let engine = Engine::new(EngineConfig {
            shards: config.server.shards,
            active_expiry: config.active_expiry(),
            clock,
        });

        let addr = normalize_addr(&config.server.listen_addr);
        let listener = TcpListener::bind(&addr).await?;

        let ctx = Arc::new(ServerContext {
            version: env!("CARGO_PKG_VERSION"),
            start_time: Instant::now(),
            auth_password: config.auth_password(),
            read_timeout: config.server.read_timeout,
            write_timeout: config.server.write_timeout,
            max_pipeline: config.limits.max_pipeline,
            max_clients: config.limits.max_clients,
            shard_count: engine.shard_count(),
            connections_active: AtomicUsize::new(0),
            connections_accepted: AtomicU64::new(0),
        });

        info!(
            addr = %listener.local_addr()?,
            shards = engine.shard_count(),
            auth = ctx.auth_password.is_some(),
            "server listening"
        );

        Ok(Server {
            listener,
            engine,
            ctx,
        })
    }

    /// The bound address - useful when the config asked for port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A clone of the engine handle, for the stats poller and tests.
    pub fn engine(&self) -> Engine {
        self.engine.clone()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Runs the accept loop until `shutdown` flips, then drains.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let Server {
            listener,
            engine,
            ctx,
        } = self;

        let mut accept_shutdown = shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if ctx.connections_active.load(Ordering::Relaxed) >= ctx.max_clients {
                                warn!(%peer, "connection limit reached, closing new connection");
                                metrics::on_connection_rejected();
                                continue;
                            }

                            ctx.connections_active.fetch_add(1, Ordering::Relaxed);
                            ctx.connections_accepted.fetch_add(1, Ordering::Relaxed);
                            metrics::on_connection_accepted();
                            let _ = stream.set_nodelay(true);

                            let engine = engine.clone();
                            let ctx = Arc::clone(&ctx);
                            let conn_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    connection::handle(stream, engine, Arc::clone(&ctx), conn_shutdown).await
                                {
                                    debug!(%peer, "connection error: {e}");
                                }
                                ctx.connections_active.fetch_sub(1, Ordering::Relaxed);
                                metrics::on_connection_closed();
                            });
                        }
                        Err(e) => error!("failed to accept connection: {e}"),
                    }
                }
                _ = accept_shutdown.changed() => {
                    info!("shutdown: no longer accepting connections");
                    break;
                }
            }
        }

        // drain: sessions observe the same shutdown signal and close once
        // their in-flight batch completes
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let active = ctx.connections_active.load(Ordering::Relaxed);
            if active == 0 {
                info!("all connections closed");
                break;
            }
            if Instant::now() >= deadline {
                warn!(active, "drain deadline reached, forcing shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".into();
        config.server.shards = 2;
        config
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let server = Server::bind(&test_config(), Clock::system()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.context().shard_count, 2);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_signal() {
        let server = Server::bind(&test_config(), Clock::system()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run should return promptly after shutdown")
            .unwrap();
    }
}
