//! Per-connection session loop.
//!
//! Reads bytes into a buffer, decodes as many complete commands as the
//! pipeline cap allows, executes them in order, and batches the replies
//! into a single write - so pipelined clients always see replies in
//! submission order. Read and write deadlines, the auth gate, QUIT, and
//! fatal protocol errors all live here; everything data-shaped is
//! delegated to [`crate::command`].

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use cinder_core::Engine;
use cinder_protocol::{parse_command, Command, Reply};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::command;
use crate::metrics;
use crate::server::ServerContext;

/// Initial read buffer capacity. 4KB covers most commands comfortably
/// without over-allocating for simple PING/SET/GET workloads.
const BUF_CAPACITY: usize = 4096;

/// Maximum read buffer size before we disconnect the client. Bounds the
/// memory one slow or malicious client can pin with incomplete frames.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Drives a single client connection to completion.
///
/// Exits on client disconnect, an elapsed deadline, QUIT, a fatal
/// protocol error, or the server shutdown signal.
pub async fn handle(
    mut stream: TcpStream,
    engine: Engine,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);
    let mut authenticated = ctx.auth_password.is_none();

    loop {
        // drain as many buffered commands as the pipeline cap allows,
        // batching all replies into one write
        out.clear();
        let mut processed = 0;
        while processed < ctx.max_pipeline {
            match parse_command(&buf) {
                Ok(Some((cmd, consumed))) => {
                    let _ = buf.split_to(consumed);
                    processed += 1;

                    let started = Instant::now();
                    let (reply, close) =
                        run_command(&cmd, &engine, &ctx, &mut authenticated).await;
                    metrics::record_command(&cmd.name, started.elapsed(), reply.is_error());
                    reply.serialize(&mut out);

                    if close {
                        write_replies(&mut stream, &ctx, &mut out).await?;
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // fatal framing error: report once, then drop the link
                    Reply::Error(format!("ERR Protocol error: {e}")).serialize(&mut out);
                    write_replies(&mut stream, &ctx, &mut out).await?;
                    return Ok(());
                }
            }
        }

        write_replies(&mut stream, &ctx, &mut out).await?;

        if processed == ctx.max_pipeline {
            // cap hit: the buffer may hold more complete commands; keep
            // draining before reading again
            continue;
        }

        if buf.len() > MAX_BUF_SIZE {
            Reply::Error("ERR Protocol error: request exceeds maximum buffer size".into())
                .serialize(&mut out);
            write_replies(&mut stream, &ctx, &mut out).await?;
            return Ok(());
        }

        tokio::select! {
            read = tokio::time::timeout(ctx.read_timeout, stream.read_buf(&mut buf)) => {
                match read {
                    // clean close; any partial command is silently dropped
                    Ok(Ok(0)) => return Ok(()),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        debug!("read deadline elapsed, closing connection");
                        return Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("shutdown signal, closing connection");
                return Ok(());
            }
        }
    }
}

/// Validates and runs one command. Returns the reply and whether the
/// connection should close afterwards (QUIT).
async fn run_command(
    cmd: &Command,
    engine: &Engine,
    ctx: &ServerContext,
    authenticated: &mut bool,
) -> (Reply, bool) {
    if !*authenticated && !matches!(cmd.name.as_str(), "AUTH" | "PING" | "QUIT") {
        return (Reply::Error("NOAUTH Authentication required.".into()), false);
    }
    let Some(spec) = command::lookup(&cmd.name) else {
        return (command::unknown_command(&cmd.name), false);
    };
    if !spec.arity.accepts(cmd.args.len()) {
        return (command::wrong_arity(&cmd.name), false);
    }

    match cmd.name.as_str() {
        "QUIT" => (Reply::ok(), true),
        "AUTH" => (auth(cmd, ctx, authenticated), false),
        _ => (command::execute(cmd, engine, ctx).await, false),
    }
}

/// AUTH [username] password. Only the implicit "default" user exists;
/// passwords compare in constant time.
fn auth(cmd: &Command, ctx: &ServerContext, authenticated: &mut bool) -> Reply {
    let Some(expected) = &ctx.auth_password else {
        return Reply::Error("ERR Client sent AUTH, but no password is set".into());
    };
    let Some(password) = cmd.args.last() else {
        return command::wrong_arity(&cmd.name);
    };
    if cmd.args.len() == 2 && cmd.args[0].as_ref() != b"default" {
        return wrong_pass();
    }

    if bool::from(password.as_ref().ct_eq(expected.as_bytes())) {
        *authenticated = true;
        Reply::ok()
    } else {
        wrong_pass()
    }
}

fn wrong_pass() -> Reply {
    Reply::Error("WRONGPASS invalid username-password pair or user is disabled.".into())
}

/// Flushes batched replies under the write deadline. An elapsed deadline
/// is treated as a disconnect.
async fn write_replies(
    stream: &mut TcpStream,
    ctx: &ServerContext,
    out: &mut BytesMut,
) -> std::io::Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    match tokio::time::timeout(ctx.write_timeout, stream.write_all(&out[..])).await {
        Ok(result) => {
            out.clear();
            result
        }
        Err(_) => {
            debug!("write deadline elapsed, closing connection");
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write deadline elapsed",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cinder_core::{Clock, EngineConfig};
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;

    fn ctx_with_password(password: Option<&str>) -> ServerContext {
        ServerContext {
            version: "test",
            start_time: Instant::now(),
            auth_password: password.map(str::to_owned),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_pipeline: 1024,
            max_clients: 100,
            shard_count: 1,
            connections_active: AtomicUsize::new(0),
            connections_accepted: AtomicU64::new(0),
        }
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            shards: 1,
            active_expiry: None,
            clock: Clock::system(),
        })
    }

    fn cmd(name: &str, args: &[&str]) -> Command {
        Command::new(
            name,
            args.iter()
                .map(|a| Bytes::copy_from_slice(a.as_bytes()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn unknown_and_empty_commands_are_rejected() {
        let engine = engine();
        let ctx = ctx_with_password(None);
        let mut authed = true;

        let (reply, close) = run_command(&cmd("FLUSHALL", &[]), &engine, &ctx, &mut authed).await;
        assert_eq!(
            reply,
            Reply::Error("ERR unknown command 'FLUSHALL'".into())
        );
        assert!(!close);

        let (reply, _) = run_command(&cmd("", &[]), &engine, &ctx, &mut authed).await;
        assert_eq!(reply, Reply::Error("ERR unknown command ''".into()));
    }

    #[tokio::test]
    async fn arity_is_checked_before_dispatch() {
        let engine = engine();
        let ctx = ctx_with_password(None);
        let mut authed = true;

        let (reply, _) = run_command(&cmd("GET", &[]), &engine, &ctx, &mut authed).await;
        assert_eq!(
            reply,
            Reply::Error("ERR wrong number of arguments for 'get' command".into())
        );

        let (reply, _) =
            run_command(&cmd("MSET", &["a", "1", "b"]), &engine, &ctx, &mut authed).await;
        assert_eq!(
            reply,
            Reply::Error("ERR wrong number of arguments for 'mset' command".into())
        );
    }

    #[tokio::test]
    async fn quit_closes_after_ok() {
        let engine = engine();
        let ctx = ctx_with_password(None);
        let mut authed = true;

        let (reply, close) = run_command(&cmd("QUIT", &[]), &engine, &ctx, &mut authed).await;
        assert_eq!(reply, Reply::ok());
        assert!(close);
    }

    #[tokio::test]
    async fn auth_gate_blocks_until_authenticated() {
        let engine = engine();
        let ctx = ctx_with_password(Some("hunter2"));
        let mut authed = false;

        // data commands blocked
        let (reply, _) = run_command(&cmd("GET", &["k"]), &engine, &ctx, &mut authed).await;
        assert_eq!(reply, Reply::Error("NOAUTH Authentication required.".into()));

        // PING allowed pre-auth
        let (reply, _) = run_command(&cmd("PING", &[]), &engine, &ctx, &mut authed).await;
        assert_eq!(reply, Reply::Simple("PONG".into()));

        // wrong password rejected, gate stays shut
        let (reply, _) = run_command(&cmd("AUTH", &["nope"]), &engine, &ctx, &mut authed).await;
        assert!(matches!(reply, Reply::Error(ref e) if e.starts_with("WRONGPASS")));
        assert!(!authed);

        // correct password opens the gate
        let (reply, _) = run_command(&cmd("AUTH", &["hunter2"]), &engine, &ctx, &mut authed).await;
        assert_eq!(reply, Reply::ok());
        assert!(authed);

        let (reply, _) = run_command(&cmd("GET", &["k"]), &engine, &ctx, &mut authed).await;
        assert_eq!(reply, Reply::NullBulk);
    }

    #[tokio::test]
    async fn auth_with_username_only_accepts_default() {
        let engine = engine();
        let ctx = ctx_with_password(Some("hunter2"));
        let mut authed = false;

        let (reply, _) = run_command(
            &cmd("AUTH", &["admin", "hunter2"]),
            &engine,
            &ctx,
            &mut authed,
        )
        .await;
        assert!(matches!(reply, Reply::Error(ref e) if e.starts_with("WRONGPASS")));

        let (reply, _) = run_command(
            &cmd("AUTH", &["default", "hunter2"]),
            &engine,
            &ctx,
            &mut authed,
        )
        .await;
        assert_eq!(reply, Reply::ok());
        assert!(authed);
    }

    #[tokio::test]
    async fn auth_without_configured_password_errors() {
        let engine = engine();
        let ctx = ctx_with_password(None);
        let mut authed = true;

        let (reply, _) = run_command(&cmd("AUTH", &["pw"]), &engine, &ctx, &mut authed).await;
        assert!(matches!(reply, Reply::Error(ref e) if e.contains("no password is set")));
    }
}
