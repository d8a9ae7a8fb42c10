//! Command dispatch.
//!
//! A flat, static table maps each command name to its arity rule; the
//! session loop checks arity before anything else touches the arguments.
//! `execute` then routes the validated command through the engine and
//! builds the reply. Keeping the table a plain data structure makes the
//! dispatch surface testable without a socket in sight.

use bytes::Bytes;
use cinder_core::{Engine, ExpirePolicy, SetCondition, ShardError, ShardRequest, ShardResponse};
use cinder_protocol::{Command, Reply};

use crate::server::ServerContext;

const SYNTAX_ERR: &str = "ERR syntax error";
const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";
const INVALID_SET_EXPIRE: &str = "ERR invalid expire time in 'set' command";

/// Arity rule for a command, counted in arguments after the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
    /// An even count of at least this many (MSET's key/value pairs).
    EvenAtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
            Arity::Between(min, max) => (min..=max).contains(&n),
            Arity::EvenAtLeast(min) => n >= min && n % 2 == 0,
        }
    }
}

/// One dispatch-table row.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: Arity,
}

/// Every command the server understands. The session loop rejects names
/// not in this table with an unknown-command error.
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "PING", arity: Arity::Between(0, 1) },
    CommandSpec { name: "ECHO", arity: Arity::Exact(1) },
    CommandSpec { name: "QUIT", arity: Arity::Exact(0) },
    CommandSpec { name: "AUTH", arity: Arity::Between(1, 2) },
    CommandSpec { name: "INFO", arity: Arity::AtLeast(0) },
    CommandSpec { name: "DBSIZE", arity: Arity::Exact(0) },
    CommandSpec { name: "GET", arity: Arity::Exact(1) },
    CommandSpec { name: "SET", arity: Arity::AtLeast(2) },
    CommandSpec { name: "DEL", arity: Arity::AtLeast(1) },
    CommandSpec { name: "EXISTS", arity: Arity::AtLeast(1) },
    CommandSpec { name: "EXPIRE", arity: Arity::Exact(2) },
    CommandSpec { name: "TTL", arity: Arity::Exact(1) },
    CommandSpec { name: "MGET", arity: Arity::AtLeast(1) },
    CommandSpec { name: "MSET", arity: Arity::EvenAtLeast(2) },
    CommandSpec { name: "INCR", arity: Arity::Exact(1) },
    CommandSpec { name: "DECR", arity: Arity::Exact(1) },
    CommandSpec { name: "INCRBY", arity: Arity::Exact(2) },
    CommandSpec { name: "DECRBY", arity: Arity::Exact(2) },
];

/// Looks a command up by its (already uppercased) name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

pub fn unknown_command(name: &str) -> Reply {
    Reply::Error(format!("ERR unknown command '{name}'"))
}

pub fn wrong_arity(name: &str) -> Reply {
    Reply::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

/// Executes an arity-checked data command and builds its reply.
///
/// AUTH and QUIT never reach this point - they are session state and are
/// handled by the connection loop.
pub async fn execute(cmd: &Command, engine: &Engine, ctx: &ServerContext) -> Reply {
    match cmd.name.as_str() {
        "PING" => match cmd.args.first() {
            None => Reply::Simple("PONG".into()),
            Some(msg) => Reply::Bulk(msg.clone()),
        },

        "ECHO" => Reply::Bulk(cmd.args[0].clone()),

        "GET" => {
            let req = ShardRequest::Get {
                key: cmd.args[0].clone(),
            };
            match engine.route(&cmd.args[0], req).await {
                Ok(ShardResponse::Value(value)) => Reply::bulk_or_null(value),
                other => unexpected(other),
            }
        }

        "SET" => set(cmd, engine).await,

        "DEL" => {
            count_multi(engine, &cmd.args, |key| ShardRequest::Del { key }).await
        }

        "EXISTS" => {
            count_multi(engine, &cmd.args, |key| ShardRequest::Exists { key }).await
        }

        "EXPIRE" => {
            let seconds = match arg_i64(&cmd.args[1]) {
                Some(n) => n,
                None => return Reply::Error(NOT_AN_INTEGER.into()),
            };
            let req = ShardRequest::Expire {
                key: cmd.args[0].clone(),
                ms: seconds.saturating_mul(1000),
            };
            match engine.route(&cmd.args[0], req).await {
                Ok(ShardResponse::Bool(set)) => Reply::Integer(i64::from(set)),
                other => unexpected(other),
            }
        }

        "TTL" => {
            let req = ShardRequest::Ttl {
                key: cmd.args[0].clone(),
            };
            match engine.route(&cmd.args[0], req).await {
                Ok(ShardResponse::Ttl(ttl)) => Reply::Integer(ttl.as_integer()),
                other => unexpected(other),
            }
        }

        "MGET" => {
            match engine
                .route_multi(&cmd.args, |key| ShardRequest::Get { key })
                .await
            {
                Ok(responses) => Reply::Array(
                    responses
                        .into_iter()
                        .map(|resp| match resp {
                            ShardResponse::Value(value) => Reply::bulk_or_null(value),
                            _ => Reply::NullBulk,
                        })
                        .collect(),
                ),
                Err(e) => shard_error(e),
            }
        }

        "MSET" => {
            for pair in cmd.args.chunks_exact(2) {
                let req = ShardRequest::Set {
                    key: pair[0].clone(),
                    value: pair[1].clone(),
                    expire: ExpirePolicy::Clear,
                    condition: SetCondition::Always,
                    want_previous: false,
                };
                if let Err(e) = engine.route(&pair[0], req).await {
                    return shard_error(e);
                }
            }
            Reply::ok()
        }

        "INCR" => incr_by(engine, &cmd.args[0], Some(1)).await,
        "DECR" => incr_by(engine, &cmd.args[0], Some(-1)).await,
        "INCRBY" => incr_by(engine, &cmd.args[0], arg_i64(&cmd.args[1])).await,
        "DECRBY" => {
            let delta = arg_i64(&cmd.args[1]).and_then(i64::checked_neg);
            incr_by(engine, &cmd.args[0], delta).await
        }

        "DBSIZE" => match engine.broadcast(|| ShardRequest::DbSize).await {
            Ok(responses) => {
                let total: usize = responses
                    .iter()
                    .map(|resp| match resp {
                        ShardResponse::KeyCount(n) => *n,
                        _ => 0,
                    })
                    .sum();
                Reply::Integer(total as i64)
            }
            Err(e) => shard_error(e),
        },

        // section arguments are accepted and ignored
        "INFO" => info(engine, ctx).await,

        name => unknown_command(name),
    }
}

/// SET with its option grammar: `EX s | PX ms | NX | XX | KEEPTTL | GET`.
async fn set(cmd: &Command, engine: &Engine) -> Reply {
    let options = match parse_set_options(&cmd.args[2..]) {
        Ok(options) => options,
        Err(reply) => return reply,
    };

    let req = ShardRequest::Set {
        key: cmd.args[0].clone(),
        value: cmd.args[1].clone(),
        expire: options.expire,
        condition: options.condition,
        want_previous: options.want_previous,
    };
    match engine.route(&cmd.args[0], req).await {
        Ok(ShardResponse::Set(outcome)) => {
            if options.want_previous {
                // with GET, the reply is the prior value whether or not
                // the write applied
                Reply::bulk_or_null(outcome.previous)
            } else if outcome.applied {
                Reply::ok()
            } else {
                Reply::NullBulk
            }
        }
        other => unexpected(other),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SetOptions {
    expire: ExpirePolicy,
    condition: SetCondition,
    want_previous: bool,
}

/// Consumes SET's option tokens left to right. EX/PX/KEEPTTL are mutually
/// exclusive, as are NX/XX; conflicts and unknown tokens are syntax
/// errors, and non-positive expirations are rejected outright.
fn parse_set_options(args: &[Bytes]) -> Result<SetOptions, Reply> {
    let mut expire: Option<ExpirePolicy> = None;
    let mut keep_ttl = false;
    let mut condition: Option<SetCondition> = None;
    let mut want_previous = false;

    let mut i = 0;
    while i < args.len() {
        let token = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match token.as_str() {
            "EX" | "PX" => {
                if expire.is_some() || keep_ttl {
                    return Err(Reply::Error(SYNTAX_ERR.into()));
                }
                let Some(raw) = args.get(i + 1) else {
                    return Err(Reply::Error(SYNTAX_ERR.into()));
                };
                let Some(amount) = arg_i64(raw) else {
                    return Err(Reply::Error(NOT_AN_INTEGER.into()));
                };
                if amount <= 0 {
                    return Err(Reply::Error(INVALID_SET_EXPIRE.into()));
                }
                let ms = if token == "EX" {
                    match amount.checked_mul(1000) {
                        Some(ms) => ms,
                        None => return Err(Reply::Error(INVALID_SET_EXPIRE.into())),
                    }
                } else {
                    amount
                };
                expire = Some(ExpirePolicy::RelativeMs(ms as u64));
                i += 2;
            }
            "KEEPTTL" => {
                if expire.is_some() || keep_ttl {
                    return Err(Reply::Error(SYNTAX_ERR.into()));
                }
                keep_ttl = true;
                i += 1;
            }
            "NX" => {
                if condition.is_some() {
                    return Err(Reply::Error(SYNTAX_ERR.into()));
                }
                condition = Some(SetCondition::IfAbsent);
                i += 1;
            }
            "XX" => {
                if condition.is_some() {
                    return Err(Reply::Error(SYNTAX_ERR.into()));
                }
                condition = Some(SetCondition::IfPresent);
                i += 1;
            }
            "GET" => {
                want_previous = true;
                i += 1;
            }
            _ => return Err(Reply::Error(SYNTAX_ERR.into())),
        }
    }

    Ok(SetOptions {
        expire: expire.unwrap_or(if keep_ttl {
            ExpirePolicy::Keep
        } else {
            ExpirePolicy::Clear
        }),
        condition: condition.unwrap_or(SetCondition::Always),
        want_previous,
    })
}

/// INCR/DECR/INCRBY/DECRBY. `delta` is `None` when the client-supplied
/// amount didn't parse (or DECRBY of i64::MIN can't be negated).
async fn incr_by(engine: &Engine, key: &Bytes, delta: Option<i64>) -> Reply {
    let Some(delta) = delta else {
        return Reply::Error(NOT_AN_INTEGER.into());
    };
    let req = ShardRequest::IncrBy {
        key: key.clone(),
        delta,
    };
    match engine.route(key, req).await {
        Ok(ShardResponse::Integer(n)) => Reply::Integer(n),
        Ok(ShardResponse::IncrError(e)) => Reply::Error(format!("ERR {e}")),
        other => unexpected(other),
    }
}

/// Fans a boolean-result command out across shards for multiple keys and
/// replies with the count of `true` results. Each key's predicate is
/// evaluated at the instant of its own per-shard operation.
async fn count_multi<F>(engine: &Engine, keys: &[Bytes], make_req: F) -> Reply
where
    F: Fn(Bytes) -> ShardRequest,
{
    match engine.route_multi(keys, make_req).await {
        Ok(responses) => {
            let count = responses
                .iter()
                .filter(|resp| matches!(resp, ShardResponse::Bool(true)))
                .count();
            Reply::Integer(count as i64)
        }
        Err(e) => shard_error(e),
    }
}

/// Builds the multi-line INFO bulk from server context and shard stats.
async fn info(engine: &Engine, ctx: &ServerContext) -> Reply {
    use std::sync::atomic::Ordering;

    let (mut keys, mut expires, mut expired_total) = (0usize, 0usize, 0u64);
    match engine.broadcast(|| ShardRequest::Stats).await {
        Ok(responses) => {
            for resp in &responses {
                if let ShardResponse::Stats(stats) = resp {
                    keys += stats.key_count;
                    expires += stats.keys_with_expiry;
                    expired_total += stats.keys_expired;
                }
            }
        }
        Err(e) => return shard_error(e),
    }

    let text = format!(
        "# Server\r\n\
         cinder_version:{}\r\n\
         uptime_in_seconds:{}\r\n\
         \r\n\
         # Clients\r\n\
         connected_clients:{}\r\n\
         max_clients:{}\r\n\
         \r\n\
         # Stats\r\n\
         total_connections_received:{}\r\n\
         expired_keys:{}\r\n\
         \r\n\
         # Keyspace\r\n\
         db0:keys={},expires={}\r\n",
        ctx.version,
        ctx.start_time.elapsed().as_secs(),
        ctx.connections_active.load(Ordering::Relaxed),
        ctx.max_clients,
        ctx.connections_accepted.load(Ordering::Relaxed),
        expired_total,
        keys,
        expires,
    );
    Reply::Bulk(Bytes::from(text))
}

fn arg_i64(arg: &Bytes) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn shard_error(e: ShardError) -> Reply {
    Reply::Error(format!("ERR {e}"))
}

fn unexpected(result: Result<ShardResponse, ShardError>) -> Reply {
    match result {
        Err(e) => shard_error(e),
        Ok(resp) => Reply::Error(format!("ERR unexpected shard response: {resp:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{Clock, EngineConfig};
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::{Duration, Instant};

    #[test]
    fn arity_rules() {
        assert!(Arity::Exact(1).accepts(1));
        assert!(!Arity::Exact(1).accepts(2));
        assert!(Arity::AtLeast(2).accepts(2));
        assert!(Arity::AtLeast(2).accepts(9));
        assert!(!Arity::AtLeast(2).accepts(1));
        assert!(Arity::Between(0, 1).accepts(0));
        assert!(Arity::Between(0, 1).accepts(1));
        assert!(!Arity::Between(0, 1).accepts(2));
        assert!(Arity::EvenAtLeast(2).accepts(2));
        assert!(Arity::EvenAtLeast(2).accepts(6));
        assert!(!Arity::EvenAtLeast(2).accepts(3));
        assert!(!Arity::EvenAtLeast(2).accepts(0));
    }

    #[test]
    fn lookup_finds_known_commands_only() {
        assert!(lookup("GET").is_some());
        assert!(lookup("MSET").is_some());
        assert!(lookup("FLUSHALL").is_none());
        // lookup expects pre-uppercased names
        assert!(lookup("get").is_none());
    }

    #[test]
    fn table_arities_match_contract() {
        let expect = [
            ("PING", Arity::Between(0, 1)),
            ("ECHO", Arity::Exact(1)),
            ("QUIT", Arity::Exact(0)),
            ("SET", Arity::AtLeast(2)),
            ("DEL", Arity::AtLeast(1)),
            ("EXPIRE", Arity::Exact(2)),
            ("MSET", Arity::EvenAtLeast(2)),
            ("INCRBY", Arity::Exact(2)),
        ];
        for (name, arity) in expect {
            assert_eq!(lookup(name).unwrap().arity, arity, "{name}");
        }
    }

    fn opts(tokens: &[&str]) -> Result<SetOptions, Reply> {
        let args: Vec<Bytes> = tokens
            .iter()
            .map(|t| Bytes::copy_from_slice(t.as_bytes()))
            .collect();
        parse_set_options(&args)
    }

    #[test]
    fn set_options_plain_clears_ttl() {
        let options = opts(&[]).unwrap();
        assert_eq!(options.expire, ExpirePolicy::Clear);
        assert_eq!(options.condition, SetCondition::Always);
        assert!(!options.want_previous);
    }

    #[test]
    fn set_options_ex_px_keepttl() {
        assert_eq!(
            opts(&["EX", "10"]).unwrap().expire,
            ExpirePolicy::RelativeMs(10_000)
        );
        assert_eq!(
            opts(&["PX", "500"]).unwrap().expire,
            ExpirePolicy::RelativeMs(500)
        );
        assert_eq!(opts(&["KEEPTTL"]).unwrap().expire, ExpirePolicy::Keep);
        // case-insensitive tokens
        assert_eq!(
            opts(&["px", "500"]).unwrap().expire,
            ExpirePolicy::RelativeMs(500)
        );
    }

    #[test]
    fn set_options_conditions_and_get() {
        assert_eq!(opts(&["NX"]).unwrap().condition, SetCondition::IfAbsent);
        assert_eq!(opts(&["XX"]).unwrap().condition, SetCondition::IfPresent);
        let options = opts(&["NX", "GET", "EX", "5"]).unwrap();
        assert_eq!(options.condition, SetCondition::IfAbsent);
        assert!(options.want_previous);
        assert_eq!(options.expire, ExpirePolicy::RelativeMs(5_000));
    }

    #[test]
    fn set_options_conflicts_are_syntax_errors() {
        for tokens in [
            &["EX", "1", "PX", "100"][..],
            &["PX", "100", "EX", "1"],
            &["EX", "1", "KEEPTTL"],
            &["KEEPTTL", "PX", "100"],
            &["NX", "XX"],
            &["XX", "NX"],
            &["BOGUS"],
            &["EX"], // dangling option value
        ] {
            let err = opts(tokens).unwrap_err();
            assert_eq!(err, Reply::Error(SYNTAX_ERR.into()), "{tokens:?}");
        }
    }

    #[test]
    fn set_options_expire_validation() {
        assert_eq!(
            opts(&["EX", "0"]).unwrap_err(),
            Reply::Error(INVALID_SET_EXPIRE.into())
        );
        assert_eq!(
            opts(&["PX", "-5"]).unwrap_err(),
            Reply::Error(INVALID_SET_EXPIRE.into())
        );
        assert_eq!(
            opts(&["EX", "ten"]).unwrap_err(),
            Reply::Error(NOT_AN_INTEGER.into())
        );
        // EX seconds overflowing the ms conversion
        assert_eq!(
            opts(&["EX", "9223372036854775807"]).unwrap_err(),
            Reply::Error(INVALID_SET_EXPIRE.into())
        );
    }

    fn test_ctx() -> ServerContext {
        ServerContext {
            version: "test",
            start_time: Instant::now(),
            auth_password: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_pipeline: 1024,
            max_clients: 100,
            shard_count: 2,
            connections_active: AtomicUsize::new(0),
            connections_accepted: AtomicU64::new(0),
        }
    }

    fn test_engine() -> Engine {
        Engine::new(EngineConfig {
            shards: 2,
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
    async fn execute_set_get_del() {
        let engine = test_engine();
        let ctx = test_ctx();

        let reply = execute(&cmd("SET", &["k", "v"]), &engine, &ctx).await;
        assert_eq!(reply, Reply::ok());

        let reply = execute(&cmd("GET", &["k"]), &engine, &ctx).await;
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"v")));

        let reply = execute(&cmd("DEL", &["k", "missing"]), &engine, &ctx).await;
        assert_eq!(reply, Reply::Integer(1));

        let reply = execute(&cmd("GET", &["k"]), &engine, &ctx).await;
        assert_eq!(reply, Reply::NullBulk);
    }

    #[tokio::test]
    async fn execute_mget_preserves_order() {
        let engine = test_engine();
        let ctx = test_ctx();
        execute(&cmd("MSET", &["a", "1", "b", "2"]), &engine, &ctx).await;

        let reply = execute(&cmd("MGET", &["a", "c", "b"]), &engine, &ctx).await;
        assert_eq!(
            reply,
            Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"1")),
                Reply::NullBulk,
                Reply::Bulk(Bytes::from_static(b"2")),
            ])
        );
    }

    #[tokio::test]
    async fn execute_counter_family() {
        let engine = test_engine();
        let ctx = test_ctx();

        assert_eq!(
            execute(&cmd("INCR", &["n"]), &engine, &ctx).await,
            Reply::Integer(1)
        );
        assert_eq!(
            execute(&cmd("INCRBY", &["n", "10"]), &engine, &ctx).await,
            Reply::Integer(11)
        );
        assert_eq!(
            execute(&cmd("DECRBY", &["n", "4"]), &engine, &ctx).await,
            Reply::Integer(7)
        );
        assert_eq!(
            execute(&cmd("DECR", &["n"]), &engine, &ctx).await,
            Reply::Integer(6)
        );
        assert_eq!(
            execute(&cmd("INCRBY", &["n", "ten"]), &engine, &ctx).await,
            Reply::Error(NOT_AN_INTEGER.into())
        );
    }

    #[tokio::test]
    async fn execute_dbsize_and_info() {
        let engine = test_engine();
        let ctx = test_ctx();
        execute(&cmd("MSET", &["a", "1", "b", "2", "c", "3"]), &engine, &ctx).await;

        assert_eq!(
            execute(&cmd("DBSIZE", &[]), &engine, &ctx).await,
            Reply::Integer(3)
        );

        let reply = execute(&cmd("INFO", &[]), &engine, &ctx).await;
        match reply {
            Reply::Bulk(text) => {
                let text = String::from_utf8(text.to_vec()).unwrap();
                assert!(text.contains("# Server"));
                assert!(text.contains("db0:keys=3,expires=0"));
            }
            other => panic!("expected bulk INFO, got {other:?}"),
        }
    }
}
