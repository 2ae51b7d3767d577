//! Runtime configuration.
//!
//! Every knob is read from the environment (`SYNCKIT_*`) with the
//! documented default; `.env` files are honored via `dotenvy` at startup.
//! Malformed values fall back to the default with a warning rather than
//! aborting — the one hard startup error is `auth_required = true`
//! without a JWT secret or API keys, which would leave the server
//! unable to admit anyone.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// Default cross-instance channel prefix.
pub const DEFAULT_CHANNEL_PREFIX: &str = "synckit:";

#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address the server binds to.
    pub bind_addr: SocketAddr,

    /// When false, every new connection is auto-authenticated as an
    /// admin principal named "anonymous". Testing escape hatch only.
    pub auth_required: bool,
    /// HS256 secret for bearer tokens.
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Static API keys; each one authenticates as an admin principal.
    pub api_keys: HashSet<String>,

    /// Global cap on accepted connections.
    pub max_connections: usize,
    /// Bound on concurrent WebSocket handshakes; 0 = unlimited.
    pub accept_concurrency: usize,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,

    /// Coalescing window for per-document delta fan-out.
    pub batch_window: Duration,
    pub ack_timeout: Duration,
    pub max_ack_attempts: u32,

    pub awareness_ttl: Duration,
    pub awareness_reaper_interval: Duration,

    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_channel_prefix: String,

    /// Per-document delta log retention (entries).
    pub delta_log_limit: usize,
    /// Per-connection outbound queue depth.
    pub outbound_queue_size: usize,
    /// How long shutdown waits for write queues to drain.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            auth_required: true,
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            access_token_ttl: Duration::from_secs(3600),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 3600),
            api_keys: HashSet::new(),
            max_connections: 10_000,
            accept_concurrency: 0,
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(60_000),
            batch_window: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(5_000),
            max_ack_attempts: 3,
            awareness_ttl: Duration::from_millis(30_000),
            awareness_reaper_interval: Duration::from_millis(30_000),
            database_url: None,
            redis_url: None,
            redis_channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            delta_log_limit: 1000,
            outbound_queue_size: 256,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from the environment on top of the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Config::default();

        let config = Config {
            bind_addr: parse_var("SYNCKIT_BIND_ADDR", d.bind_addr),
            auth_required: parse_var("SYNCKIT_AUTH_REQUIRED", d.auth_required),
            jwt_secret: opt_var("SYNCKIT_JWT_SECRET"),
            jwt_issuer: opt_var("SYNCKIT_JWT_ISSUER"),
            jwt_audience: opt_var("SYNCKIT_JWT_AUDIENCE"),
            access_token_ttl: secs_var("SYNCKIT_ACCESS_TOKEN_TTL_SECS", d.access_token_ttl),
            refresh_token_ttl: secs_var("SYNCKIT_REFRESH_TOKEN_TTL_SECS", d.refresh_token_ttl),
            api_keys: opt_var("SYNCKIT_API_KEYS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            max_connections: parse_var("SYNCKIT_MAX_CONNECTIONS", d.max_connections),
            accept_concurrency: parse_var("SYNCKIT_ACCEPT_CONCURRENCY", d.accept_concurrency),
            heartbeat_interval: millis_var("SYNCKIT_HEARTBEAT_INTERVAL_MS", d.heartbeat_interval),
            heartbeat_timeout: millis_var("SYNCKIT_HEARTBEAT_TIMEOUT_MS", d.heartbeat_timeout),
            batch_window: millis_var("SYNCKIT_BATCH_WINDOW_MS", d.batch_window),
            ack_timeout: millis_var("SYNCKIT_ACK_TIMEOUT_MS", d.ack_timeout),
            max_ack_attempts: parse_var("SYNCKIT_MAX_ACK_ATTEMPTS", d.max_ack_attempts),
            awareness_ttl: millis_var("SYNCKIT_AWARENESS_TTL_MS", d.awareness_ttl),
            awareness_reaper_interval: millis_var(
                "SYNCKIT_AWARENESS_REAPER_INTERVAL_MS",
                d.awareness_reaper_interval,
            ),
            database_url: opt_var("SYNCKIT_DATABASE_URL").or_else(|| opt_var("DATABASE_URL")),
            redis_url: opt_var("SYNCKIT_REDIS_URL").or_else(|| opt_var("REDIS_URL")),
            redis_channel_prefix: opt_var("SYNCKIT_REDIS_CHANNEL_PREFIX")
                .unwrap_or(d.redis_channel_prefix),
            delta_log_limit: parse_var("SYNCKIT_DELTA_LOG_LIMIT", d.delta_log_limit),
            outbound_queue_size: parse_var("SYNCKIT_OUTBOUND_QUEUE_SIZE", d.outbound_queue_size),
            shutdown_grace: secs_var("SYNCKIT_SHUTDOWN_GRACE_SECS", d.shutdown_grace),
        };

        if config.auth_required && config.jwt_secret.is_none() && config.api_keys.is_empty() {
            anyhow::bail!(
                "SYNCKIT_AUTH_REQUIRED is true but neither SYNCKIT_JWT_SECRET \
                 nor SYNCKIT_API_KEYS is configured"
            );
        }

        Ok(config)
    }

    /// Milliseconds value for awareness TTL, the unit the store works in.
    pub fn awareness_ttl_ms(&self) -> i64 {
        self.awareness_ttl.as_millis() as i64
    }
}

fn opt_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match opt_var(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable value, using default");
            default
        }),
        None => default,
    }
}

fn millis_var(name: &str, default: Duration) -> Duration {
    match opt_var(name) {
        Some(raw) => raw.parse::<u64>().map(Duration::from_millis).unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable milliseconds, using default");
            default
        }),
        None => default,
    }
}

fn secs_var(name: &str, default: Duration) -> Duration {
    match opt_var(name) {
        Some(raw) => raw.parse::<u64>().map(Duration::from_secs).unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable seconds, using default");
            default
        }),
        None => default,
    }
}
