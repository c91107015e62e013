use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::{BrokerConfig, SessionConfig};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Number of events retained per disconnected session
    #[arg(long, env, default_value_t = 100)]
    pub sse_buffer_capacity: usize,

    /// Seconds a disconnected session is kept before it expires
    #[arg(long, env, default_value_t = 300)]
    pub sse_session_ttl_secs: u64,

    /// Seconds between background sweeps of expired sessions
    #[arg(long, env, default_value_t = 60)]
    pub sse_sweep_interval_secs: u64,

    /// Seconds between heartbeats sent to every live client
    #[arg(long, env, default_value_t = 25)]
    pub sse_heartbeat_interval_secs: u64,

    /// Outbound queue depth per live client
    #[arg(long, env, default_value_t = 64)]
    pub sse_client_channel_capacity: usize,

    /// Queue depth of the broker's broadcast intake
    #[arg(long, env, default_value_t = 1024)]
    pub sse_broadcast_channel_capacity: usize,

    /// Seconds a client may keep its queue full before it is disconnected
    #[arg(long, env, default_value_t = 5)]
    pub sse_slow_consumer_timeout_secs: u64,

    /// Reconnection delay hint (milliseconds) sent to clients on connect
    #[arg(long, env, default_value_t = 3000)]
    pub sse_retry_ms: u64,

    /// Name of the cookie carrying the SSE session id
    #[arg(long, env, default_value = "sse_session")]
    pub sse_cookie_name: String,

    /// Lifetime of the SSE session cookie in seconds; never shorter than the session TTL
    #[arg(long, env, default_value_t = 86_400)]
    pub sse_cookie_max_age_secs: u64,

    /// Only allow a disconnected session to be reclaimed by the same user agent
    #[arg(long, env, default_value_t = false)]
    pub sse_strict_session_binding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sse_session_ttl_secs)
    }

    /// The cookie is issued when a stream opens but read when it reconnects,
    /// so it must outlive the whole connection plus the retention window.
    pub fn cookie_max_age(&self) -> Duration {
        Duration::from_secs(self.sse_cookie_max_age_secs).max(self.session_ttl())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.sse_retry_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_capacity: self.sse_buffer_capacity,
            ttl: self.session_ttl(),
            sweep_interval: Duration::from_secs(self.sse_sweep_interval_secs),
            strict_binding: self.sse_strict_session_binding,
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            client_channel_capacity: self.sse_client_channel_capacity,
            broadcast_channel_capacity: self.sse_broadcast_channel_capacity,
            heartbeat_interval: Duration::from_secs(self.sse_heartbeat_interval_secs),
            slow_consumer_timeout: Duration::from_secs(self.sse_slow_consumer_timeout_secs),
        }
    }
}
