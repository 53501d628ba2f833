use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::error::Error as SseError;
use sse::options::{BackplaneOptions, DistributedOptions, StreamOptions};
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

    /// Redis URL shared by every server instance. When set, connections are
    /// tracked in Redis and events are relayed between instances.
    #[arg(long, env)]
    redis_url: Option<String>,

    /// Prefix for every Redis key and pub/sub channel this service uses
    #[arg(long, env, default_value = sse::options::DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,

    /// Seconds before a connection record expires in Redis unless refreshed
    #[arg(long, env, default_value_t = 120)]
    pub connection_ttl_secs: u64,

    /// Seconds between TTL refreshes; must be shorter than the connection TTL
    #[arg(long, env, default_value_t = 60)]
    pub ttl_refresh_interval_secs: u64,

    /// Relay published events to other instances through Redis pub/sub
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub backplane_enabled: bool,

    /// Seconds between heartbeat sweeps over all open streams
    #[arg(long, env, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Reconnect delay in milliseconds suggested to clients via the `retry:` frame
    #[arg(long, env, default_value_t = 3000)]
    pub retry_interval_ms: u64,

    /// Milliseconds a single frame write may wait before the stream is considered dead
    #[arg(long, env, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Frames buffered per stream before writers wait on the client
    #[arg(long, env, default_value_t = 64)]
    pub stream_buffer: usize,

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

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref()
    }

    pub fn is_distributed(&self) -> bool {
        self.redis_url().is_some_and(|url| !url.trim().is_empty())
    }

    /// Validated per-stream settings.
    pub fn stream_options(&self) -> Result<StreamOptions, SseError> {
        StreamOptions {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            buffer: self.stream_buffer,
        }
        .validate()
    }

    /// Validated Redis settings, `None` when running single-instance.
    pub fn distributed_options(&self) -> Result<Option<DistributedOptions>, SseError> {
        if !self.is_distributed() {
            return Ok(None);
        }
        DistributedOptions::new(self.redis_url.clone())?
            .with_key_prefix(&self.key_prefix)
            .with_ttl(
                Duration::from_secs(self.connection_ttl_secs),
                Duration::from_secs(self.ttl_refresh_interval_secs),
            )
            .validate()
            .map(Some)
    }

    pub fn backplane_options(&self) -> BackplaneOptions {
        BackplaneOptions {
            channel_prefix: self.key_prefix.clone(),
        }
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }
}
