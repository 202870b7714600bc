//! relaymq - MQTT 3.1.1 broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>            Configuration file path
//!   -b, --bind <ADDR>              Bind address (default: 0.0.0.0:1883)
//!   --ws-bind <ADDR>               WebSocket bind address
//!   --connect-timeout <DURATION>   Time allowed before CONNECT (e.g. 10s)
//!   -l, --log-level                Log level (error, warn, info, debug, trace)
//!   -h, --help                     Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaymq::backend::MemoryBackend;
use relaymq::broker::Broker;
use relaymq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// relaymq - MQTT 3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version)]
#[command(about = "MQTT 3.1.1 broker with in-memory sessions")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket bind address (optional, enables MQTT over WebSocket)
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Time a new connection has to send CONNECT (e.g. "500ms", "10s")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    connect_timeout: Option<Duration>,

    /// Log level; RUST_LOG takes precedence when set
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    let level = args
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| file_config.log.level.to_lowercase());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let mut broker_config = file_config.broker_config();
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(ws_bind) = args.ws_bind {
        broker_config.ws_bind_addr = Some(ws_bind);
    }
    if let Some(connect_timeout) = args.connect_timeout {
        broker_config.connect_timeout = connect_timeout;
    }

    info!("Starting relaymq MQTT broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    if let Some(ws_addr) = &broker_config.ws_bind_addr {
        info!("  WebSocket address: {}", ws_addr);
    }
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Connect timeout: {:?}", broker_config.connect_timeout);
    info!("  Keep-alive tolerance: {}x", broker_config.keep_alive_tolerance);
    info!("  Message store: {:?}", file_config.store.backend);

    let mut backend = MemoryBackend::new()
        .with_store(file_config.store.backend)
        .with_limits(file_config.backend_limits());
    match file_config.logins() {
        Some(logins) => {
            info!("  Authentication: enabled ({} users configured)", logins.len());
            backend = backend.with_logins(logins);
        }
        None => info!("  Authentication: disabled"),
    }

    let broker = Broker::with_backend(broker_config, Arc::new(backend));

    tokio::select! {
        result = broker.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            broker.shutdown();
        }
    }

    Ok(())
}
