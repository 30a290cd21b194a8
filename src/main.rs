use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wallcast::config::HubConfig;
use wallcast::state::AppState;
use wallcast::web;
use wallcast::webrtc::WebRtcConfig;

/// Exit code for failure to bind the listen address
const EXIT_BIND_FAILURE: i32 = 2;
/// Exit code for a fatal internal invariant violation
const EXIT_INVARIANT_VIOLATION: i32 = 3;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// wallcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "wallcast")]
#[command(version, about = "Video-wall distribution hub", long_about = None)]
struct CliArgs {
    /// Listen address
    #[arg(short = 'a', long, value_name = "ADDRESS", default_value = "0.0.0.0")]
    address: String,

    /// Listen port
    #[arg(short = 'p', long, value_name = "PORT", default_value_t = 3000)]
    port: u16,

    /// Seconds a disconnected viewer record is retained before collection
    #[arg(long, value_name = "SECONDS", default_value_t = 1800)]
    stale_ttl_seconds: u64,

    /// Directory the admin web surface is served from
    #[arg(long, value_name = "DIR", default_value = "admin")]
    static_dir: PathBuf,

    /// STUN server URL (repeatable)
    #[arg(long = "stun-server", value_name = "URL")]
    stun_servers: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting wallcast v{}", env!("CARGO_PKG_VERSION"));

    let config = HubConfig {
        bind_address: args.address,
        port: args.port,
        stale_ttl_seconds: args.stale_ttl_seconds,
        static_dir: args.static_dir,
        webrtc: WebRtcConfig {
            stun_servers: args.stun_servers,
        },
        ..Default::default()
    };

    let bind_ip: IpAddr = match config.bind_address.parse() {
        Ok(ip) => ip,
        Err(_) => {
            tracing::error!("Invalid bind address: {}", config.bind_address);
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };
    let addr = SocketAddr::new(bind_ip, config.port);

    let (state, mut fatal_rx) = AppState::new(config);
    let app = web::create_router(state.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };
    tracing::info!("Hub listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            let _ = state.shutdown_tx.send(());
        }
        message = fatal_rx.recv() => {
            if let Some(message) = message {
                tracing::error!("Fatal invariant violation: {}", message);
                std::process::exit(EXIT_INVARIANT_VIOLATION);
            }
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "wallcast=error,tower_http=error",
        LogLevel::Warn => "wallcast=warn,tower_http=warn",
        LogLevel::Info => "wallcast=info,tower_http=info",
        LogLevel::Debug => "wallcast=debug,tower_http=debug",
        LogLevel::Trace => "wallcast=trace,tower_http=debug",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
