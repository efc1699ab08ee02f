//! frameflow - streaming video inference server.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use frameflow_server::config::{
    DEFAULT_MAX_FRAME_SIZE_MB, DEFAULT_MAX_SESSIONS, DEFAULT_RATE_WINDOW, DEFAULT_TARGET_FPS,
};
use frameflow_server::{
    builtin_registry, ServerConfig, SessionConfig, StreamServer, DEFAULT_DROP_THRESHOLD,
    DEFAULT_SLOWDOWN_THRESHOLD,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "frameflow")]
#[command(about = "Streaming video inference server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "FRAMEFLOW_BIND", default_value = "0.0.0.0:8765")]
    bind: SocketAddr,

    /// Drop frames while the drop rate exceeds this fraction
    #[arg(long, env = "FRAMEFLOW_DROP_THRESHOLD", default_value_t = DEFAULT_DROP_THRESHOLD)]
    drop_threshold: f64,

    /// Ask clients to slow down once the drop rate exceeds this fraction
    #[arg(long, env = "FRAMEFLOW_SLOWDOWN_THRESHOLD", default_value_t = DEFAULT_SLOWDOWN_THRESHOLD)]
    slowdown_threshold: f64,

    /// Largest accepted frame, in megabytes
    #[arg(long, env = "FRAMEFLOW_MAX_FRAME_SIZE_MB", default_value_t = DEFAULT_MAX_FRAME_SIZE_MB)]
    max_frame_size_mb: usize,

    /// Nominal client frame rate
    #[arg(long, env = "FRAMEFLOW_TARGET_FPS", default_value_t = DEFAULT_TARGET_FPS)]
    target_fps: u32,

    /// Measure the drop rate over this many recent frames (0 = whole session)
    #[arg(long, env = "FRAMEFLOW_DROP_RATE_WINDOW", default_value_t = DEFAULT_RATE_WINDOW)]
    drop_rate_window: usize,

    /// Recommended number of concurrent sessions (logged, not enforced)
    #[arg(long, env = "FRAMEFLOW_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Seconds allowed for the WebSocket handshake
    #[arg(long, env = "FRAMEFLOW_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "FRAMEFLOW_JSON_LOGS")]
    json_logs: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let session = SessionConfig::new()
            .with_drop_threshold(self.drop_threshold)
            .with_slowdown_threshold(self.slowdown_threshold)
            .with_max_frame_size_mb(self.max_frame_size_mb)
            .with_target_fps(self.target_fps)
            .with_rate_window(self.drop_rate_window);

        ServerConfig::new(self.bind)
            .with_session_config(session)
            .with_max_sessions(self.max_sessions)
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let config = cli.server_config();
    config.validate()?;

    let registry = builtin_registry();
    info!(
        bind = %config.bind_addr,
        pipelines = ?registry.names(),
        drop_threshold = config.session.drop_threshold,
        slowdown_threshold = config.session.slowdown_threshold,
        max_frame_size_bytes = config.session.max_frame_size_bytes,
        "Starting frameflow"
    );
    info!("  Connect via: ws://{}/?pipeline_id=<pipeline>", config.bind_addr);

    let server = StreamServer::with_registry(config, registry);
    let listener = server.bind().await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
        shutdown.cancel();
    });

    server.serve(listener).await?;
    Ok(())
}
