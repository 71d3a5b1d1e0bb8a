//! Standalone framewire server with a few demonstration routes.
//!
//! ```bash
//! test-server --port 10001
//! test-server --config server.json --log-json --metrics-port 9000
//! ```
//!
//! Routes: echo (100 -> 101), login (200 -> 201), whoami (300 -> 301,
//! authenticated only) and heartbeat (102).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use framewire_core::Message;
use framewire_server::{HandlerContext, HandlerError, HandlerResult, Server, ServerConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ECHO: u16 = 100;
const HEARTBEAT: u16 = 102;
const LOGIN: u16 = 200;
const WHOAMI: u16 = 300;

#[derive(Parser, Debug)]
#[command(name = "test-server", version, about = "framewire demonstration server")]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(short, long, env = "FRAMEWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ms) = args.heartbeat_ms {
        config.heartbeat_interval = Some(Duration::from_millis(ms));
    }
    Ok(config)
}

fn login(ctx: &HandlerContext, payload: Bytes) -> HandlerResult {
    if payload.is_empty() {
        return Err(HandlerError::Rejected("empty credentials".to_string()));
    }
    ctx.set_authenticated(true);
    Ok(Some(Message::new(LOGIN + 1, &b"ok"[..])))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(port) = args.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("installing Prometheus exporter")?;
        info!(port, "metrics exporter listening");
    }

    let config = load_config(&args)?;
    let mut server = Server::new(config);
    server
        .register_route(ECHO, |_: &HandlerContext, payload: Bytes| -> HandlerResult {
            Ok(Some(Message::new(ECHO + 1, payload)))
        })
        .register_heartbeat(HEARTBEAT, |_: &HandlerContext, _: Bytes| -> HandlerResult {
            Ok(Some(Message::new(HEARTBEAT, Bytes::new())))
        })
        .register_route(LOGIN, login)
        .register_guarded_route(WHOAMI, |ctx: &HandlerContext, _: Bytes| -> HandlerResult {
            Ok(Some(Message::new(WHOAMI + 1, ctx.session_id().to_string())))
        });

    let addr = server.start().await?;
    info!(%addr, "test server listening");

    let handle = server.handle();
    let run = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    handle.stop().await;
    run.await??;
    Ok(())
}
