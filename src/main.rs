use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxgate::call::StopScope;
use voxgate::model::VadTuning;
use voxgate::routes;
use voxgate::routing::{AgentProfile, DirectionPolicy, RoutingKind, RoutingTable};
use voxgate::{AppState, GatewayConfig};

/// Voxgate - real-time voice gateway
#[derive(Parser, Debug)]
#[command(name = "voxgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a routing table (JSON). Without it a single default agent
    /// answers every call.
    #[arg(short = 'r', long = "routing-table", value_name = "FILE")]
    routing_table: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Missing required environment exits non-zero with the specific name.
    let config = GatewayConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;

    let routing = match &cli.routing_table {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading routing table {}", path.display()))?;
            serde_json::from_str::<RoutingTable>(&raw)
                .with_context(|| format!("parsing routing table {}", path.display()))?
        }
        None => {
            warn!("no routing table configured, using the built-in default agent");
            default_table(&config)
        }
    };
    info!(
        agents = routing.agents.len(),
        mappings = routing.number_mappings.len(),
        dnc = routing.do_not_call.len(),
        "routing table loaded"
    );

    let bind_addr = config.bind_addr.clone();
    let media_path = config.media_path.clone();
    let state = Arc::new(AppState::new(config, routing));
    let app = routes::create_router(state.clone());

    let socket_addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow!("invalid bind address \"{bind_addr}\": {e}"))?;
    let listener = TcpListener::bind(&socket_addr).await?;
    info!(%socket_addr, %media_path, "voxgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("clean shutdown");
    Ok(())
}

/// Wait for ctrl-c, then stop every live call before letting the listener
/// finish.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "shutdown signal listener failed");
        return;
    }
    let stopped = state.registry.emergency_stop(&StopScope::Tenant);
    if stopped > 0 {
        warn!(stopped, "emergency-stopped live calls for shutdown");
        // Give orchestrators a moment to finalize their records.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

/// A permissive single-agent table for deployments without routing config.
fn default_table(config: &GatewayConfig) -> RoutingTable {
    let mut vad = VadTuning::default();
    if let Some(silence) = config.vad_silence_ms {
        vad.silence_duration_ms = silence;
    }
    if let Some(prefix) = config.vad_prefix_ms {
        vad.prefix_padding_ms = prefix;
    }

    RoutingTable {
        agents: vec![AgentProfile {
            id: "default".into(),
            name: "Default receptionist".into(),
            voice: "Puck".into(),
            language: "en-US".into(),
            system_prompt: "You are a helpful, concise phone assistant. \
                            Wait for the caller to speak first."
                .into(),
            model: "gemini-live-2.5-flash-preview".into(),
            vad,
            direction_policy: DirectionPolicy::Both,
            routing: RoutingKind::Direct,
            forward_to: None,
            business_hours: None,
            timezone: "UTC".into(),
            max_concurrent_calls: 0,
            primary: true,
            active: true,
            created_at: Utc::now(),
            extended_sessions: false,
        }],
        ..Default::default()
    }
}
