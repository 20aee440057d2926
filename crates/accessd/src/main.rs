//! accessd entry point.
//!
//! Wires the orchestrator to in-process stores and a logging flow sink.
//! In a full deployment the endpoint/policy stores are fed by the policy
//! channel and the sink is the switch reconciler; standalone operation is
//! useful for development and for exercising the pipeline from config
//! files.

use accessd::access::{AccessFlowOrch, AccessOrchConfig};
use accessd::ctzone::CtZoneAllocator;
use accessd::policy::{MemoryEndpointStore, MemoryPolicyStore};
use accessd::ports::PortIndex;
use accessd::switch::{FlowProgrammer, LoggingSink};
use accessd_common::IdAllocator;
use clap::Parser;
use serde::Deserialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Access-bridge flow programmer
#[derive(Parser, Debug)]
#[command(name = "accessd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON agent configuration file
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Enable connection tracking
    #[arg(long)]
    conntrack: bool,

    /// Emit L3/L4 flows for rules without remote subnets
    #[arg(long)]
    l34_flows_without_subnet: bool,

    /// Controller domain path
    #[arg(long, default_value = "")]
    domain: String,

    /// Log filter (tracing env-filter syntax)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// On-disk agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
struct AgentConfig {
    #[serde(default)]
    conntrack: bool,
    #[serde(default)]
    l34_flows_without_subnet: bool,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    drop_log: Option<DropLogFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct DropLogFileConfig {
    iface: String,
    remote_ip: String,
    remote_port: u16,
}

fn load_config(args: &Args) -> Result<AgentConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| format!("could not read {}: {}", path, e))?;
            serde_json::from_str(&data).map_err(|e| format!("could not parse {}: {}", path, e))?
        }
        None => AgentConfig::default(),
    };
    // CLI switches override the file.
    config.conntrack |= args.conntrack;
    config.l34_flows_without_subnet |= args.l34_flows_without_subnet;
    if !args.domain.is_empty() {
        config.domain = args.domain.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("starting accessd");
    info!(conntrack = config.conntrack, domain = config.domain.as_str(), "agent configuration");

    let endpoints = Arc::new(MemoryEndpointStore::new());
    let policy = Arc::new(MemoryPolicyStore::new());
    let ports = Arc::new(PortIndex::new());
    let ids = Arc::new(IdAllocator::new());
    let ct_zones = Arc::new(CtZoneAllocator::new());
    let programmer = Arc::new(FlowProgrammer::new(Box::new(LoggingSink)));

    let orch = AccessFlowOrch::new(
        AccessOrchConfig {
            conntrack_enabled: config.conntrack,
            add_l34_flows_without_subnet: config.l34_flows_without_subnet,
            controller_domain: config.domain.clone(),
        },
        endpoints,
        policy,
        Arc::clone(&ports),
        ids,
        ct_zones,
        programmer,
    );

    if let Err(e) = orch.start() {
        error!("failed to start orchestration: {}", e);
        return ExitCode::FAILURE;
    }
    for (id, name, drop_reason) in accessd::flow::table::descriptions() {
        tracing::debug!(table = id, name, drop_reason, "pipeline table");
    }

    if let Some(drop_log) = &config.drop_log {
        if orch
            .set_drop_log(&drop_log.iface, &drop_log.remote_ip, drop_log.remote_port)
            .is_err()
        {
            warn!("drop-log destination rejected, continuing without it");
        }
    }

    // Port discovery feeds endpoint reprogramming.
    {
        let orch = Arc::clone(&orch);
        ports.register_listener(Arc::new(move |name, port_no, _present| {
            orch.port_status_update(name, port_no);
        }));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT, shutting down"),
        Err(e) => error!("failed to listen for ctrl-c: {}", e),
    }

    orch.stop();
    orch.wait_idle().await;
    info!("accessd shutdown complete");

    ExitCode::SUCCESS
}
