//! Mesh broker binary: runs a single node on an in-process network.
//!
//! Loads configuration, initializes structured logging, registers the
//! built-in `$node.*` actions, and runs until SIGTERM/SIGINT.

use mesh_actions::{sync_handler, ActionOptions, CallOptions, Context};
use mesh_broker::{config, LoopbackNetwork, ServiceBroker};
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "mesh.toml";

/// Where the broker reads its configuration and which node it runs as.
#[derive(Debug, PartialEq, Eq)]
struct StartupArgs {
    config_path: String,
    node_id: Option<String>,
}

/// Reads `--config <path>` and `--node-id <id>`; the config path falls back
/// to `MESH_CONFIG_PATH` and then `mesh.toml`.
fn parse_args(
    args: impl IntoIterator<Item = String>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<StartupArgs, String> {
    let mut config_path = None;
    let mut node_id = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let slot = match arg.as_str() {
            "-c" | "--config" => &mut config_path,
            "--node-id" => &mut node_id,
            other => return Err(format!("unknown argument: {other}")),
        };
        match args.next().filter(|value| !value.trim().is_empty()) {
            Some(value) => *slot = Some(value),
            None => return Err(format!("{arg} requires a value")),
        }
    }
    let config_path = config_path
        .or_else(|| env("MESH_CONFIG_PATH").filter(|p| !p.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    Ok(StartupArgs { config_path, node_id })
}

/// Registers the node introspection actions.
fn register_node_actions(broker: &Arc<ServiceBroker>) {
    let node_id = broker.node_id().to_string();
    broker.create_action(
        "$node.health",
        ActionOptions::default(),
        sync_handler(move |_ctx: &Context| {
            Ok(json!({
                "status": "ok",
                "nodeID": node_id,
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }),
    );

    let weak: Weak<ServiceBroker> = Arc::downgrade(broker);
    broker.create_action(
        "$node.actions",
        ActionOptions::default(),
        sync_handler(move |_ctx: &Context| {
            let names = weak
                .upgrade()
                .map(|b| b.registry().action_names())
                .unwrap_or_default();
            Ok(json!(names))
        }),
    );
}

#[tokio::main]
async fn main() {
    let args = match parse_args(std::env::args().skip(1), |key| std::env::var(key).ok()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("mesh-broker: {e}");
            eprintln!("usage: mesh-broker [--config <path>] [--node-id <id>]");
            std::process::exit(2);
        }
    };

    let mut config = config::load_config(Some(&args.config_path))
        .expect("failed to load configuration, the broker cannot start without valid config");
    if let Some(node_id) = args.node_id {
        config.node.id = Some(node_id);
    }

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let network = LoopbackNetwork::new();
    let broker = Arc::new(ServiceBroker::new(&config, network.transport()));
    network.join(&broker);
    register_node_actions(&broker);
    broker.start().await;
    tracing::info!(node_id = broker.node_id(), config = %args.config_path, "mesh broker running");

    match broker
        .call("$node.health", serde_json::Value::Null, CallOptions::default())
        .await
    {
        Ok(health) => tracing::info!(%health, "node is healthy"),
        Err(e) => tracing::error!("health check failed: {}", e),
    }

    let signal = stop_requested().await;
    tracing::info!(signal, node_id = broker.node_id(), "stopping mesh broker");
    broker.stop().await;
    network.leave(broker.node_id());
    tracing::info!(
        pending = broker.pending_requests(),
        "mesh broker stopped"
    );
}

/// Resolves with the name of the signal that asked the node to stop. A
/// signal that cannot be installed is logged and never fires.
async fn stop_requested() -> &'static str {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("unable to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
