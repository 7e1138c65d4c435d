//! HwameiStor Local Storage node agent
//!
//! One instance runs per storage node. It registers the node, keeps its
//! pools and replicas in line with the cluster, and serves health and
//! metrics endpoints.

use clap::Parser;
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus};
use kube::api::ObjectMeta;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_storage::{
    CommandExecutor, Error, NodeManager, NodeManagerOptions, NsExecutor, Result, Store, Stores,
    SystemConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// HwameiStor Local Storage - per-node local volume manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this agent manages
    #[arg(long, env = "NODENAME")]
    node_name: String,

    /// Namespace holding the agent's config maps
    #[arg(long, env = "POD_NAMESPACE", default_value = "hwameistor")]
    namespace: String,

    /// System config file (YAML); defaults apply when unset
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Node annotation carrying the storage IPv4 address
    #[arg(long, env = "STORAGE_IPV4_ANNOTATION_KEY")]
    storage_ip_annotation: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes, commands run directly on this host)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Storage IP announced in standalone mode
    #[arg(long, env = "STANDALONE_STORAGE_IP", default_value = "127.0.0.1")]
    standalone_storage_ip: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting HwameiStor local storage node agent");
    info!("  Version: {}", local_storage::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Namespace: {}", args.namespace);
    info!("  Standalone mode: {}", args.standalone);

    let system = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    info!("  Replication mode: {:?}", system.mode);

    let options = NodeManagerOptions {
        node_name: args.node_name.clone(),
        namespace: args.namespace.clone(),
        storage_ip_annotation: args.storage_ip_annotation.clone(),
        system,
    };

    let (stores, exec): (Stores, Arc<dyn CommandExecutor>) = if args.standalone {
        let stores = Stores::memory();
        stores
            .nodes
            .create(&standalone_node(&args.node_name, &args.standalone_storage_ip))
            .await?;
        (stores, Arc::new(NsExecutor::direct()))
    } else {
        let client = kube::Client::try_default().await?;
        (Stores::kube(client, &args.namespace), Arc::new(NsExecutor::new()))
    };

    let manager = NodeManager::new(options, stores, exec)?;

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_stop.cancel();
    });

    manager.run(stop).await?;

    info!("Node agent shutdown complete");
    Ok(())
}

/// Kubernetes node object standing in for the API server in standalone mode
fn standalone_node(name: &str, storage_ip: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: storage_ip.to_string(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => args.log_level.to_lowercase(),
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,kube=info,tower=warn", level))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // register collectors before the first scrape
    local_storage::metrics::metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
