//! MPC node CLI
//!
//! Entry point for running a node, driving admin operations against a
//! running node, or simulating a whole party in one process.

use clap::{Parser, Subcommand};
use mpc_node::logging::{init_from_config, init_logging, LogLevel};
use mpc_node::mpc::MpcRegistry;
use mpc_node::{
    create_router, ConfirmRequest, DkgStartRequest, EchoApp, ErrorResponse, FileUsageRegistry,
    HttpTransport, MemoryCluster, Node, NodeConfig, NonceBatchStartRequest, Peers,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "mpc-node")]
#[command(about = "Threshold MPC signing node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node server
    Run {
        /// Path to the TOML config
        #[arg(short, long, env = "MPC_NODE_CONFIG")]
        config: PathBuf,
    },

    /// Start a DKG on a running node
    Dkg {
        /// Node base URL (e.g., http://localhost:9101)
        #[arg(short, long)]
        node: String,

        /// Threshold, defaults to the party threshold
        #[arg(short, long)]
        threshold: Option<usize>,

        /// Comma-separated partner ids, defaults to the whole party
        #[arg(short, long, value_delimiter = ',')]
        partners: Option<Vec<u16>>,

        /// Known secret (hex) to seed the key with
        #[arg(long)]
        seed: Option<String>,

        /// Make the key the party's signing key
        #[arg(long)]
        activate: bool,
    },

    /// Precompute a FROST nonce batch on a running node
    NonceBatch {
        #[arg(short, long)]
        node: String,

        /// Number of nonces
        #[arg(short, long, default_value = "64")]
        size: usize,

        #[arg(long)]
        activate: bool,
    },

    /// Ask a running node to confirm an app result
    Confirm {
        #[arg(short, long)]
        node: String,

        #[arg(short, long, default_value = "echo")]
        app: String,

        /// App parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,

        /// Sign with a FROST batch slot
        #[arg(long)]
        frost: bool,
    },

    /// Run a whole party in memory: DKG, optional nonce batch, confirmations
    Simulate {
        /// Number of nodes
        #[arg(short = 'n', long, default_value = "4")]
        total: u16,

        #[arg(short, long, default_value = "2")]
        threshold: usize,

        /// Confirmation requests to run
        #[arg(short, long, default_value = "3")]
        requests: usize,

        #[arg(long)]
        frost: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_server(config).await?;
        }
        Commands::Dkg {
            node,
            threshold,
            partners,
            seed,
            activate,
        } => {
            init_logging(LogLevel::Info, false)?;
            let request = DkgStartRequest {
                id: None,
                t: threshold,
                partners,
                seed,
                activate,
            };
            let response: serde_json::Value = post_admin(&node, "/admin/dkg", &request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::NonceBatch {
            node,
            size,
            activate,
        } => {
            init_logging(LogLevel::Info, false)?;
            let request = NonceBatchStartRequest {
                id: None,
                n: size,
                t: None,
                partners: None,
                activate,
            };
            let response: serde_json::Value =
                post_admin(&node, "/admin/nonce-batch", &request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Confirm {
            node,
            app,
            params,
            frost,
        } => {
            init_logging(LogLevel::Info, false)?;
            let request = ConfirmRequest {
                app,
                params: serde_json::from_str(&params)?,
                frost,
            };
            let response: serde_json::Value =
                post_admin(&node, "/admin/confirm", &request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Simulate {
            total,
            threshold,
            requests,
            frost,
        } => {
            init_logging(LogLevel::Info, false)?;
            simulate(total, threshold, requests, frost).await?;
        }
    }

    Ok(())
}

/// Run the node server
async fn run_server(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::load(&config_path)?;
    init_from_config(&config)?;

    tracing::info!(
        node_id = config.node.id,
        config = %config_path.display(),
        "Starting MPC node"
    );

    std::fs::create_dir_all(&config.node.data_dir)?;
    let registry = Arc::new(MpcRegistry::new(Duration::from_secs(
        config.cache.session_ttl_secs,
    )));
    let transport = Arc::new(HttpTransport::new(
        config.node.id,
        config.peer_urls()?,
        registry.clone(),
        config.round_timeout(),
    )?);
    let usage = Arc::new(FileUsageRegistry::open(config.usage_path())?);
    let bind = config.node.bind.clone();

    let node = Node::new(
        config,
        registry,
        Peers::shared(transport),
        Arc::new(EchoApp),
        usage,
    )?;

    match node.load_keystore().await {
        Ok(true) => {}
        Ok(false) => tracing::info!("No signing key yet. Run a DKG with --activate."),
        Err(e) => tracing::warn!(error = %e, "Failed to load key. Run a DKG to generate one."),
    }
    let _sweepers = node.spawn_sweepers();

    let app = create_router(node);
    let addr: SocketAddr = bind.parse()?;

    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn post_admin<B: Serialize, T: DeserializeOwned>(
    node: &str,
    path: &str,
    body: &B,
) -> Result<T, Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}{}", node.trim_end_matches('/'), path))
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await?;
        let message = match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(error) => format!("{} ({}): {}", status, error.code, error.message),
            Err(_) => format!("{}: {}", status, text),
        };
        return Err(message.into());
    }
    Ok(response.json().await?)
}

/// DKG, optional nonce batch and a few confirmations on an in-memory party
async fn simulate(
    total: u16,
    threshold: usize,
    requests: usize,
    frost: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let partners: Vec<u16> = (1..=total).collect();
    let cluster = MemoryCluster::new(threshold, &partners, |_| {})?;
    let starter = cluster.node(1)?.clone();

    let key = starter
        .run_dkg(DkgStartRequest {
            activate: true,
            ..Default::default()
        })
        .await?;
    tracing::info!(
        key_id = %key.id,
        public_key = %key.public_key,
        address = %key.address,
        "Group key generated"
    );

    if frost {
        let batch = starter
            .run_nonce_batch(NonceBatchStartRequest {
                id: None,
                n: requests.max(1),
                t: None,
                partners: None,
                activate: true,
            })
            .await?;
        tracing::info!(batch_id = %batch.id, n = batch.n, "Nonce batch ready");
    }

    for i in 0..requests {
        let outcome = starter
            .confirm(ConfirmRequest {
                app: "echo".to_string(),
                params: serde_json::json!({ "request": i }),
                frost,
            })
            .await?;
        tracing::info!(
            req_id = %outcome.req_id,
            confirmed = outcome.confirmed,
            signers = ?outcome.signers,
            signature = outcome.signature.as_deref().unwrap_or(""),
            "Request finished"
        );
    }

    Ok(())
}
