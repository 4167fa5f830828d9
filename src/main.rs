//! Node binary
//!
//! Runs a lamina node around a small built-in counting application.
//! Useful for local experiments; real deployments embed the library and
//! supply their own application.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use lamina::aci::application::Application;
use lamina::aci::types::*;
use lamina::aci::LocalClient;
use lamina::config::{load_config_from_file, NodeConfig};
use lamina::node::{FullNode, LightNode, Node};
use lamina::rpc::RpcServer;
use lamina::types::{GenesisDoc, GenesisValidator};

#[derive(Debug, Parser)]
#[command(name = "lamina", about = "Modular rollup node runtime")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Produce blocks on this node
    #[arg(long)]
    aggregator: bool,

    /// Run the light profile
    #[arg(long)]
    light: bool,

    /// Chain identifier
    #[arg(long, default_value = "lamina-local")]
    chain_id: String,
}

/// Demo application: counts delivered transactions and hashes the count.
#[derive(Default)]
struct CounterApp {
    txs: u64,
    app_hash: Vec<u8>,
}

impl CounterApp {
    fn hash_of_count(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.txs.to_be_bytes());
        hasher.finalize().to_vec()
    }
}

impl Application for CounterApp {
    fn deliver_tx(&mut self, _req: RequestDeliverTx) -> ResponseDeliverTx {
        self.txs += 1;
        ResponseDeliverTx {
            code: CODE_TYPE_OK,
            ..Default::default()
        }
    }

    fn commit(&mut self) -> ResponseCommit {
        self.app_hash = self.hash_of_count();
        ResponseCommit {
            data: self.app_hash.clone(),
            retain_height: 0,
        }
    }

    fn get_app_hash(&mut self, _req: RequestGetAppHash) -> ResponseGetAppHash {
        ResponseGetAppHash {
            app_hash: self.hash_of_count(),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    // a panic anywhere (e.g. a verified fraud proof) must take the whole
    // process down, not just the task it happened on
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(2);
    }));

    if let Err(e) = run().await {
        log::error!("startup failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config: NodeConfig = match &cli.config {
        Some(path) => load_config_from_file(path)?,
        None => NodeConfig::default(),
    };
    if cli.aggregator {
        config.aggregator = true;
    }
    if cli.light {
        config.light = true;
    }
    if config.da_layer.is_empty() {
        config.da_layer = "mock".to_string();
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    let genesis = GenesisDoc {
        chain_id: cli.chain_id,
        genesis_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
        validators: vec![GenesisValidator {
            pub_key: signing_key.verifying_key().to_bytes().to_vec(),
            power: 1,
            name: "local".to_string(),
        }],
        app_state: Vec::new(),
    };
    let client = LocalClient::new(CounterApp::default());

    if config.light {
        let node = LightNode::new(config, client, genesis)?;
        node.start().await?;
        wait_for_interrupt().await;
        node.stop().await?;
        return Ok(());
    }

    let rpc_listen = config.rpc.listen_address.clone();
    let node = FullNode::new(config, signing_key, client, genesis)?;
    node.start().await?;

    let rpc = Arc::new(RpcServer::new(node.rpc_context(), rpc_listen));
    rpc.start()?;

    wait_for_interrupt().await;
    rpc.stop().await;
    node.stop().await?;
    Ok(())
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for interrupt: {}", e);
    }
    log::info!("interrupt received, shutting down");
}
