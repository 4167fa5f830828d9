//! Full node
//!
//! Runs every subsystem: ACI connections, store, gossip, header
//! exchange, DA adapter, block manager and the RPC ingress context. In
//! aggregator mode it produces blocks; otherwise it syncs from gossip
//! and the DA layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aci::types::{CheckTxKind, RequestCheckTx, CODE_TYPE_OK};
use crate::aci::{AppConns, LocalClient};
use crate::config::{db_dir, NodeConfig};
use crate::da::{new_da_client, DataAvailabilityLayerClient};
use crate::header_exchange::{HeaderExchangeService, HeaderStore};
use crate::manager::{AggregatorMode, BlockManager};
use crate::mempool::Mempool;
use crate::p2p::{GossipClient, HEADER_TOPIC, TX_TOPIC, FRAUD_PROOF_TOPIC};
use crate::rpc::RpcContext;
use crate::store::{InMemoryKVStore, KVStore, SledKVStore, Store};
use crate::types::{serialization, GenesisDoc, SignedHeader};

use super::{fraud_proof_validator, parse_trusted_hash, Node};

const MEMPOOL_CAPACITY: usize = 10_000;

pub struct FullNode {
    config: NodeConfig,
    conns: AppConns,
    store: Arc<Store>,
    mempool: Arc<Mempool>,
    p2p: Arc<GossipClient>,
    header_service: Arc<HeaderExchangeService>,
    da: Arc<dyn DataAvailabilityLayerClient>,
    manager: Arc<BlockManager>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl FullNode {
    /// Build a full node, resolving the DA adapter from the registry.
    pub fn new(
        config: NodeConfig,
        signing_key: SigningKey,
        client: LocalClient,
        genesis: GenesisDoc,
    ) -> Result<Arc<Self>> {
        let da = new_da_client(&config.da_layer)?;
        Self::with_da(config, signing_key, client, genesis, da)
    }

    /// Build a full node around a caller-provided DA client. Tests use
    /// this to share one mock DA network between several nodes.
    pub fn with_da(
        config: NodeConfig,
        signing_key: SigningKey,
        client: LocalClient,
        genesis: GenesisDoc,
        da: Arc<dyn DataAvailabilityLayerClient>,
    ) -> Result<Arc<Self>> {
        let kv: Arc<dyn KVStore> = if config.in_memory() {
            log::info!("working in in-memory mode");
            Arc::new(InMemoryKVStore::new())
        } else {
            Arc::new(SledKVStore::open(db_dir(&config).join("lamina"))?)
        };
        let store = Arc::new(Store::new(kv.clone())?);
        let conns = AppConns::new(client);
        let mempool = Arc::new(Mempool::new(MEMPOOL_CAPACITY));

        let p2p = GossipClient::new(config.p2p.clone(), genesis.chain_id.clone());
        let trusted_hash = parse_trusted_hash(&config)?;
        let header_service = Arc::new(HeaderExchangeService::new(
            p2p.clone(),
            genesis.chain_id.clone(),
            trusted_hash,
        ));

        da.init(
            config.block_manager.namespace_id,
            config.da_config.as_bytes(),
            kv,
        )
        .context("initializing DA adapter")?;

        // gossiped transactions enter the mempool through CheckTx
        let tx_conns = conns.clone();
        let tx_mempool = mempool.clone();
        p2p.set_validator(
            TX_TOPIC,
            Box::new(move |msg| {
                let check = tx_conns.mempool().check_tx_sync(RequestCheckTx {
                    tx: msg.data.clone(),
                    kind: CheckTxKind::New,
                });
                match check {
                    Ok(res) if res.code == CODE_TYPE_OK => {
                        match tx_mempool.push(msg.data.clone()) {
                            Ok(_) => true,
                            Err(e) => {
                                log::warn!("transaction dropped: {}", e);
                                false
                            }
                        }
                    }
                    Ok(res) => {
                        log::debug!("CheckTx rejected gossiped transaction: code {}", res.code);
                        false
                    }
                    Err(e) => {
                        log::error!("CheckTx failed: {}", e);
                        false
                    }
                }
            }),
        );

        // headers must verify before delivery
        let header_chain_id = genesis.chain_id.clone();
        p2p.set_validator(
            HEADER_TOPIC,
            Box::new(move |msg| {
                let signed_header: SignedHeader = match serialization::decode(&msg.data) {
                    Ok(sh) => sh,
                    Err(e) => {
                        log::debug!("undecodable header from {}: {}", msg.from, e);
                        return false;
                    }
                };
                if signed_header.header.chain_id != header_chain_id {
                    return false;
                }
                match signed_header.verify() {
                    Ok(()) => true,
                    Err(e) => {
                        log::debug!("invalid header from {}: {}", msg.from, e);
                        false
                    }
                }
            }),
        );

        p2p.set_validator(FRAUD_PROOF_TOPIC, fraud_proof_validator(conns.clone()));

        let mode = if config.lazy_aggregator {
            AggregatorMode::Lazy
        } else if config.progressive_sequencer {
            AggregatorMode::Progressive
        } else {
            AggregatorMode::Interval
        };
        let manager = Arc::new(BlockManager::new(
            config.aggregator.then_some(signing_key),
            config.block_manager.clone(),
            mode,
            config.fraud_proofs,
            genesis,
            store.clone(),
            conns.clone(),
            da.clone(),
            header_service.clone(),
            p2p.clone(),
            mempool.clone(),
        )?);

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            conns,
            store,
            mempool,
            p2p,
            header_service,
            da,
            manager,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn mempool(&self) -> Arc<Mempool> {
        self.mempool.clone()
    }

    pub fn manager(&self) -> Arc<BlockManager> {
        self.manager.clone()
    }

    pub fn header_store(&self) -> Arc<HeaderStore> {
        self.header_service.store()
    }

    pub fn p2p(&self) -> Arc<GossipClient> {
        self.p2p.clone()
    }

    pub fn conns(&self) -> AppConns {
        self.conns.clone()
    }

    /// Handles the RPC ingress needs to serve transactions.
    pub fn rpc_context(&self) -> RpcContext {
        RpcContext {
            conns: self.conns.clone(),
            mempool: self.mempool.clone(),
            manager: self.manager.clone(),
            p2p: self.p2p.clone(),
            progressive_sequencer: self.config.progressive_sequencer,
        }
    }
}

#[async_trait]
impl Node for FullNode {
    async fn start(&self) -> Result<()> {
        self.p2p.start().await?;
        self.header_service.start().await?;
        self.da.start().await?;

        let mut tasks = self.tasks.lock().unwrap();
        if self.config.aggregator {
            tasks.push(tokio::spawn(
                self.manager.clone().aggregation_loop(self.shutdown.subscribe()),
            ));
            tasks.push(tokio::spawn(
                self.manager
                    .clone()
                    .da_submission_loop(self.shutdown.subscribe()),
            ));
        } else {
            tasks.push(tokio::spawn(
                self.manager.clone().sync_loop(self.shutdown.subscribe()),
            ));
        }
        drop(tasks);

        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "full node started (aggregator: {}, height: {})",
            self.config.aggregator,
            self.store.height()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        log::info!("halting full node...");
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    log::error!("node task failed: {}", e);
                }
            }
        }
        self.header_service.stop().await;
        if let Err(e) = self.da.stop().await {
            log::error!("error stopping DA adapter: {}", e);
        }
        self.p2p.close().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
