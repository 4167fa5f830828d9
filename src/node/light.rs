//! Light node
//!
//! Runs only the gossip client and the header exchange. Transaction and
//! header gossip are rejected outright; the single job of the light
//! profile is to track headers it is told about and to verify fraud
//! proofs, halting if one checks out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::aci::{AppConns, LocalClient};
use crate::config::NodeConfig;
use crate::header_exchange::{HeaderExchangeService, HeaderStore};
use crate::p2p::{GossipClient, FRAUD_PROOF_TOPIC, HEADER_TOPIC, TX_TOPIC};
use crate::types::GenesisDoc;

use super::{false_validator, fraud_proof_validator, parse_trusted_hash, Node};

pub struct LightNode {
    conns: AppConns,
    p2p: Arc<GossipClient>,
    header_service: Arc<HeaderExchangeService>,
    running: AtomicBool,
}

impl LightNode {
    pub fn new(
        config: NodeConfig,
        client: LocalClient,
        genesis: GenesisDoc,
    ) -> Result<Arc<Self>> {
        let conns = AppConns::new(client);
        let p2p = GossipClient::new(config.p2p.clone(), genesis.chain_id.clone());
        let trusted_hash = parse_trusted_hash(&config)?;
        let header_service = Arc::new(HeaderExchangeService::new(
            p2p.clone(),
            genesis.chain_id,
            trusted_hash,
        ));

        p2p.set_validator(TX_TOPIC, false_validator());
        p2p.set_validator(HEADER_TOPIC, false_validator());
        p2p.set_validator(FRAUD_PROOF_TOPIC, fraud_proof_validator(conns.clone()));

        Ok(Arc::new(Self {
            conns,
            p2p,
            header_service,
            running: AtomicBool::new(false),
        }))
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
}

#[async_trait]
impl Node for LightNode {
    async fn start(&self) -> Result<()> {
        self.p2p.start().await?;
        self.header_service.start().await?;
        self.running.store(true, Ordering::SeqCst);
        log::info!("light node started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        log::info!("halting light node...");
        self.header_service.stop().await;
        self.p2p.close().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
