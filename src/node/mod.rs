//! Node assembly
//!
//! Wires the ACI connections, store, gossip client, header exchange, DA
//! adapter and block manager into a runnable full or light node with a
//! cooperative lifecycle: one shutdown signal gates every long-running
//! task, and `stop` cancels and joins in reverse dependency order.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;

use crate::aci::types::{FraudProof, RequestVerifyFraudProof};
use crate::aci::{AppConns, LocalClient};
use crate::config::NodeConfig;
use crate::p2p::GossipValidator;
use crate::types::{serialization, GenesisDoc, Hash};

pub mod full;
pub mod light;

pub use full::FullNode;
pub use light::LightNode;

/// Common lifecycle of full and light nodes.
#[async_trait]
pub trait Node: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

/// Build the node matching the configured profile.
pub fn new_node(
    config: NodeConfig,
    signing_key: SigningKey,
    client: LocalClient,
    genesis: GenesisDoc,
) -> Result<Arc<dyn Node>> {
    if config.light {
        Ok(LightNode::new(config, client, genesis)?)
    } else {
        Ok(FullNode::new(config, signing_key, client, genesis)?)
    }
}

pub(crate) fn parse_trusted_hash(config: &NodeConfig) -> Result<Option<Hash>> {
    if config.trusted_hash.is_empty() {
        return Ok(None);
    }
    let bytes = hex::decode(&config.trusted_hash)?;
    let hash: Hash = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("trusted hash must be 32 bytes"))?;
    Ok(Some(hash))
}

/// Validator that always rejects; installed on `txs` and `headers` by the
/// light profile.
pub(crate) fn false_validator() -> GossipValidator {
    Box::new(|_msg| false)
}

/// Validator for the fraud-proof topic. A proof the application verifies
/// as valid is terminal evidence that the local chain view is invalid,
/// so the node halts on the spot.
pub(crate) fn fraud_proof_validator(conns: AppConns) -> GossipValidator {
    Box::new(move |msg| {
        let proof: FraudProof = match serialization::decode(&msg.data) {
            Ok(proof) => proof,
            Err(e) => {
                log::debug!("undecodable fraud proof from {}: {}", msg.from, e);
                return false;
            }
        };
        log::info!(
            "fraud proof received from {} for block {} ({} bytes)",
            msg.from,
            proof.block_height,
            msg.data.len()
        );
        let expected_valid_app_hash = proof.expected_valid_app_hash.clone();
        match conns.consensus().verify_fraud_proof_sync(RequestVerifyFraudProof {
            fraud_proof: proof,
            expected_valid_app_hash,
        }) {
            Ok(response) if response.success => {
                panic!("received valid fraud proof: halting node");
            }
            Ok(_) => false,
            Err(e) => {
                log::error!("fraud proof verification failed: {}", e);
                false
            }
        }
    })
}
