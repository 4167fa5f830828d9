//! Core chain types shared by every subsystem
//!
//! Blocks, headers, replicated state and the genesis document, together
//! with the versioned binary encoding used on the wire and on disk.

use serde::{Deserialize, Serialize};

pub mod block;
pub mod serialization;
pub mod state;

pub use block::{Block, Commit, Data, Header, SignedHeader, Tx};
pub use state::State;

/// 32-byte hash used for headers, blocks and transaction roots.
pub type Hash = [u8; 32];

/// 8-byte tag segregating this rollup's data on the DA layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(pub [u8; 8]);

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Validator entry carried in the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Ed25519 public key bytes
    pub pub_key: Vec<u8>,
    /// Voting power
    pub power: u64,
}

/// Consensus parameters advanced with the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Maximum block size in bytes
    pub block_max_bytes: u64,
    /// Maximum gas per block (0 = unlimited)
    pub block_max_gas: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            block_max_bytes: 1024 * 1024,
            block_max_gas: 0,
        }
    }
}

/// Genesis validator entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pub_key: Vec<u8>,
    pub power: u64,
    #[serde(default)]
    pub name: String,
}

/// Genesis document describing the chain to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    /// Unix time in milliseconds
    #[serde(default)]
    pub genesis_time: u64,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    /// Opaque application state handed to `InitChain`
    #[serde(default)]
    pub app_state: Vec<u8>,
}
