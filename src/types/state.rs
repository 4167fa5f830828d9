//! Replicated node state
//!
//! The value advanced atomically with each committed block.

use serde::{Deserialize, Serialize};

use super::{ConsensusParams, GenesisDoc, Hash, Validator};

/// State after committing the block at `height`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub chain_id: String,
    /// Height of the last committed block (0 before the first block)
    pub height: u64,
    /// Time of the last committed block, unix milliseconds
    pub last_block_time: u64,
    /// Application hash after the last commit
    pub app_hash: Vec<u8>,
    /// Hash of the last committed block's header
    pub last_header_hash: Hash,
    pub validators: Vec<Validator>,
    pub consensus_params: ConsensusParams,
}

impl State {
    /// Initial state derived from the genesis document, before any block
    /// has been committed.
    pub fn from_genesis(genesis: &GenesisDoc) -> Self {
        Self {
            chain_id: genesis.chain_id.clone(),
            height: 0,
            last_block_time: genesis.genesis_time,
            app_hash: Vec::new(),
            last_header_hash: [0u8; 32],
            validators: genesis
                .validators
                .iter()
                .map(|v| Validator {
                    pub_key: v.pub_key.clone(),
                    power: v.power,
                })
                .collect(),
            consensus_params: ConsensusParams::default(),
        }
    }
}
