//! Data availability adapter interface
//!
//! The node treats the DA layer as an external collaborator behind this
//! interface: blocks are submitted under the chain's namespace and
//! retrieved by DA height. Submission is eventually consistent; the
//! block manager retries on `Error` and treats `NotFound` as "not yet"
//! during retrieval.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::store::KVStore;
use crate::types::{Block, NamespaceId};

pub mod mock;

pub use mock::MockDaLayer;

/// Outcome of a DA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    NotFound,
    Error,
}

/// Result of a block submission.
#[derive(Debug, Clone)]
pub struct ResultSubmitBlock {
    pub code: StatusCode,
    pub message: String,
}

impl ResultSubmitBlock {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: message.into(),
        }
    }
}

/// Result of a retrieval at one DA height.
#[derive(Debug, Clone)]
pub struct ResultRetrieveBlocks {
    pub code: StatusCode,
    pub message: String,
    pub blocks: Vec<Block>,
}

/// Pluggable client of the data availability layer.
#[async_trait]
pub trait DataAvailabilityLayerClient: Send + Sync {
    /// Read configuration and bind resources. Called once before `start`.
    fn init(&self, namespace: NamespaceId, config: &[u8], kv: Arc<dyn KVStore>) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Submit a block to the DA layer.
    async fn submit_block(&self, block: &Block) -> ResultSubmitBlock;

    /// Retrieve all rollup blocks stored at the given DA height.
    async fn retrieve_blocks(&self, da_height: u64) -> ResultRetrieveBlocks;
}

/// Instantiate a DA client by its configured name.
pub fn new_da_client(name: &str) -> Result<Arc<dyn DataAvailabilityLayerClient>> {
    match name {
        "mock" => Ok(Arc::new(MockDaLayer::new())),
        other => Err(anyhow!("unknown DA layer: {:?}", other)),
    }
}
