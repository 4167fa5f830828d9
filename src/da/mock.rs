//! In-memory DA layer
//!
//! Stores submitted blocks in a shared map keyed by DA height. Cloning
//! the mock shares its storage, so several nodes in a test see one DA
//! network the way real nodes share an availability chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::store::KVStore;
use crate::types::{serialization, Block, NamespaceId};

use super::{
    DataAvailabilityLayerClient, ResultRetrieveBlocks, ResultSubmitBlock, StatusCode,
};

struct MockDaInner {
    namespace: NamespaceId,
    /// Serialized blocks per DA height
    blocks: HashMap<u64, Vec<Vec<u8>>>,
    /// Next DA height a submission lands on
    da_height: u64,
}

/// Shared in-memory DA network.
#[derive(Clone)]
pub struct MockDaLayer {
    inner: Arc<Mutex<MockDaInner>>,
}

impl MockDaLayer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockDaInner {
                namespace: NamespaceId::default(),
                blocks: HashMap::new(),
                da_height: 1,
            })),
        }
    }

    /// Highest DA height that has data.
    pub fn da_height(&self) -> u64 {
        self.inner.lock().unwrap().da_height
    }
}

impl Default for MockDaLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataAvailabilityLayerClient for MockDaLayer {
    fn init(&self, namespace: NamespaceId, _config: &[u8], _kv: Arc<dyn KVStore>) -> Result<()> {
        self.inner.lock().unwrap().namespace = namespace;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        log::debug!("mock DA layer started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        log::debug!("mock DA layer stopped");
        Ok(())
    }

    async fn submit_block(&self, block: &Block) -> ResultSubmitBlock {
        let bytes = match serialization::encode(block) {
            Ok(bytes) => bytes,
            Err(e) => return ResultSubmitBlock::error(e.to_string()),
        };
        let mut inner = self.inner.lock().unwrap();
        let height = inner.da_height;
        inner.blocks.entry(height).or_default().push(bytes);
        inner.da_height += 1;
        log::debug!(
            "mock DA stored block {} at DA height {}",
            block.height(),
            height
        );
        ResultSubmitBlock::success()
    }

    async fn retrieve_blocks(&self, da_height: u64) -> ResultRetrieveBlocks {
        let inner = self.inner.lock().unwrap();
        if da_height >= inner.da_height {
            return ResultRetrieveBlocks {
                code: StatusCode::NotFound,
                message: format!("no data at DA height {}", da_height),
                blocks: Vec::new(),
            };
        }
        let mut blocks = Vec::new();
        for bytes in inner.blocks.get(&da_height).into_iter().flatten() {
            match serialization::decode::<Block>(bytes) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    return ResultRetrieveBlocks {
                        code: StatusCode::Error,
                        message: e.to_string(),
                        blocks: Vec::new(),
                    }
                }
            }
        }
        ResultRetrieveBlocks {
            code: StatusCode::Success,
            message: String::new(),
            blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::store::InMemoryKVStore;
    use crate::types::{Data, Header, SignedHeader};

    use super::*;

    fn test_block(height: u64) -> Block {
        Block {
            signed_header: SignedHeader {
                header: Header {
                    chain_id: "test".to_string(),
                    height,
                    proposer_address: vec![0u8; 32],
                    ..Default::default()
                },
                commit: Default::default(),
            },
            data: Data::default(),
        }
    }

    #[tokio::test]
    async fn test_submit_then_retrieve() {
        let da = MockDaLayer::new();
        da.init(
            NamespaceId([1, 2, 3, 4, 5, 6, 7, 8]),
            &[],
            Arc::new(InMemoryKVStore::new()),
        )
        .unwrap();
        da.start().await.unwrap();

        let block = test_block(1);
        let submit = da.submit_block(&block).await;
        assert_eq!(submit.code, StatusCode::Success);

        let retrieved = da.retrieve_blocks(1).await;
        assert_eq!(retrieved.code, StatusCode::Success);
        assert_eq!(retrieved.blocks, vec![block]);
    }

    #[tokio::test]
    async fn test_future_da_height_is_not_found() {
        let da = MockDaLayer::new();
        let result = da.retrieve_blocks(1).await;
        assert_eq!(result.code, StatusCode::NotFound);
        assert!(result.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let da = MockDaLayer::new();
        let shared = da.clone();

        da.submit_block(&test_block(1)).await;
        let result = shared.retrieve_blocks(1).await;
        assert_eq!(result.code, StatusCode::Success);
        assert_eq!(result.blocks.len(), 1);
    }
}
