//! Persistent block and state storage
//!
//! A transactional key-value abstraction with three logical families keyed
//! by height (`block:`, `state:`, `commit:`) plus a hash index
//! (`block-by-hash:`). All families are updated together in one atomic
//! batch when a block commits. A sled-backed store provides durability;
//! an in-memory variant exists for tests and diskless nodes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};

use crate::types::{serialization, Block, Commit, Hash, State};

const BLOCK_PREFIX: &[u8] = b"block:";
const BLOCK_BY_HASH_PREFIX: &[u8] = b"block-by-hash:";
const STATE_PREFIX: &[u8] = b"state:";
const COMMIT_PREFIX: &[u8] = b"commit:";
const META_HEIGHT_KEY: &[u8] = b"meta:height";

/// One operation of an atomic batch.
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Minimal transactional key-value interface the store is built on.
pub trait KVStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Apply all operations atomically.
    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}

/// Durable store backed by sled.
pub struct SledKVStore {
    db: sled::Db,
}

impl SledKVStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::default()
            .path(path.as_ref())
            .open()
            .with_context(|| format!("opening database at {:?}", path.as_ref()))?;
        Ok(Self { db })
    }
}

impl KVStore for SledKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.insert(key, value),
                BatchOp::Delete { key } => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }
}

/// In-memory store for tests and diskless runs.
#[derive(Default)]
pub struct InMemoryKVStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KVStore for InMemoryKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().unwrap().remove(key);
        Ok(())
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut map = self.map.write().unwrap();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

fn height_key(prefix: &[u8], height: u64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn hash_key(hash: &Hash) -> Vec<u8> {
    let mut key = BLOCK_BY_HASH_PREFIX.to_vec();
    key.extend_from_slice(hash);
    key
}

/// Block, state and commit storage over a [`KVStore`].
pub struct Store {
    kv: Arc<dyn KVStore>,
    height: AtomicU64,
}

impl Store {
    /// Open the store, resuming the persisted height if present.
    pub fn new(kv: Arc<dyn KVStore>) -> Result<Self> {
        let height = match kv.get(META_HEIGHT_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt height metadata"))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };
        Ok(Self {
            kv,
            height: AtomicU64::new(height),
        })
    }

    /// Height of the last committed block.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    /// Persist a committed block with its aggregator commit and the
    /// post-block state in one atomic batch.
    pub fn commit_block(&self, block: &Block, commit: &Commit, state: &State) -> Result<()> {
        let height = block.height();
        let hash = block.hash();

        let mut ops = vec![
            BatchOp::Put {
                key: height_key(BLOCK_PREFIX, height),
                value: serialization::encode(block)?,
            },
            BatchOp::Put {
                key: hash_key(&hash),
                value: height.to_be_bytes().to_vec(),
            },
            BatchOp::Put {
                key: height_key(COMMIT_PREFIX, height),
                value: serialization::encode(commit)?,
            },
            BatchOp::Put {
                key: height_key(STATE_PREFIX, height),
                value: serialization::encode(state)?,
            },
        ];
        let current = self.height();
        if height > current {
            ops.push(BatchOp::Put {
                key: META_HEIGHT_KEY.to_vec(),
                value: height.to_be_bytes().to_vec(),
            });
        }
        self.kv.apply_batch(ops)?;
        if height > current {
            self.height.store(height, Ordering::SeqCst);
        }
        log::debug!("committed block {} to store", height);
        Ok(())
    }

    pub fn load_block(&self, height: u64) -> Result<Block> {
        let bytes = self
            .kv
            .get(&height_key(BLOCK_PREFIX, height))?
            .ok_or_else(|| anyhow!("block not found at height {}", height))?;
        serialization::decode(&bytes)
    }

    pub fn load_block_by_hash(&self, hash: &Hash) -> Result<Block> {
        let bytes = self
            .kv
            .get(&hash_key(hash))?
            .ok_or_else(|| anyhow!("no block with hash {}", hex::encode(hash)))?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("corrupt block hash index"))?;
        self.load_block(u64::from_be_bytes(arr))
    }

    pub fn has_block(&self, height: u64) -> bool {
        matches!(self.kv.get(&height_key(BLOCK_PREFIX, height)), Ok(Some(_)))
    }

    pub fn load_commit(&self, height: u64) -> Result<Commit> {
        let bytes = self
            .kv
            .get(&height_key(COMMIT_PREFIX, height))?
            .ok_or_else(|| anyhow!("commit not found at height {}", height))?;
        serialization::decode(&bytes)
    }

    pub fn load_state(&self, height: u64) -> Result<State> {
        let bytes = self
            .kv
            .get(&height_key(STATE_PREFIX, height))?
            .ok_or_else(|| anyhow!("state not found at height {}", height))?;
        serialization::decode(&bytes)
    }

    /// State snapshot at the persisted height.
    pub fn load_latest_state(&self) -> Result<State> {
        self.load_state(self.height())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::types::{Data, Header, SignedHeader};

    use super::*;

    fn test_block(height: u64) -> (Block, Commit, State) {
        let header = Header {
            chain_id: "test".to_string(),
            height,
            time: 1000 + height,
            proposer_address: vec![0u8; 32],
            ..Default::default()
        };
        let commit = Commit {
            height,
            header_hash: header.hash(),
            signature: vec![0u8; 64],
        };
        let block = Block {
            signed_header: SignedHeader {
                header: header.clone(),
                commit: commit.clone(),
            },
            data: Data {
                txs: vec![vec![height as u8]],
                intermediate_state_roots: Vec::new(),
            },
        };
        let state = State {
            chain_id: "test".to_string(),
            height,
            last_header_hash: header.hash(),
            ..Default::default()
        };
        (block, commit, state)
    }

    #[test]
    fn test_commit_block_updates_all_families() {
        let store = Store::new(Arc::new(InMemoryKVStore::new())).unwrap();
        let (block, commit, state) = test_block(1);
        store.commit_block(&block, &commit, &state).unwrap();

        assert_eq!(store.height(), 1);
        assert_eq!(store.load_block(1).unwrap(), block);
        assert_eq!(store.load_block_by_hash(&block.hash()).unwrap(), block);
        assert_eq!(store.load_commit(1).unwrap(), commit);
        assert_eq!(store.load_state(1).unwrap(), state);
        assert_eq!(store.load_latest_state().unwrap(), state);
    }

    #[test]
    fn test_missing_heights_are_errors() {
        let store = Store::new(Arc::new(InMemoryKVStore::new())).unwrap();
        assert!(store.load_block(1).is_err());
        assert!(store.load_commit(1).is_err());
        assert!(store.load_state(1).is_err());
        assert!(!store.has_block(1));
    }

    #[test]
    fn test_height_is_monotonic() {
        let store = Store::new(Arc::new(InMemoryKVStore::new())).unwrap();
        for h in 1..=3 {
            let (block, commit, state) = test_block(h);
            store.commit_block(&block, &commit, &state).unwrap();
        }
        assert_eq!(store.height(), 3);

        // re-committing an older block must not move the height back
        let (block, commit, state) = test_block(2);
        store.commit_block(&block, &commit, &state).unwrap();
        assert_eq!(store.height(), 3);
    }

    #[test]
    fn test_sled_store_resumes_height_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = Arc::new(SledKVStore::open(dir.path()).unwrap());
            let store = Store::new(kv).unwrap();
            let (block, commit, state) = test_block(1);
            store.commit_block(&block, &commit, &state).unwrap();
            let (block, commit, state) = test_block(2);
            store.commit_block(&block, &commit, &state).unwrap();
        }

        let kv = Arc::new(SledKVStore::open(dir.path()).unwrap());
        let store = Store::new(kv).unwrap();
        assert_eq!(store.height(), 2);
        assert_eq!(store.load_block(2).unwrap().height(), 2);
        assert_eq!(store.load_latest_state().unwrap().height, 2);
    }
}
