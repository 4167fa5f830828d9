//! Block, header and commit types
//!
//! A block is an ordered pair of header and data. Headers are signed by
//! the aggregator and travel over gossip; block bodies travel through the
//! DA layer. The data root commits to the transaction list with a binary
//! Merkle tree.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use merkle_cbt::merkle_tree::{Merge, CBMT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{serialization, Hash, NamespaceId};

/// Opaque transaction bytes.
pub type Tx = Vec<u8>;

/// Block header gossiped between peers.
///
/// `app_hash` is the application hash obtained from `Commit` after the
/// block's transactions were executed, so the header for height `h` can
/// only be built once `h` is fully executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: u64,
    /// Unix time in milliseconds, non-decreasing along the chain
    pub time: u64,
    /// Hash of the previous block's header
    pub last_header_hash: Hash,
    /// Merkle root of the transaction list
    pub data_root: Hash,
    /// Application hash after committing this block
    pub app_hash: Vec<u8>,
    /// Ed25519 public key of the block proposer
    pub proposer_address: Vec<u8>,
    /// DA-layer namespace this block is submitted under
    pub namespace_id: NamespaceId,
}

impl Header {
    /// Hash of the versioned header encoding.
    pub fn hash(&self) -> Hash {
        let bytes = serialization::encode(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// Stateless sanity checks.
    pub fn validate_basic(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(anyhow!("header has empty chain id"));
        }
        if self.height == 0 {
            return Err(anyhow!("header height must be at least 1"));
        }
        if self.proposer_address.len() != 32 {
            return Err(anyhow!(
                "proposer address must be a 32-byte ed25519 public key, got {} bytes",
                self.proposer_address.len()
            ));
        }
        Ok(())
    }
}

/// Aggregator signature over a header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub height: u64,
    pub header_hash: Hash,
    /// Ed25519 signature over the header hash
    pub signature: Vec<u8>,
}

/// Header together with the aggregator commit; the unit stored by the
/// header store and published on the `headers` topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeader {
    pub header: Header,
    pub commit: Commit,
}

impl SignedHeader {
    /// Sign `header` with the aggregator key.
    pub fn new(header: Header, signing_key: &SigningKey) -> Self {
        let header_hash = header.hash();
        let signature = signing_key.sign(&header_hash);
        let commit = Commit {
            height: header.height,
            header_hash,
            signature: signature.to_bytes().to_vec(),
        };
        Self { header, commit }
    }

    /// Full verification: basic checks, commit/header agreement and the
    /// proposer's signature.
    pub fn verify(&self) -> Result<()> {
        self.header.validate_basic()?;
        if self.commit.height != self.header.height {
            return Err(anyhow!(
                "commit height {} does not match header height {}",
                self.commit.height,
                self.header.height
            ));
        }
        let header_hash = self.header.hash();
        if self.commit.header_hash != header_hash {
            return Err(anyhow!("commit does not reference this header"));
        }
        let key_bytes: [u8; 32] = self
            .header
            .proposer_address
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("malformed proposer public key"))?;
        let key = VerifyingKey::from_bytes(&key_bytes)?;
        let sig_bytes: [u8; 64] = self
            .commit
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("malformed header signature"))?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(&header_hash, &signature)
            .map_err(|e| anyhow!("invalid header signature: {}", e))
    }
}

/// Block body: the transaction list plus optional intermediate state
/// roots captured between execution steps when fraud proofs are enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub txs: Vec<Tx>,
    pub intermediate_state_roots: Vec<Vec<u8>>,
}

/// A complete block: the signed header plus the transaction data. The
/// aggregator signature travels with the block so a body retrieved from
/// the DA layer is verifiable on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub signed_header: SignedHeader,
    pub data: Data,
}

impl Block {
    pub fn header(&self) -> &Header {
        &self.signed_header.header
    }

    /// The block hash is the header hash.
    pub fn hash(&self) -> Hash {
        self.signed_header.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.signed_header.header.height
    }

    /// Full structural verification: header signature and data root.
    pub fn verify(&self) -> Result<()> {
        self.signed_header.verify()?;
        self.validate_data_root()
    }

    /// Check the header's data root against the body.
    pub fn validate_data_root(&self) -> Result<()> {
        let computed = compute_data_root(&self.data.txs);
        if computed != self.signed_header.header.data_root {
            return Err(anyhow!(
                "data root mismatch at height {}",
                self.height()
            ));
        }
        Ok(())
    }
}

struct MergeSha256;

impl Merge for MergeSha256 {
    type Item = Hash;

    fn merge(left: &Self::Item, right: &Self::Item) -> Self::Item {
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }
}

type DataRootTree = CBMT<Hash, MergeSha256>;

/// Merkle root committing to the ordered transaction list.
pub fn compute_data_root(txs: &[Tx]) -> Hash {
    let leaves: Vec<Hash> = txs
        .iter()
        .map(|tx| {
            let mut hasher = Sha256::new();
            hasher.update(tx);
            hasher.finalize().into()
        })
        .collect();
    DataRootTree::build_merkle_root(&leaves)
}
