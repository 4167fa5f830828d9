//! Block manager
//!
//! Drives the chain forward. An aggregator produces blocks on a timer,
//! executes them through the consensus connection, persists them
//! atomically, gossips the signed header and queues the body for DA
//! submission. A non-aggregator consumes headers from gossip and bodies
//! from the DA layer, re-executes every block in strict height order and
//! halts (or produces a fraud proof) when the application hash diverges.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::SigningKey;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::aci::types::*;
use crate::aci::AppConns;
use crate::config::BlockManagerConfig;
use crate::da::{DataAvailabilityLayerClient, StatusCode};
use crate::header_exchange::{HeaderExchangeService, HeaderStore};
use crate::mempool::Mempool;
use crate::p2p::{GossipClient, FRAUD_PROOF_TOPIC};
use crate::store::Store;
use crate::types::block::compute_data_root;
use crate::types::{serialization, Block, Data, GenesisDoc, Header, SignedHeader, State, Tx};

/// Out-of-order blocks buffered beyond this window are dropped; the DA
/// layer will re-serve them once the gap closes.
const SYNC_CACHE_WINDOW: u64 = 100;
/// DA submission attempts per cadence tick before the height is retried
/// on the next tick.
const DA_SUBMIT_ATTEMPTS: u32 = 5;
const DA_SUBMIT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DA_SUBMIT_MAX_BACKOFF: Duration = Duration::from_secs(2);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Production mode of an aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorMode {
    /// Produce a block every interval, empty or not
    Interval,
    /// Produce the first block, then only when the mempool is non-empty
    Lazy,
    /// Produce only when the mempool is non-empty
    Progressive,
}

struct Execution {
    app_hash: Vec<u8>,
    isrs: Vec<Vec<u8>>,
}

/// The state machine at the center of a node.
pub struct BlockManager {
    signing_key: Option<SigningKey>,
    config: BlockManagerConfig,
    mode: AggregatorMode,
    fraud_proofs: bool,
    genesis: GenesisDoc,
    store: Arc<Store>,
    state: Mutex<State>,
    conns: AppConns,
    da: Arc<dyn DataAvailabilityLayerClient>,
    header_service: Arc<HeaderExchangeService>,
    header_store: Arc<HeaderStore>,
    p2p: Arc<GossipClient>,
    mempool: Arc<Mempool>,
    /// Heights committed locally but not yet on the DA layer
    da_pending: Mutex<VecDeque<u64>>,
    /// Next DA height to poll during sync
    da_retrieve_height: AtomicU64,
    /// Out-of-order bodies waiting for their predecessors
    sync_cache: Mutex<HashMap<u64, Block>>,
    height_tx: watch::Sender<u64>,
    halted: AtomicBool,
}

impl BlockManager {
    /// Initialize the manager: query `Info`, run `InitChain` on a fresh
    /// chain or resume from the persisted state snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signing_key: Option<SigningKey>,
        config: BlockManagerConfig,
        mode: AggregatorMode,
        fraud_proofs: bool,
        genesis: GenesisDoc,
        store: Arc<Store>,
        conns: AppConns,
        da: Arc<dyn DataAvailabilityLayerClient>,
        header_service: Arc<HeaderExchangeService>,
        p2p: Arc<GossipClient>,
        mempool: Arc<Mempool>,
    ) -> Result<Self> {
        let info = conns.consensus().info_sync(RequestInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
        })?;
        log::info!(
            "application info: version={:?} last_height={}",
            info.version,
            info.last_block_height
        );

        let state = if store.height() > 0 {
            store
                .load_latest_state()
                .context("resuming from persisted state")?
        } else if info.last_block_height == 0 {
            let response = conns.consensus().init_chain_sync(RequestInitChain {
                time: genesis.genesis_time,
                chain_id: genesis.chain_id.clone(),
                consensus_params: Default::default(),
                validators: genesis
                    .validators
                    .iter()
                    .map(|v| crate::types::Validator {
                        pub_key: v.pub_key.clone(),
                        power: v.power,
                    })
                    .collect(),
                app_state_bytes: genesis.app_state.clone(),
            })?;
            let mut state = State::from_genesis(&genesis);
            if !response.app_hash.is_empty() {
                state.app_hash = response.app_hash;
            }
            if let Some(params) = response.consensus_params {
                state.consensus_params = params;
            }
            if !response.validators.is_empty() {
                state.validators = response.validators;
            }
            state
        } else {
            return Err(anyhow!(
                "application is at height {} but the store is empty",
                info.last_block_height
            ));
        };

        let header_store = header_service.store();
        let (height_tx, _) = watch::channel(store.height());
        Ok(Self {
            signing_key,
            config,
            mode,
            fraud_proofs,
            genesis,
            store,
            state: Mutex::new(state),
            conns,
            da,
            header_service,
            header_store,
            p2p,
            mempool,
            da_pending: Mutex::new(VecDeque::new()),
            da_retrieve_height: AtomicU64::new(1),
            sync_cache: Mutex::new(HashMap::new()),
            height_tx,
            halted: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn mempool(&self) -> Arc<Mempool> {
        self.mempool.clone()
    }

    /// Watch channel tracking the locally committed height.
    pub fn subscribe_height(&self) -> watch::Receiver<u64> {
        self.height_tx.subscribe()
    }

    /// Whether an invariant violation stopped this node.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Block until `tx` appears in a committed block; returns the height.
    pub async fn wait_for_tx_inclusion(&self, tx: Tx) -> Result<u64> {
        let mut heights = self.height_tx.subscribe();
        let mut scanned: u64 = 0;
        loop {
            let current = *heights.borrow();
            for height in (scanned + 1)..=current {
                if let Ok(block) = self.store.load_block(height) {
                    if block.data.txs.iter().any(|t| *t == tx) {
                        return Ok(height);
                    }
                }
            }
            scanned = current;
            heights
                .changed()
                .await
                .context("block manager stopped while waiting for inclusion")?;
        }
    }

    // ---- production (aggregator) ------------------------------------

    /// Timer-driven block production.
    pub async fn aggregation_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.block_time,
            self.config.block_time,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }
            if self.is_halted() {
                return;
            }
            let produce = match self.mode {
                AggregatorMode::Interval => true,
                AggregatorMode::Lazy => self.store.height() == 0 || !self.mempool.is_empty(),
                AggregatorMode::Progressive => !self.mempool.is_empty(),
            };
            if !produce {
                continue;
            }
            if let Err(e) = self.publish_block().await {
                log::error!("failed to produce block: {:#}", e);
            }
        }
    }

    /// Produce, execute, persist and publish one block.
    async fn publish_block(&self) -> Result<()> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| anyhow!("this node has no signing key"))?;

        let (height, last_header_hash, last_time, validators, consensus_params) = {
            let state = self.state.lock().unwrap();
            (
                state.height + 1,
                state.last_header_hash,
                state.last_block_time,
                state.validators.clone(),
                state.consensus_params.clone(),
            )
        };
        let txs = self.mempool.reap(self.config.block_max_txs);
        log::info!("creating block {} with {} transactions", height, txs.len());

        let mut header = Header {
            chain_id: self.genesis.chain_id.clone(),
            height,
            time: unix_millis().max(last_time),
            last_header_hash,
            data_root: compute_data_root(&txs),
            app_hash: Vec::new(),
            proposer_address: signing_key.verifying_key().to_bytes().to_vec(),
            namespace_id: self.config.namespace_id,
        };

        // A transaction from our own mempool failing DeliverTx aborts the
        // whole block.
        let execution = self.execute_transitions(&header, &txs, true)?;
        header.app_hash = execution.app_hash.clone();

        let signed_header = SignedHeader::new(header, signing_key);
        let block = Block {
            signed_header: signed_header.clone(),
            data: Data {
                txs,
                intermediate_state_roots: execution.isrs,
            },
        };

        let new_state = State {
            chain_id: self.genesis.chain_id.clone(),
            height,
            last_block_time: block.header().time,
            app_hash: execution.app_hash,
            last_header_hash: block.hash(),
            validators,
            consensus_params,
        };
        self.store
            .commit_block(&block, &signed_header.commit, &new_state)?;
        *self.state.lock().unwrap() = new_state;

        self.header_service.broadcast(&signed_header).await?;
        self.da_pending.lock().unwrap().push_back(height);
        self.height_tx.send_replace(height);
        Ok(())
    }

    /// BeginBlock, DeliverTx*, EndBlock, Commit; captures intermediate
    /// state roots between steps when fraud proofs are enabled.
    fn execute_transitions(
        &self,
        header: &Header,
        txs: &[Tx],
        abort_on_tx_failure: bool,
    ) -> Result<Execution> {
        let consensus = self.conns.consensus();
        consensus.begin_block_sync(RequestBeginBlock {
            hash: header.hash().to_vec(),
            header: header.clone(),
        })?;

        let mut isrs = Vec::new();
        if self.fraud_proofs {
            isrs.push(self.get_app_hash()?);
        }
        for tx in txs {
            let reqres = consensus.deliver_tx_async(RequestDeliverTx { tx: tx.clone() });
            let response = reqres.wait();
            let code = response
                .as_deliver_tx()
                .map(|r| r.code)
                .ok_or_else(|| anyhow!("unexpected {} response to DeliverTx", response.kind()))?;
            if code != CODE_TYPE_OK {
                log::warn!(
                    "transaction in block {} returned code {}",
                    header.height,
                    code
                );
                if abort_on_tx_failure {
                    return Err(anyhow!("own transaction rejected with code {}", code));
                }
            }
            if self.fraud_proofs {
                isrs.push(self.get_app_hash()?);
            }
        }
        consensus.end_block_sync(RequestEndBlock {
            height: header.height,
        })?;
        if self.fraud_proofs {
            isrs.push(self.get_app_hash()?);
        }
        let commit = consensus.commit_sync()?;
        Ok(Execution {
            app_hash: commit.data,
            isrs,
        })
    }

    fn get_app_hash(&self) -> Result<Vec<u8>> {
        Ok(self
            .conns
            .consensus()
            .get_app_hash_sync(RequestGetAppHash {})?
            .app_hash)
    }

    // ---- DA submission ----------------------------------------------

    /// Submit pending heights to the DA layer on the configured cadence.
    pub async fn da_submission_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.da_block_time,
            self.config.da_block_time,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }
            self.submit_pending_to_da().await;
        }
    }

    /// Drain the pending queue in order. A height that keeps failing
    /// stays at the front so submission order is preserved.
    async fn submit_pending_to_da(&self) {
        loop {
            let next = self.da_pending.lock().unwrap().front().copied();
            let Some(height) = next else { return };
            let block = match self.store.load_block(height) {
                Ok(block) => block,
                Err(e) => {
                    log::error!("pending block {} unavailable: {}", height, e);
                    self.da_pending.lock().unwrap().pop_front();
                    continue;
                }
            };

            let mut backoff = DA_SUBMIT_INITIAL_BACKOFF;
            let mut submitted = false;
            for attempt in 1..=DA_SUBMIT_ATTEMPTS {
                let result = self.da.submit_block(&block).await;
                match result.code {
                    StatusCode::Success => {
                        log::info!("block {} submitted to DA layer", height);
                        submitted = true;
                        break;
                    }
                    _ => {
                        log::warn!(
                            "DA submission of block {} failed (attempt {}): {}",
                            height,
                            attempt,
                            result.message
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(DA_SUBMIT_MAX_BACKOFF);
                    }
                }
            }
            if !submitted {
                // retry on the next cadence tick
                return;
            }
            self.da_pending.lock().unwrap().pop_front();
        }
    }

    // ---- sync (non-aggregator) --------------------------------------

    /// Consume headers from gossip and bodies from the DA layer.
    pub async fn sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut header_heights = self.header_store.subscribe_height();
        let mut da_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.da_block_time,
            self.config.da_block_time,
        );
        da_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                changed = header_heights.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = da_interval.tick() => {
                    self.retrieve_from_da().await;
                }
            }
            if let Err(e) = self.try_apply_cached().await {
                log::error!("chain halted: {:#}", e);
                return;
            }
        }
    }

    async fn retrieve_from_da(&self) {
        loop {
            let da_height = self.da_retrieve_height.load(Ordering::SeqCst);
            let result = self.da.retrieve_blocks(da_height).await;
            match result.code {
                StatusCode::Success => {
                    for block in result.blocks {
                        self.cache_block(block);
                    }
                    self.da_retrieve_height.store(da_height + 1, Ordering::SeqCst);
                }
                StatusCode::NotFound => return,
                StatusCode::Error => {
                    log::warn!(
                        "DA retrieval at height {} failed: {}",
                        da_height,
                        result.message
                    );
                    return;
                }
            }
        }
    }

    /// Buffer a body for ordered application, dropping duplicates,
    /// blocks outside the reorder window and bodies that contradict the
    /// gossiped header at their height.
    fn cache_block(&self, block: Block) {
        let height = block.height();
        let committed = self.store.height();
        if height <= committed {
            return;
        }
        if height > committed + SYNC_CACHE_WINDOW {
            log::debug!(
                "dropping block {} outside the sync window (committed {})",
                height,
                committed
            );
            return;
        }
        if let Err(e) = block.verify() {
            log::warn!("invalid block {} from DA: {}", height, e);
            return;
        }
        if height == 1 {
            if let Some(trusted) = self.header_store.trusted_hash() {
                if block.hash() != trusted {
                    log::warn!("dropping height-1 block that does not match the trusted hash");
                    return;
                }
            }
        }
        // the DA body is authoritative for the bytes, but must agree with
        // the header seen on gossip
        if let Some(gossiped) = self.header_store.get(height) {
            if gossiped.header.hash() != block.hash() {
                log::warn!(
                    "discarding DA body at height {} contradicting the gossiped header",
                    height
                );
                return;
            }
        }
        self.sync_cache.lock().unwrap().entry(height).or_insert(block);
    }

    /// Apply buffered blocks in strict height order, exactly once each.
    async fn try_apply_cached(&self) -> Result<()> {
        loop {
            let next_height = self.store.height() + 1;
            let block = self.sync_cache.lock().unwrap().remove(&next_height);
            let Some(block) = block else { return Ok(()) };
            match self.apply_block(&block).await {
                Ok(()) => {}
                Err(e) if self.is_halted() => return Err(e),
                Err(e) => {
                    log::warn!("failed to apply block {}: {:#}", block.height(), e);
                    return Ok(());
                }
            }
        }
    }

    /// Re-execute a block received from the network and persist it if the
    /// resulting application hash matches the header.
    async fn apply_block(&self, block: &Block) -> Result<()> {
        let (expected_height, last_header_hash, validators, consensus_params) = {
            let state = self.state.lock().unwrap();
            (
                state.height + 1,
                state.last_header_hash,
                state.validators.clone(),
                state.consensus_params.clone(),
            )
        };
        let header = block.header();
        if header.height != expected_height {
            return Err(anyhow!(
                "expected height {}, block is at {}",
                expected_height,
                header.height
            ));
        }
        if expected_height > 1 && header.last_header_hash != last_header_hash {
            return Err(anyhow!(
                "block {} does not extend the local chain",
                header.height
            ));
        }

        let execution = self.execute_transitions(header, &block.data.txs, false)?;

        if self.fraud_proofs {
            if let Some(disputed) = first_divergence(
                &block.data.intermediate_state_roots,
                &execution.isrs,
            ) {
                self.halted.store(true, Ordering::SeqCst);
                self.generate_and_gossip_fraud_proof(block, disputed, &execution)
                    .await?;
                return Err(anyhow!(
                    "state transition fraud detected in block {} at step {}",
                    header.height,
                    disputed
                ));
            }
        }
        if execution.app_hash != header.app_hash {
            self.halted.store(true, Ordering::SeqCst);
            if self.fraud_proofs {
                let steps = block.data.txs.len() + 1;
                self.generate_and_gossip_fraud_proof(block, steps, &execution)
                    .await?;
            }
            return Err(anyhow!(
                "app hash mismatch at height {}: header {} vs computed {}",
                header.height,
                hex::encode(&header.app_hash),
                hex::encode(&execution.app_hash)
            ));
        }

        let new_state = State {
            chain_id: header.chain_id.clone(),
            height: header.height,
            last_block_time: header.time,
            app_hash: execution.app_hash,
            last_header_hash: block.hash(),
            validators,
            consensus_params,
        };
        self.store
            .commit_block(block, &block.signed_header.commit, &new_state)?;
        *self.state.lock().unwrap() = new_state;
        self.mempool.remove_committed(&block.data.txs);

        // headers recovered from DA bodies feed the header store too
        if let Err(e) = self.header_store.append(block.signed_header.clone()) {
            log::debug!("header {} not appended: {}", header.height, e);
        }
        self.height_tx.send_replace(header.height);
        log::info!("applied block {}", header.height);
        Ok(())
    }

    /// Ask the application for a proof of the disputed step and publish
    /// it on the fraud-proof topic. `disputed_step` indexes the
    /// transition sequence: 0 is BeginBlock, 1..=n are the transactions,
    /// n+1 is EndBlock.
    async fn generate_and_gossip_fraud_proof(
        &self,
        block: &Block,
        disputed_step: usize,
        execution: &Execution,
    ) -> Result<()> {
        let header = block.header();
        let tx_count = block.data.txs.len();
        let deliver_txs: Vec<RequestDeliverTx> = block
            .data
            .txs
            .iter()
            .take(disputed_step.min(tx_count))
            .map(|tx| RequestDeliverTx { tx: tx.clone() })
            .collect();
        let request = RequestGenerateFraudProof {
            fraudulent_begin_block: Some(RequestBeginBlock {
                hash: block.hash().to_vec(),
                header: header.clone(),
            }),
            fraudulent_deliver_txs: deliver_txs,
            fraudulent_end_block: if disputed_step > tx_count {
                Some(RequestEndBlock {
                    height: header.height,
                })
            } else {
                None
            },
        };

        let response = self.conns.consensus().generate_fraud_proof_sync(request)?;
        let mut proof = response
            .fraud_proof
            .ok_or_else(|| anyhow!("application did not produce a fraud proof"))?;
        proof.block_height = header.height;
        if proof.expected_valid_app_hash.is_empty() {
            proof.expected_valid_app_hash = execution
                .isrs
                .get(disputed_step)
                .cloned()
                .unwrap_or_else(|| execution.app_hash.clone());
        }

        let bytes = serialization::encode(&proof)?;
        self.p2p.publish(FRAUD_PROOF_TOPIC, bytes).await?;
        log::error!(
            "published fraud proof for block {} (step {})",
            header.height,
            disputed_step
        );
        Ok(())
    }
}

/// Index of the first differing intermediate state root, if both sides
/// recorded the same number of steps.
fn first_divergence(claimed: &[Vec<u8>], computed: &[Vec<u8>]) -> Option<usize> {
    if claimed.len() != computed.len() {
        // the producer did not record ISRs; fall back to the final
        // app-hash comparison
        return None;
    }
    claimed.iter().zip(computed.iter()).position(|(a, b)| a != b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_divergence() {
        let a = vec![vec![1], vec![2], vec![3]];
        let b = vec![vec![1], vec![9], vec![3]];
        assert_eq!(first_divergence(&a, &b), Some(1));
        assert_eq!(first_divergence(&a, &a), None);
        assert_eq!(first_divergence(&a, &[]), None);
    }
}
