//! Node integration tests
//!
//! End-to-end scenarios over in-process networks: a single aggregator
//! with full nodes syncing from gossip and a shared mock DA layer,
//! lazy aggregation, transaction gossip, trusted-hash gating, fraud
//! proof generation and the light profile.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use lamina::aci::application::Application;
use lamina::aci::types::*;
use lamina::aci::LocalClient;
use lamina::config::NodeConfig;
use lamina::da::MockDaLayer;
use lamina::node::{FullNode, LightNode, Node};
use lamina::p2p::FRAUD_PROOF_TOPIC;
use lamina::rpc::RpcServer;
use lamina::types::{serialization, GenesisDoc, GenesisValidator, NamespaceId};

#[derive(Clone, Default)]
struct Counters {
    deliver: Arc<AtomicUsize>,
    fraud_gen: Arc<AtomicUsize>,
}

/// Application with a fixed post-commit hash; honest nodes share one
/// hash, a malicious aggregator reports another.
struct TestApp {
    app_hash: Vec<u8>,
    counters: Counters,
}

impl TestApp {
    fn new(app_hash: Vec<u8>) -> (Self, Counters) {
        let counters = Counters::default();
        (
            Self {
                app_hash,
                counters: counters.clone(),
            },
            counters,
        )
    }
}

impl Application for TestApp {
    fn deliver_tx(&mut self, _req: RequestDeliverTx) -> ResponseDeliverTx {
        self.counters.deliver.fetch_add(1, Ordering::SeqCst);
        ResponseDeliverTx {
            code: CODE_TYPE_OK,
            ..Default::default()
        }
    }

    fn commit(&mut self) -> ResponseCommit {
        ResponseCommit {
            data: self.app_hash.clone(),
            retain_height: 0,
        }
    }

    fn get_app_hash(&mut self, _req: RequestGetAppHash) -> ResponseGetAppHash {
        ResponseGetAppHash {
            app_hash: self.app_hash.clone(),
        }
    }

    fn generate_fraud_proof(
        &mut self,
        req: RequestGenerateFraudProof,
    ) -> ResponseGenerateFraudProof {
        self.counters.fraud_gen.fetch_add(1, Ordering::SeqCst);
        ResponseGenerateFraudProof {
            fraud_proof: Some(FraudProof {
                block_height: 0,
                pre_state_app_hash: self.app_hash.clone(),
                expected_valid_app_hash: self.app_hash.clone(),
                state_witness: Vec::new(),
                fraudulent_begin_block: req.fraudulent_begin_block,
                fraudulent_deliver_txs: req.fraudulent_deliver_txs,
                fraudulent_end_block: req.fraudulent_end_block,
            }),
        }
    }
}

const HONEST_HASH: [u8; 4] = [1, 2, 3, 4];
const MALICIOUS_HASH: [u8; 4] = [9, 8, 7, 6];

fn genesis(chain_id: &str, signing_key: &SigningKey) -> GenesisDoc {
    GenesisDoc {
        chain_id: chain_id.to_string(),
        genesis_time: 1_700_000_000_000,
        validators: vec![GenesisValidator {
            pub_key: signing_key.verifying_key().to_bytes().to_vec(),
            power: 1,
            name: "aggregator".to_string(),
        }],
        app_state: Vec::new(),
    }
}

fn node_config(aggregator: bool, seeds: Vec<String>, block_ms: u64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.da_layer = "mock".to_string();
    config.aggregator = aggregator;
    config.block_manager.block_time = Duration::from_millis(block_ms);
    config.block_manager.da_block_time = Duration::from_millis(200);
    config.block_manager.namespace_id = NamespaceId([1, 2, 3, 4, 5, 6, 7, 8]);
    config.p2p.seeds = seeds;
    config
}

fn spawn_full_node(
    config: NodeConfig,
    signing_key: SigningKey,
    genesis_doc: GenesisDoc,
    app: TestApp,
    da: MockDaLayer,
) -> Arc<FullNode> {
    FullNode::with_da(
        config,
        signing_key,
        LocalClient::new(app),
        genesis_doc,
        Arc::new(da),
    )
    .expect("node construction")
}

async fn wait_for_peers(node: &Arc<FullNode>) {
    for _ in 0..100 {
        if node.p2p().peer_count().await > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nodes never connected");
}

#[tokio::test]
async fn test_aggregator_produces_blocks() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("agg-only", &key);
    let (app, _) = TestApp::new(HONEST_HASH.to_vec());
    let node = spawn_full_node(
        node_config(true, Vec::new(), 500),
        key,
        gen,
        app,
        MockDaLayer::new(),
    );

    assert!(!node.is_running());
    node.start().await.unwrap();
    assert!(node.is_running());

    tokio::time::sleep(Duration::from_secs(3)).await;
    node.stop().await.unwrap();
    assert!(!node.is_running());

    let height = node.store().height();
    assert!(height >= 2, "expected at least 2 blocks, got {}", height);

    // heights form a gap-free sequence with correct parent links
    let mut parent_hash = None;
    for h in 1..=height {
        let block = node.store().load_block(h).unwrap();
        assert_eq!(block.height(), h);
        if let Some(parent) = parent_hash {
            assert_eq!(block.header().last_header_hash, parent);
        }
        parent_hash = Some(block.hash());
    }
}

#[tokio::test]
async fn test_single_aggregator_single_full_node() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("one-agg-one-full", &key);
    let da = MockDaLayer::new();

    let (agg_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let aggregator = spawn_full_node(
        node_config(true, Vec::new(), 500),
        key.clone(),
        gen.clone(),
        agg_app,
        da.clone(),
    );
    aggregator.start().await.unwrap();
    let seed = aggregator.p2p().addrs().remove(0);

    let (full_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let full = spawn_full_node(
        node_config(false, vec![seed], 500),
        SigningKey::generate(&mut OsRng),
        gen,
        full_app,
        da,
    );
    full.start().await.unwrap();
    wait_for_peers(&aggregator).await;

    tokio::time::sleep(Duration::from_secs(3)).await;

    aggregator.stop().await.unwrap();
    let agg_header_height = aggregator.header_store().height();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let full_header_height = full.header_store().height();
    full.stop().await.unwrap();

    assert!(agg_header_height >= 2, "aggregator too slow");
    assert_eq!(
        agg_header_height, full_header_height,
        "header heights must match"
    );
    // the full node replayed the same chain
    assert!(full.store().height() >= 1);
    for h in 1..=full.store().height() {
        assert_eq!(
            full.store().load_block(h).unwrap(),
            aggregator.store().load_block(h).unwrap(),
            "blocks differ at height {}",
            h
        );
    }
}

#[tokio::test]
async fn test_lazy_aggregator() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("lazy", &key);
    let (app, _) = TestApp::new(HONEST_HASH.to_vec());
    let mut config = node_config(true, Vec::new(), 1000);
    config.lazy_aggregator = true;

    let node = spawn_full_node(config, key, gen, app, MockDaLayer::new());
    node.start().await.unwrap();

    let rpc = RpcServer::new(node.rpc_context(), "127.0.0.1:0".to_string());
    rpc.start().unwrap();
    let rpc_addr = rpc.bound_address().unwrap();

    // the first block is built unconditionally, then production idles
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(node.store().height(), 1);

    for (i, expected_height) in [(1u32, 2u64), (2, 3), (3, 4)] {
        let url = format!(
            "http://{}/broadcast_tx_commit?tx={:08x}",
            rpc_addr, i
        );
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(
            body.contains(&format!("\"height\":\"{}\"", expected_height)),
            "unexpected response: {}",
            body
        );
        assert_eq!(node.store().height(), expected_height);
    }

    rpc.stop().await;
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_tx_gossip_and_aggregation() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("gossip", &key);
    let da = MockDaLayer::new();

    let (agg_app, agg_counters) = TestApp::new(HONEST_HASH.to_vec());
    let aggregator = spawn_full_node(
        node_config(true, Vec::new(), 500),
        key.clone(),
        gen.clone(),
        agg_app,
        da.clone(),
    );
    aggregator.start().await.unwrap();
    let seed = aggregator.p2p().addrs().remove(0);

    let mut fulls = Vec::new();
    for _ in 0..4 {
        let (app, _) = TestApp::new(HONEST_HASH.to_vec());
        let full = spawn_full_node(
            node_config(false, vec![seed.clone()], 500),
            SigningKey::generate(&mut OsRng),
            gen.clone(),
            app,
            da.clone(),
        );
        full.start().await.unwrap();
        fulls.push(full);
    }
    for _ in 0..100 {
        if aggregator.p2p().peer_count().await >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // each full node submits one transaction over gossip
    for (i, full) in fulls.iter().enumerate() {
        full.p2p()
            .publish(lamina::p2p::TX_TOPIC, vec![0xA0 + i as u8])
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(agg_counters.deliver.load(Ordering::SeqCst), 4);

    tokio::time::sleep(Duration::from_secs(1)).await;
    for full in &fulls {
        let synced = full.store().height();
        assert!(synced >= 1, "full node never synced");
        for h in 1..=synced {
            assert_eq!(
                full.store().load_block(h).unwrap(),
                aggregator.store().load_block(h).unwrap(),
                "blocks differ at height {}",
                h
            );
        }
    }

    aggregator.stop().await.unwrap();
    for full in &fulls {
        full.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_trusted_hash() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("trusted", &key);
    let da = MockDaLayer::new();

    let (agg_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let aggregator = spawn_full_node(
        node_config(true, Vec::new(), 500),
        key.clone(),
        gen.clone(),
        agg_app,
        da.clone(),
    );
    aggregator.start().await.unwrap();
    let seed = aggregator.p2p().addrs().remove(0);

    // wait for the height-1 block and learn its hash
    let mut trusted = None;
    for _ in 0..100 {
        if let Ok(block) = aggregator.store().load_block(1) {
            trusted = Some(hex::encode(block.hash()));
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let trusted = trusted.expect("aggregator never produced block 1");

    let (good_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let mut good_config = node_config(false, vec![seed.clone()], 500);
    good_config.trusted_hash = trusted;
    let good = spawn_full_node(
        good_config,
        SigningKey::generate(&mut OsRng),
        gen.clone(),
        good_app,
        da.clone(),
    );
    good.start().await.unwrap();

    let (bad_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let mut bad_config = node_config(false, vec![seed], 500);
    bad_config.trusted_hash = hex::encode([0xAAu8; 32]);
    let bad = spawn_full_node(
        bad_config,
        SigningKey::generate(&mut OsRng),
        gen,
        bad_app,
        da,
    );
    bad.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(
        good.header_store().height() >= 2,
        "trusted node should follow the chain"
    );
    assert!(good.store().height() >= 1);

    assert_eq!(
        bad.header_store().height(),
        0,
        "wrong trusted hash must block header sync"
    );
    assert_eq!(bad.store().height(), 0, "wrong trusted hash must block sync");

    aggregator.stop().await.unwrap();
    good.stop().await.unwrap();
    bad.stop().await.unwrap();
}

#[tokio::test]
async fn test_fraud_proof_trigger() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("fraud", &key);
    let da = MockDaLayer::new();

    let (malicious_app, _) = TestApp::new(MALICIOUS_HASH.to_vec());
    let mut agg_config = node_config(true, Vec::new(), 2000);
    agg_config.fraud_proofs = true;
    let aggregator = spawn_full_node(agg_config, key.clone(), gen.clone(), malicious_app, da.clone());
    aggregator.start().await.unwrap();
    let seed = aggregator.p2p().addrs().remove(0);

    let (honest_app, honest_counters) = TestApp::new(HONEST_HASH.to_vec());
    let mut full_config = node_config(false, vec![seed], 2000);
    full_config.fraud_proofs = true;
    let full = spawn_full_node(
        full_config,
        SigningKey::generate(&mut OsRng),
        gen.clone(),
        honest_app,
        da,
    );
    full.start().await.unwrap();

    // an observer on the fraud-proof topic, peered with the honest node
    let observer = lamina::p2p::GossipClient::new(
        lamina::config::P2PConfig {
            listen_address: "127.0.0.1:0".to_string(),
            seeds: vec![full.p2p().addrs().remove(0)],
        },
        gen.chain_id.clone(),
    );
    observer.start().await.unwrap();
    let mut proofs = observer.subscribe(FRAUD_PROOF_TOPIC);

    // block 1 arrives over DA, re-execution diverges, a proof goes out
    let msg = tokio::time::timeout(Duration::from_secs(10), proofs.recv())
        .await
        .expect("no fraud proof published")
        .unwrap();
    let proof: FraudProof = serialization::decode(&msg.data).unwrap();
    assert_eq!(proof.block_height, 1);
    assert_eq!(proof.expected_valid_app_hash, HONEST_HASH.to_vec());

    assert!(honest_counters.fraud_gen.load(Ordering::SeqCst) >= 1);
    assert!(full.manager().is_halted(), "honest node must halt");
    assert_eq!(full.store().height(), 0, "fraudulent block must not commit");

    observer.close().await;
    aggregator.stop().await.unwrap();
    full.stop().await.unwrap();
}

#[tokio::test]
async fn test_light_node_rejects_tx_and_header_gossip() {
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("light", &key);

    let (agg_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let aggregator = spawn_full_node(
        node_config(true, Vec::new(), 300),
        key.clone(),
        gen.clone(),
        agg_app,
        MockDaLayer::new(),
    );
    aggregator.start().await.unwrap();
    let seed = aggregator.p2p().addrs().remove(0);

    let mut light_config = node_config(false, vec![seed], 300);
    light_config.light = true;
    let (light_app, _) = TestApp::new(HONEST_HASH.to_vec());
    let light = LightNode::new(light_config, LocalClient::new(light_app), gen).unwrap();
    light.start().await.unwrap();
    assert!(light.is_running());

    tokio::time::sleep(Duration::from_secs(2)).await;

    // headers were produced, but the light profile rejects them all
    assert!(aggregator.header_store().height() >= 2);
    assert_eq!(light.header_store().height(), 0);

    aggregator.stop().await.unwrap();
    light.stop().await.unwrap();
    assert!(!light.is_running());
}

#[tokio::test]
async fn test_block_manager_resumes_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let key = SigningKey::generate(&mut OsRng);
    let gen = genesis("restart", &key);

    let mut config = node_config(true, Vec::new(), 200);
    config.root_dir = dir.path().to_string_lossy().to_string();
    config.db_path = "data".to_string();

    let (app, _) = TestApp::new(HONEST_HASH.to_vec());
    let node = spawn_full_node(config.clone(), key.clone(), gen.clone(), app, MockDaLayer::new());
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    node.stop().await.unwrap();
    let persisted_height = node.store().height();
    assert!(persisted_height >= 2);
    drop(node);

    let (app, _) = TestApp::new(HONEST_HASH.to_vec());
    let node = spawn_full_node(config, key, gen, app, MockDaLayer::new());
    assert_eq!(
        node.store().height(),
        persisted_height,
        "restart must resume at the persisted height"
    );
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    node.stop().await.unwrap();
    assert!(node.store().height() > persisted_height);

    // the chain stays gap-free across the restart
    for h in 1..=node.store().height() {
        assert_eq!(node.store().load_block(h).unwrap().height(), h);
    }
}
