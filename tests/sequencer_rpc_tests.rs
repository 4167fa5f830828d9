//! Progressive sequencer RPC tests
//!
//! Drives the direct-tx endpoint with concurrent waves of transactions
//! and checks that inclusion acknowledgments partition into consecutive
//! block heights.

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
use lamina::node::{FullNode, Node};
use lamina::rpc::RpcServer;
use lamina::types::{GenesisDoc, GenesisValidator, NamespaceId};

struct SequencerApp {
    deliver: Arc<AtomicUsize>,
}

impl Application for SequencerApp {
    fn deliver_tx(&mut self, _req: RequestDeliverTx) -> ResponseDeliverTx {
        self.deliver.fetch_add(1, Ordering::SeqCst);
        ResponseDeliverTx {
            code: CODE_TYPE_OK,
            ..Default::default()
        }
    }

    fn commit(&mut self) -> ResponseCommit {
        ResponseCommit {
            data: vec![1, 2, 3, 4],
            retain_height: 0,
        }
    }
}

async fn read_bucket(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
    count: usize,
    height: u64,
) {
    let expected = format!(
        "{{\"jsonrpc\":\"2.0\",\"result\":{{\"included\":true,\"height\":\"{}\"}},\"id\":-1}}\n",
        height
    );
    for _ in 0..count {
        let body = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("timed out waiting for inclusion")
            .expect("response channel closed");
        assert_eq!(body, expected);
    }
}

#[tokio::test]
async fn test_progressive_sequencer_inclusion_heights() {
    let signing_key = SigningKey::generate(&mut OsRng);
    let genesis = GenesisDoc {
        chain_id: "sequencer".to_string(),
        genesis_time: 1_700_000_000_000,
        validators: vec![GenesisValidator {
            pub_key: signing_key.verifying_key().to_bytes().to_vec(),
            power: 1,
            name: "sequencer".to_string(),
        }],
        app_state: Vec::new(),
    };

    let mut config = NodeConfig::default();
    config.da_layer = "mock".to_string();
    config.aggregator = true;
    config.progressive_sequencer = true;
    config.block_manager.block_time = Duration::from_secs(4);
    config.block_manager.da_block_time = Duration::from_millis(500);
    config.block_manager.namespace_id = NamespaceId([1, 2, 3, 4, 5, 6, 7, 8]);

    let deliver = Arc::new(AtomicUsize::new(0));
    let node = FullNode::with_da(
        config,
        signing_key,
        LocalClient::new(SequencerApp {
            deliver: deliver.clone(),
        }),
        genesis,
        Arc::new(MockDaLayer::new()),
    )
    .unwrap();
    node.start().await.unwrap();

    let rpc = RpcServer::new(node.rpc_context(), "127.0.0.1:0".to_string());
    rpc.start().unwrap();
    let rpc_addr = rpc.bound_address().unwrap();

    let (responses_tx, mut responses_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let send_wave = |start: usize| {
        for i in start..start + 5 {
            let url = format!("http://{}/receive_direct_tx?tx={:02x}", rpc_addr, i);
            let out = responses_tx.clone();
            tokio::spawn(async move {
                let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
                let _ = out.send(body);
            });
        }
    };

    // four waves of five transactions, three seconds apart; with a
    // four-second block interval the first block seals two waves and
    // each later block seals one
    send_wave(0);
    tokio::time::sleep(Duration::from_secs(3)).await;
    send_wave(5);
    tokio::time::sleep(Duration::from_secs(3)).await;
    send_wave(10);
    tokio::time::sleep(Duration::from_secs(3)).await;
    send_wave(15);

    read_bucket(&mut responses_rx, 10, 1).await;
    read_bucket(&mut responses_rx, 5, 2).await;
    read_bucket(&mut responses_rx, 5, 3).await;

    assert_eq!(deliver.load(Ordering::SeqCst), 20);
    assert_eq!(node.store().height(), 3);

    rpc.stop().await;
    node.stop().await.unwrap();
}
