//! Topic-based gossip client
//!
//! Wraps plain TCP connections into a flooding gossip mesh with three
//! independent topics: transactions, headers and fraud proofs. Inbound
//! messages pass the topic's validator before local delivery and
//! re-flooding; a rejected message is dropped. Frames are
//! length-prefixed versioned encodings, deduplicated by message id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::P2PConfig;
use crate::types::{serialization, Hash};

/// Topic carrying serialized transactions.
pub const TX_TOPIC: &str = "txs";
/// Topic carrying serialized signed headers.
pub const HEADER_TOPIC: &str = "headers";
/// Topic carrying serialized fraud proofs.
pub const FRAUD_PROOF_TOPIC: &str = "fraud-proofs";

const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const SEEN_CACHE_SIZE: usize = 8192;
const DELIVERY_BUFFER: usize = 256;
const REDIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Message delivered to topic subscribers after validation.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    pub data: Vec<u8>,
    /// Node id of the original publisher
    pub from: String,
}

/// Per-topic validator, invoked on every inbound message before local
/// delivery. Returning `false` drops the message.
pub type GossipValidator = Box<dyn Fn(&GossipMessage) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    chain_id: String,
    topic: String,
    id: Hash,
    from: String,
    payload: Vec<u8>,
}

struct TopicState {
    validator: Option<GossipValidator>,
    delivery: broadcast::Sender<GossipMessage>,
}

struct SeenCache {
    set: HashSet<Hash>,
    order: VecDeque<Hash>,
}

impl SeenCache {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true if the id was not seen before.
    fn insert(&mut self, id: Hash) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > SEEN_CACHE_SIZE {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// Gossip client: peer set, topic pub/sub, per-topic validators.
pub struct GossipClient {
    config: P2PConfig,
    chain_id: String,
    node_id: String,
    topics: RwLock<HashMap<String, TopicState>>,
    peers: tokio::sync::Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    next_peer_id: AtomicU64,
    seen: Mutex<SeenCache>,
    listen_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl GossipClient {
    pub fn new(config: P2PConfig, chain_id: String) -> Arc<Self> {
        let mut node_id_bytes = [0u8; 8];
        rand::Rng::fill(&mut rand::thread_rng(), &mut node_id_bytes[..]);

        let mut topics = HashMap::new();
        for topic in [TX_TOPIC, HEADER_TOPIC, FRAUD_PROOF_TOPIC] {
            let (delivery, _) = broadcast::channel(DELIVERY_BUFFER);
            topics.insert(
                topic.to_string(),
                TopicState {
                    validator: None,
                    delivery,
                },
            );
        }

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            chain_id,
            node_id: hex::encode(node_id_bytes),
            topics: RwLock::new(topics),
            peers: tokio::sync::Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(0),
            seen: Mutex::new(SeenCache::new()),
            listen_addr: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Stable identifier of this node on the gossip plane.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bind the listener and dial the configured seeds.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .with_context(|| format!("binding gossip listener on {}", self.config.listen_address))?;
        let local = listener.local_addr()?;
        *self.listen_addr.lock().unwrap() = Some(local);
        log::info!("gossip client listening on {}", local);

        let client = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("accepted gossip connection from {}", addr);
                            let conn_client = client.clone();
                            let handle = tokio::spawn(async move {
                                conn_client.handle_connection(stream).await;
                            });
                            client.tasks.lock().unwrap().push(handle);
                        }
                        Err(e) => {
                            log::warn!("gossip accept failed: {}", e);
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(accept_task);

        for seed in self.config.seeds.clone() {
            self.spawn_seed_dialer(seed);
        }
        Ok(())
    }

    fn spawn_seed_dialer(self: &Arc<Self>, seed: String) {
        let client = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    conn = TcpStream::connect(&seed) => match conn {
                        Ok(stream) => {
                            log::info!("connected to seed {}", seed);
                            client.clone().handle_connection(stream).await;
                            log::debug!("seed connection to {} closed", seed);
                        }
                        Err(e) => {
                            log::debug!("failed to dial seed {}: {}", seed, e);
                        }
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(REDIAL_INTERVAL) => {}
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (mut read_half, write_half) = stream.into_split();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().await.insert(peer_id, frame_tx);

        let writer = tokio::spawn(write_loop(write_half, frame_rx));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut read_half) => match frame {
                    Ok(bytes) => {
                        if let Err(e) = self.handle_inbound(peer_id, &bytes).await {
                            log::debug!("dropping message from {}: {}", peer_addr, e);
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        self.peers.lock().await.remove(&peer_id);
        writer.abort();
        log::debug!("peer {} disconnected", peer_addr);
    }

    async fn handle_inbound(&self, src_peer: u64, bytes: &[u8]) -> Result<()> {
        let wire: WireMessage = serialization::decode(bytes)?;
        if wire.chain_id != self.chain_id {
            return Err(anyhow!(
                "message for foreign chain {} dropped",
                wire.chain_id
            ));
        }
        if !self.seen.lock().unwrap().insert(wire.id) {
            return Ok(());
        }

        let accepted = {
            let topics = self.topics.read().unwrap();
            match topics.get(&wire.topic) {
                None => {
                    log::debug!("message on unknown topic {}", wire.topic);
                    false
                }
                Some(topic) => {
                    let msg = GossipMessage {
                        data: wire.payload,
                        from: wire.from,
                    };
                    let valid = topic.validator.as_ref().map(|v| v(&msg)).unwrap_or(true);
                    if valid {
                        // No subscribers is fine; the message still floods.
                        let _ = topic.delivery.send(msg);
                    } else {
                        log::debug!("validator rejected message on topic {}", wire.topic);
                    }
                    valid
                }
            }
        };

        if accepted {
            self.flood(Some(src_peer), bytes.to_vec()).await;
        }
        Ok(())
    }

    async fn flood(&self, skip: Option<u64>, frame: Vec<u8>) {
        let peers = self.peers.lock().await;
        for (peer_id, sender) in peers.iter() {
            if Some(*peer_id) == skip {
                continue;
            }
            let _ = sender.send(frame.clone());
        }
    }

    /// Best-effort fan-out of `payload` on `topic` to all connected peers.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut hasher = Sha256::new();
        hasher.update(topic.as_bytes());
        hasher.update(&payload);
        let id: Hash = hasher.finalize().into();
        self.seen.lock().unwrap().insert(id);

        let wire = WireMessage {
            chain_id: self.chain_id.clone(),
            topic: topic.to_string(),
            id,
            from: self.node_id.clone(),
            payload,
        };
        let frame = serialization::encode(&wire)?;
        self.flood(None, frame).await;
        Ok(())
    }

    /// Install the validator for `topic`.
    pub fn set_validator(&self, topic: &str, validator: GossipValidator) {
        let mut topics = self.topics.write().unwrap();
        if let Some(state) = topics.get_mut(topic) {
            if state.validator.is_some() {
                log::warn!("replacing validator on topic {}", topic);
            }
            state.validator = Some(validator);
        } else {
            log::warn!("set_validator on unknown topic {}", topic);
        }
    }

    /// Delivery channel draining messages that passed validation.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<GossipMessage> {
        let topics = self.topics.read().unwrap();
        match topics.get(topic) {
            Some(state) => state.delivery.subscribe(),
            None => {
                log::warn!("subscribe to unknown topic {}", topic);
                broadcast::channel(1).1
            }
        }
    }

    /// Addresses this client can be reached on.
    pub fn addrs(&self) -> Vec<String> {
        self.listen_addr
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Whether `close` has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Disconnect all peers and stop all tasks.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.peers.lock().await.clear();
        self.closed.store(true, Ordering::SeqCst);
        log::debug!("gossip client closed");
    }
}

async fn write_loop(mut stream: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if write_frame(&mut stream, &frame).await.is_err() {
            return;
        }
    }
}

async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("invalid frame length {}", len));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

async fn write_frame(stream: &mut OwnedWriteHalf, frame: &[u8]) -> Result<()> {
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    async fn connected_pair() -> (Arc<GossipClient>, Arc<GossipClient>) {
        let first = GossipClient::new(P2PConfig::default(), "test".to_string());
        first.start().await.unwrap();
        let seed = first.addrs().remove(0);

        let second = GossipClient::new(
            P2PConfig {
                listen_address: "127.0.0.1:0".to_string(),
                seeds: vec![seed],
            },
            "test".to_string(),
        );
        second.start().await.unwrap();

        // wait for the dialer to establish the connection
        for _ in 0..50 {
            if first.peer_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(first.peer_count().await > 0, "peers never connected");
        (first, second)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let (first, second) = connected_pair().await;
        let mut rx = second.subscribe(TX_TOPIC);

        first.publish(TX_TOPIC, vec![1, 2, 3]).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(msg.data, vec![1, 2, 3]);
        assert_eq!(msg.from, first.node_id());

        first.close().await;
        second.close().await;
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_validator_rejects_message() {
        let (first, second) = connected_pair().await;
        let rejected = Arc::new(AtomicUsize::new(0));
        let rejected_cb = rejected.clone();
        second.set_validator(
            TX_TOPIC,
            Box::new(move |_msg| {
                rejected_cb.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );
        let mut rx = second.subscribe(TX_TOPIC);

        first.publish(TX_TOPIC, vec![9]).await.unwrap();

        // validator ran, delivery channel stays empty
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_messages_are_dropped() {
        let (first, second) = connected_pair().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        second.set_validator(
            TX_TOPIC,
            Box::new(move |_msg| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        first.publish(TX_TOPIC, vec![7]).await.unwrap();
        first.publish(TX_TOPIC, vec![7]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn test_foreign_chain_messages_are_dropped() {
        let first = GossipClient::new(P2PConfig::default(), "chain-a".to_string());
        first.start().await.unwrap();
        let seed = first.addrs().remove(0);

        let second = GossipClient::new(
            P2PConfig {
                listen_address: "127.0.0.1:0".to_string(),
                seeds: vec![seed],
            },
            "chain-b".to_string(),
        );
        second.start().await.unwrap();

        for _ in 0..50 {
            if first.peer_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut rx = second.subscribe(TX_TOPIC);
        first.publish(TX_TOPIC, vec![1]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());

        first.close().await;
        second.close().await;
    }
}
