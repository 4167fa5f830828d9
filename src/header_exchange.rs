//! Header exchange
//!
//! Keeps a local store of verified headers keyed by height and bridges it
//! to the `headers` gossip topic: appends publish, subscribed headers
//! append. Heights are reported as the highest contiguous verified
//! prefix, so a buffered future header does not advance the chain view.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::p2p::{GossipClient, HEADER_TOPIC};
use crate::types::{serialization, Hash, SignedHeader};

struct HeaderStoreInner {
    headers: BTreeMap<u64, SignedHeader>,
    contiguous: u64,
}

/// Append-only verified-header index keyed by height.
pub struct HeaderStore {
    inner: Mutex<HeaderStoreInner>,
    height_tx: watch::Sender<u64>,
    /// Hash the height-1 header must match, if configured
    trusted_hash: Option<Hash>,
}

impl HeaderStore {
    pub fn new(trusted_hash: Option<Hash>) -> Self {
        let (height_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(HeaderStoreInner {
                headers: BTreeMap::new(),
                contiguous: 0,
            }),
            height_tx,
            trusted_hash,
        }
    }

    /// Verify and insert a header. The first header at a height wins;
    /// a conflicting one is rejected. Parent linkage is checked against
    /// whichever neighbors are already present.
    pub fn append(&self, signed_header: SignedHeader) -> Result<()> {
        signed_header.verify()?;
        let height = signed_header.header.height;
        let hash = signed_header.header.hash();

        if height == 1 {
            if let Some(trusted) = &self.trusted_hash {
                if hash != *trusted {
                    return Err(anyhow!(
                        "height-1 header {} does not match trusted hash {}",
                        hex::encode(hash),
                        hex::encode(trusted)
                    ));
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.headers.get(&height) {
            if existing.header.hash() == hash {
                return Ok(());
            }
            return Err(anyhow!(
                "conflicting header at height {} (keeping the first)",
                height
            ));
        }
        if height > 1 {
            if let Some(parent) = inner.headers.get(&(height - 1)) {
                if signed_header.header.last_header_hash != parent.header.hash() {
                    return Err(anyhow!(
                        "header at height {} does not link to its parent",
                        height
                    ));
                }
            }
        }
        inner.headers.insert(height, signed_header);

        // advance the contiguous prefix, evicting a buffered header whose
        // linkage turns out to be broken
        let mut contiguous = inner.contiguous;
        loop {
            let next_height = contiguous + 1;
            let Some(next) = inner.headers.get(&next_height) else {
                break;
            };
            if contiguous >= 1 {
                let prev_hash = inner.headers[&contiguous].header.hash();
                if next.header.last_header_hash != prev_hash {
                    log::warn!(
                        "evicting header at height {} with broken parent linkage",
                        next_height
                    );
                    inner.headers.remove(&next_height);
                    break;
                }
            }
            contiguous = next_height;
        }
        inner.contiguous = contiguous;
        drop(inner);
        self.height_tx.send_replace(contiguous);
        Ok(())
    }

    /// Hash the height-1 header must match, if configured.
    pub fn trusted_hash(&self) -> Option<Hash> {
        self.trusted_hash
    }

    /// Highest contiguous verified height.
    pub fn height(&self) -> u64 {
        self.inner.lock().unwrap().contiguous
    }

    /// Header at `height` if it is already part of the contiguous prefix.
    pub fn get(&self, height: u64) -> Option<SignedHeader> {
        let inner = self.inner.lock().unwrap();
        if height > inner.contiguous {
            return None;
        }
        inner.headers.get(&height).cloned()
    }

    /// Watch channel tracking the contiguous height.
    pub fn subscribe_height(&self) -> watch::Receiver<u64> {
        self.height_tx.subscribe()
    }

    /// Block until the header at `height` is available or the shutdown
    /// signal fires.
    pub async fn get_by_height(
        &self,
        height: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SignedHeader> {
        let mut heights = self.subscribe_height();
        loop {
            if let Some(header) = self.get(height) {
                return Ok(header);
            }
            tokio::select! {
                changed = heights.changed() => {
                    changed.context("header store closed")?;
                }
                _ = shutdown.changed() => {
                    return Err(anyhow!("cancelled while waiting for header {}", height));
                }
            }
        }
    }
}

/// Bridges the header store and the `headers` gossip topic.
pub struct HeaderExchangeService {
    store: Arc<HeaderStore>,
    p2p: Arc<GossipClient>,
    chain_id: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeaderExchangeService {
    pub fn new(p2p: Arc<GossipClient>, chain_id: String, trusted_hash: Option<Hash>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store: Arc::new(HeaderStore::new(trusted_hash)),
            p2p,
            chain_id,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<HeaderStore> {
        self.store.clone()
    }

    /// Start consuming the `headers` topic.
    pub async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let chain_id = self.chain_id.clone();
        let mut rx = self.p2p.subscribe(HEADER_TOPIC);
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    received = rx.recv() => match received {
                        Ok(msg) => {
                            let signed_header: SignedHeader = match serialization::decode(&msg.data) {
                                Ok(sh) => sh,
                                Err(e) => {
                                    log::debug!("undecodable header from {}: {}", msg.from, e);
                                    continue;
                                }
                            };
                            if signed_header.header.chain_id != chain_id {
                                continue;
                            }
                            let height = signed_header.header.height;
                            match store.append(signed_header) {
                                Ok(()) => log::debug!("appended gossiped header {}", height),
                                Err(e) => log::debug!("dropped gossiped header {}: {}", height, e),
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("header subscription lagged by {} messages", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Append locally and publish on the `headers` topic.
    pub async fn broadcast(&self, signed_header: &SignedHeader) -> Result<()> {
        self.store.append(signed_header.clone())?;
        let bytes = serialization::encode(signed_header)?;
        self.p2p.publish(HEADER_TOPIC, bytes).await
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}
