//! RPC ingress
//!
//! HTTP endpoints feeding transactions into the mempool:
//! `broadcast_tx_async`, `broadcast_tx_sync`, `broadcast_tx_commit` and
//! the direct-tx endpoint. Submissions go through `CheckTx`; accepted
//! transactions enter the mempool and are republished on the `txs`
//! topic. Commit-style endpoints wait for inclusion in a committed
//! block; progressive-sequencer mode reports the inclusion height.

use std::sync::{Arc, Mutex};

use actix_web::web::{self, Data};
use actix_web::{middleware, App, HttpResponse, HttpServer};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::aci::types::{CheckTxKind, RequestCheckTx, CODE_TYPE_OK};
use crate::aci::AppConns;
use crate::manager::BlockManager;
use crate::mempool::Mempool;
use crate::p2p::{GossipClient, TX_TOPIC};
use crate::types::Tx;

/// Handles the RPC server borrows from the node.
#[derive(Clone)]
pub struct RpcContext {
    pub conns: AppConns,
    pub mempool: Arc<Mempool>,
    pub manager: Arc<BlockManager>,
    pub p2p: Arc<GossipClient>,
    pub progressive_sequencer: bool,
}

#[derive(Debug, Deserialize)]
struct TxQuery {
    tx: String,
}

fn json_body(body: String) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .body(body)
}

fn rpc_error(message: &str) -> HttpResponse {
    HttpResponse::Ok().content_type("application/json").body(format!(
        "{{\"jsonrpc\":\"2.0\",\"error\":{{\"code\":-32600,\"message\":{}}},\"id\":-1}}\n",
        serde_json::to_string(message).unwrap_or_else(|_| "\"internal error\"".to_string())
    ))
}

/// CheckTx, mempool insert, gossip republish. Returns the raw bytes.
async fn submit_tx(context: &RpcContext, hex_tx: &str) -> Result<Tx> {
    let tx = hex::decode(hex_tx).context("transaction must be hex encoded")?;
    let check = context.conns.mempool().check_tx_sync(RequestCheckTx {
        tx: tx.clone(),
        kind: CheckTxKind::New,
    })?;
    if check.code != CODE_TYPE_OK {
        return Err(anyhow!("CheckTx rejected transaction: code {}", check.code));
    }
    context.mempool.push(tx.clone())?;
    if let Err(e) = context.p2p.publish(TX_TOPIC, tx.clone()).await {
        log::warn!("failed to republish transaction: {}", e);
    }
    Ok(tx)
}

async fn receive_direct_tx(
    context: Data<RpcContext>,
    query: web::Query<TxQuery>,
) -> HttpResponse {
    let tx = match submit_tx(&context, &query.tx).await {
        Ok(tx) => tx,
        Err(e) => return rpc_error(&e.to_string()),
    };
    let height = match context.manager.wait_for_tx_inclusion(tx).await {
        Ok(height) => height,
        Err(e) => return rpc_error(&e.to_string()),
    };
    if context.progressive_sequencer {
        json_body(format!(
            "{{\"jsonrpc\":\"2.0\",\"result\":{{\"included\":true,\"height\":\"{}\"}},\"id\":-1}}\n",
            height
        ))
    } else {
        json_body(
            "{\"jsonrpc\":\"2.0\",\"result\":{\"included\":true},\"id\":-1}\n".to_string(),
        )
    }
}

async fn broadcast_tx_async(
    context: Data<RpcContext>,
    query: web::Query<TxQuery>,
) -> HttpResponse {
    match submit_tx(&context, &query.tx).await {
        Ok(tx) => {
            let mut hasher = Sha256::new();
            hasher.update(&tx);
            let hash = hex::encode(hasher.finalize());
            json_body(format!(
                "{{\"jsonrpc\":\"2.0\",\"result\":{{\"code\":0,\"hash\":\"{}\"}},\"id\":-1}}\n",
                hash
            ))
        }
        Err(e) => rpc_error(&e.to_string()),
    }
}

async fn broadcast_tx_sync(
    context: Data<RpcContext>,
    query: web::Query<TxQuery>,
) -> HttpResponse {
    match submit_tx(&context, &query.tx).await {
        Ok(_) => json_body(
            "{\"jsonrpc\":\"2.0\",\"result\":{\"code\":0,\"log\":\"\"},\"id\":-1}\n".to_string(),
        ),
        Err(e) => rpc_error(&e.to_string()),
    }
}

async fn broadcast_tx_commit(
    context: Data<RpcContext>,
    query: web::Query<TxQuery>,
) -> HttpResponse {
    let tx = match submit_tx(&context, &query.tx).await {
        Ok(tx) => tx,
        Err(e) => return rpc_error(&e.to_string()),
    };
    match context.manager.wait_for_tx_inclusion(tx).await {
        Ok(height) => json_body(format!(
            "{{\"jsonrpc\":\"2.0\",\"result\":{{\"check_tx\":{{\"code\":0}},\"height\":\"{}\"}},\"id\":-1}}\n",
            height
        )),
        Err(e) => rpc_error(&e.to_string()),
    }
}

/// HTTP server for the transaction ingress, running on its own thread.
pub struct RpcServer {
    context: RpcContext,
    listen_address: String,
    handle: Mutex<Option<actix_web::dev::ServerHandle>>,
    bound_address: Mutex<Option<std::net::SocketAddr>>,
}

impl RpcServer {
    pub fn new(context: RpcContext, listen_address: String) -> Self {
        Self {
            context,
            listen_address,
            handle: Mutex::new(None),
            bound_address: Mutex::new(None),
        }
    }

    /// Bind and serve. Returns once the listener is accepting.
    pub fn start(&self) -> Result<()> {
        let context = self.context.clone();
        let listen_address = self.listen_address.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("rpc-server".to_string())
            .spawn(move || {
                let system = actix_web::rt::System::new();
                system.block_on(async move {
                    let bound = HttpServer::new(move || {
                        App::new()
                            .app_data(Data::new(context.clone()))
                            .wrap(middleware::Logger::default())
                            .route("/receive_direct_tx", web::get().to(receive_direct_tx))
                            .route("/broadcast_tx_async", web::get().to(broadcast_tx_async))
                            .route("/broadcast_tx_sync", web::get().to(broadcast_tx_sync))
                            .route("/broadcast_tx_commit", web::get().to(broadcast_tx_commit))
                    })
                    .bind(&listen_address);

                    let server = match bound {
                        Ok(server) => {
                            let addrs = server.addrs();
                            let server = server.run();
                            let _ = ready_tx.send(Ok((server.handle(), addrs)));
                            server
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(anyhow::Error::from(e)));
                            return;
                        }
                    };
                    if let Err(e) = server.await {
                        log::error!("RPC server terminated: {}", e);
                    }
                });
            })
            .context("spawning RPC server thread")?;

        let (handle, addrs) = ready_rx
            .recv()
            .context("RPC server thread exited before binding")??;
        *self.handle.lock().unwrap() = Some(handle);
        *self.bound_address.lock().unwrap() = addrs.first().copied();
        log::info!("RPC server listening on {}", self.listen_address);
        Ok(())
    }

    /// Address the server actually bound, once started.
    pub fn bound_address(&self) -> Option<std::net::SocketAddr> {
        *self.bound_address.lock().unwrap()
    }

    /// Gracefully stop serving.
    pub async fn stop(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.stop(true).await;
        }
    }
}
