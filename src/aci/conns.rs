//! Connection multiplexer
//!
//! Four typed views over one local client, one per role the application
//! can be called in. Every view forwards to the same client and therefore
//! shares its single serialization point; no view buffers or reorders.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::client::{GlobalCallback, LocalClient, ReqRes};
use super::messages::{Request, Response};
use super::types::*;

fn unexpected(what: &str, got: &Response) -> anyhow::Error {
    match got {
        Response::Exception(e) => anyhow!("application exception: {}", e.error),
        other => anyhow!("expected {} response, got {}", what, other.kind()),
    }
}

/// View used by the block manager to drive state transitions.
#[derive(Clone)]
pub struct ConsensusConn {
    client: LocalClient,
}

impl ConsensusConn {
    pub fn set_response_callback(&self, cb: GlobalCallback) {
        self.client.set_response_callback(cb);
    }

    pub fn error(&self) -> Option<String> {
        self.client.error()
    }

    pub fn init_chain_sync(&self, req: RequestInitChain) -> Result<ResponseInitChain> {
        match self.client.request_sync(Request::InitChain(req))? {
            Response::InitChain(res) => Ok(res),
            other => Err(unexpected("init_chain", &other)),
        }
    }

    pub fn begin_block_sync(&self, req: RequestBeginBlock) -> Result<ResponseBeginBlock> {
        match self.client.request_sync(Request::BeginBlock(req))? {
            Response::BeginBlock(res) => Ok(res),
            other => Err(unexpected("begin_block", &other)),
        }
    }

    pub fn deliver_tx_async(&self, req: RequestDeliverTx) -> Arc<ReqRes> {
        self.client.request_async(Request::DeliverTx(req))
    }

    pub fn end_block_sync(&self, req: RequestEndBlock) -> Result<ResponseEndBlock> {
        match self.client.request_sync(Request::EndBlock(req))? {
            Response::EndBlock(res) => Ok(res),
            other => Err(unexpected("end_block", &other)),
        }
    }

    pub fn commit_sync(&self) -> Result<ResponseCommit> {
        match self.client.request_sync(Request::Commit(RequestCommit {}))? {
            Response::Commit(res) => Ok(res),
            other => Err(unexpected("commit", &other)),
        }
    }

    pub fn get_app_hash_sync(&self, req: RequestGetAppHash) -> Result<ResponseGetAppHash> {
        match self.client.request_sync(Request::GetAppHash(req))? {
            Response::GetAppHash(res) => Ok(res),
            other => Err(unexpected("get_app_hash", &other)),
        }
    }

    pub fn generate_fraud_proof_sync(
        &self,
        req: RequestGenerateFraudProof,
    ) -> Result<ResponseGenerateFraudProof> {
        match self.client.request_sync(Request::GenerateFraudProof(req))? {
            Response::GenerateFraudProof(res) => Ok(res),
            other => Err(unexpected("generate_fraud_proof", &other)),
        }
    }

    pub fn verify_fraud_proof_sync(
        &self,
        req: RequestVerifyFraudProof,
    ) -> Result<ResponseVerifyFraudProof> {
        match self.client.request_sync(Request::VerifyFraudProof(req))? {
            Response::VerifyFraudProof(res) => Ok(res),
            other => Err(unexpected("verify_fraud_proof", &other)),
        }
    }

    pub fn info_sync(&self, req: RequestInfo) -> Result<ResponseInfo> {
        match self.client.request_sync(Request::Info(req))? {
            Response::Info(res) => Ok(res),
            other => Err(unexpected("info", &other)),
        }
    }
}

/// View used by the transaction ingress paths.
#[derive(Clone)]
pub struct MempoolConn {
    client: LocalClient,
}

impl MempoolConn {
    pub fn set_response_callback(&self, cb: GlobalCallback) {
        self.client.set_response_callback(cb);
    }

    pub fn error(&self) -> Option<String> {
        self.client.error()
    }

    pub fn check_tx_async(&self, req: RequestCheckTx) -> Arc<ReqRes> {
        self.client.request_async(Request::CheckTx(req))
    }

    pub fn check_tx_sync(&self, req: RequestCheckTx) -> Result<ResponseCheckTx> {
        match self.client.request_sync(Request::CheckTx(req))? {
            Response::CheckTx(res) => Ok(res),
            other => Err(unexpected("check_tx", &other)),
        }
    }

    pub fn flush_async(&self) -> Arc<ReqRes> {
        self.client.request_async(Request::Flush(RequestFlush {}))
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.client.request_sync(Request::Flush(RequestFlush {}))?;
        Ok(())
    }
}

/// Read-only query view.
#[derive(Clone)]
pub struct QueryConn {
    client: LocalClient,
}

impl QueryConn {
    pub fn error(&self) -> Option<String> {
        self.client.error()
    }

    pub fn echo_sync(&self, message: String) -> Result<ResponseEcho> {
        match self.client.request_sync(Request::Echo(RequestEcho { message }))? {
            Response::Echo(res) => Ok(res),
            other => Err(unexpected("echo", &other)),
        }
    }

    pub fn info_sync(&self, req: RequestInfo) -> Result<ResponseInfo> {
        match self.client.request_sync(Request::Info(req))? {
            Response::Info(res) => Ok(res),
            other => Err(unexpected("info", &other)),
        }
    }

    pub fn query_sync(&self, req: RequestQuery) -> Result<ResponseQuery> {
        match self.client.request_sync(Request::Query(req))? {
            Response::Query(res) => Ok(res),
            other => Err(unexpected("query", &other)),
        }
    }
}

/// State-sync snapshot view.
#[derive(Clone)]
pub struct SnapshotConn {
    client: LocalClient,
}

impl SnapshotConn {
    pub fn error(&self) -> Option<String> {
        self.client.error()
    }

    pub fn list_snapshots_sync(&self, req: RequestListSnapshots) -> Result<ResponseListSnapshots> {
        match self.client.request_sync(Request::ListSnapshots(req))? {
            Response::ListSnapshots(res) => Ok(res),
            other => Err(unexpected("list_snapshots", &other)),
        }
    }

    pub fn offer_snapshot_sync(&self, req: RequestOfferSnapshot) -> Result<ResponseOfferSnapshot> {
        match self.client.request_sync(Request::OfferSnapshot(req))? {
            Response::OfferSnapshot(res) => Ok(res),
            other => Err(unexpected("offer_snapshot", &other)),
        }
    }

    pub fn load_snapshot_chunk_sync(
        &self,
        req: RequestLoadSnapshotChunk,
    ) -> Result<ResponseLoadSnapshotChunk> {
        match self.client.request_sync(Request::LoadSnapshotChunk(req))? {
            Response::LoadSnapshotChunk(res) => Ok(res),
            other => Err(unexpected("load_snapshot_chunk", &other)),
        }
    }

    pub fn apply_snapshot_chunk_sync(
        &self,
        req: RequestApplySnapshotChunk,
    ) -> Result<ResponseApplySnapshotChunk> {
        match self.client.request_sync(Request::ApplySnapshotChunk(req))? {
            Response::ApplySnapshotChunk(res) => Ok(res),
            other => Err(unexpected("apply_snapshot_chunk", &other)),
        }
    }
}

/// The four connection views over one application client.
#[derive(Clone)]
pub struct AppConns {
    consensus: ConsensusConn,
    mempool: MempoolConn,
    query: QueryConn,
    snapshot: SnapshotConn,
}

impl AppConns {
    /// Build all four views over the given client.
    pub fn new(client: LocalClient) -> Self {
        Self {
            consensus: ConsensusConn {
                client: client.clone(),
            },
            mempool: MempoolConn {
                client: client.clone(),
            },
            query: QueryConn {
                client: client.clone(),
            },
            snapshot: SnapshotConn { client },
        }
    }

    pub fn consensus(&self) -> &ConsensusConn {
        &self.consensus
    }

    pub fn mempool(&self) -> &MempoolConn {
        &self.mempool
    }

    pub fn query(&self) -> &QueryConn {
        &self.query
    }

    pub fn snapshot(&self) -> &SnapshotConn {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aci::NoopApplication;

    #[test]
    fn test_views_share_one_client() {
        let conns = AppConns::new(LocalClient::new(NoopApplication));

        let check = conns
            .mempool()
            .check_tx_sync(RequestCheckTx::default())
            .unwrap();
        assert_eq!(check.code, CODE_TYPE_OK);

        let echo = conns.query().echo_sync("hello".to_string()).unwrap();
        assert_eq!(echo.message, "hello");

        conns.consensus().commit_sync().unwrap();
        assert!(conns.consensus().error().is_none());
        assert!(conns.snapshot().error().is_none());
    }
}
