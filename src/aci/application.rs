//! Application interface
//!
//! The deterministic state machine driven by the node. Every method has a
//! no-op default returning a success code, so a unit struct is already a
//! valid application and real applications override only what they need.

use super::types::*;

/// The application side of the ACI.
///
/// Implementations are driven from behind the client's single mutex and
/// therefore never see concurrent calls.
pub trait Application: Send + 'static {
    fn echo(&mut self, req: RequestEcho) -> ResponseEcho {
        ResponseEcho {
            message: req.message,
        }
    }

    fn info(&mut self, _req: RequestInfo) -> ResponseInfo {
        ResponseInfo::default()
    }

    fn set_option(&mut self, _req: RequestSetOption) -> ResponseSetOption {
        ResponseSetOption::default()
    }

    fn deliver_tx(&mut self, _req: RequestDeliverTx) -> ResponseDeliverTx {
        ResponseDeliverTx {
            code: CODE_TYPE_OK,
            ..Default::default()
        }
    }

    fn check_tx(&mut self, _req: RequestCheckTx) -> ResponseCheckTx {
        ResponseCheckTx {
            code: CODE_TYPE_OK,
            ..Default::default()
        }
    }

    fn query(&mut self, _req: RequestQuery) -> ResponseQuery {
        ResponseQuery {
            code: CODE_TYPE_OK,
            ..Default::default()
        }
    }

    fn commit(&mut self) -> ResponseCommit {
        ResponseCommit::default()
    }

    fn init_chain(&mut self, _req: RequestInitChain) -> ResponseInitChain {
        ResponseInitChain::default()
    }

    fn begin_block(&mut self, _req: RequestBeginBlock) -> ResponseBeginBlock {
        ResponseBeginBlock::default()
    }

    fn end_block(&mut self, _req: RequestEndBlock) -> ResponseEndBlock {
        ResponseEndBlock::default()
    }

    fn list_snapshots(&mut self, _req: RequestListSnapshots) -> ResponseListSnapshots {
        ResponseListSnapshots::default()
    }

    fn offer_snapshot(&mut self, _req: RequestOfferSnapshot) -> ResponseOfferSnapshot {
        ResponseOfferSnapshot::default()
    }

    fn load_snapshot_chunk(&mut self, _req: RequestLoadSnapshotChunk) -> ResponseLoadSnapshotChunk {
        ResponseLoadSnapshotChunk::default()
    }

    fn apply_snapshot_chunk(
        &mut self,
        _req: RequestApplySnapshotChunk,
    ) -> ResponseApplySnapshotChunk {
        ResponseApplySnapshotChunk::default()
    }

    fn get_app_hash(&mut self, _req: RequestGetAppHash) -> ResponseGetAppHash {
        ResponseGetAppHash::default()
    }

    fn generate_fraud_proof(
        &mut self,
        _req: RequestGenerateFraudProof,
    ) -> ResponseGenerateFraudProof {
        ResponseGenerateFraudProof::default()
    }

    fn verify_fraud_proof(&mut self, _req: RequestVerifyFraudProof) -> ResponseVerifyFraudProof {
        ResponseVerifyFraudProof::default()
    }
}

/// Application that accepts everything and does nothing.
#[derive(Debug, Default)]
pub struct NoopApplication;

impl Application for NoopApplication {}
