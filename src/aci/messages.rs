//! Tagged request/response envelopes
//!
//! The whole protocol is a closed tagged union: one `Request` and one
//! `Response` enum, so a transport needs a single message discriminator.

use serde::{Deserialize, Serialize};

use super::types::*;

/// Outer request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Echo(RequestEcho),
    Flush(RequestFlush),
    Info(RequestInfo),
    SetOption(RequestSetOption),
    DeliverTx(RequestDeliverTx),
    CheckTx(RequestCheckTx),
    Query(RequestQuery),
    Commit(RequestCommit),
    InitChain(RequestInitChain),
    BeginBlock(RequestBeginBlock),
    EndBlock(RequestEndBlock),
    ListSnapshots(RequestListSnapshots),
    OfferSnapshot(RequestOfferSnapshot),
    LoadSnapshotChunk(RequestLoadSnapshotChunk),
    ApplySnapshotChunk(RequestApplySnapshotChunk),
    GetAppHash(RequestGetAppHash),
    GenerateFraudProof(RequestGenerateFraudProof),
    VerifyFraudProof(RequestVerifyFraudProof),
}

impl Request {
    /// Short name of the carried request, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Echo(_) => "echo",
            Request::Flush(_) => "flush",
            Request::Info(_) => "info",
            Request::SetOption(_) => "set_option",
            Request::DeliverTx(_) => "deliver_tx",
            Request::CheckTx(_) => "check_tx",
            Request::Query(_) => "query",
            Request::Commit(_) => "commit",
            Request::InitChain(_) => "init_chain",
            Request::BeginBlock(_) => "begin_block",
            Request::EndBlock(_) => "end_block",
            Request::ListSnapshots(_) => "list_snapshots",
            Request::OfferSnapshot(_) => "offer_snapshot",
            Request::LoadSnapshotChunk(_) => "load_snapshot_chunk",
            Request::ApplySnapshotChunk(_) => "apply_snapshot_chunk",
            Request::GetAppHash(_) => "get_app_hash",
            Request::GenerateFraudProof(_) => "generate_fraud_proof",
            Request::VerifyFraudProof(_) => "verify_fraud_proof",
        }
    }
}

/// Outer response envelope. `Exception` carries transport-level failures
/// and can answer any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Exception(ResponseException),
    Echo(ResponseEcho),
    Flush(ResponseFlush),
    Info(ResponseInfo),
    SetOption(ResponseSetOption),
    DeliverTx(ResponseDeliverTx),
    CheckTx(ResponseCheckTx),
    Query(ResponseQuery),
    Commit(ResponseCommit),
    InitChain(ResponseInitChain),
    BeginBlock(ResponseBeginBlock),
    EndBlock(ResponseEndBlock),
    ListSnapshots(ResponseListSnapshots),
    OfferSnapshot(ResponseOfferSnapshot),
    LoadSnapshotChunk(ResponseLoadSnapshotChunk),
    ApplySnapshotChunk(ResponseApplySnapshotChunk),
    GetAppHash(ResponseGetAppHash),
    GenerateFraudProof(ResponseGenerateFraudProof),
    VerifyFraudProof(ResponseVerifyFraudProof),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Exception(_) => "exception",
            Response::Echo(_) => "echo",
            Response::Flush(_) => "flush",
            Response::Info(_) => "info",
            Response::SetOption(_) => "set_option",
            Response::DeliverTx(_) => "deliver_tx",
            Response::CheckTx(_) => "check_tx",
            Response::Query(_) => "query",
            Response::Commit(_) => "commit",
            Response::InitChain(_) => "init_chain",
            Response::BeginBlock(_) => "begin_block",
            Response::EndBlock(_) => "end_block",
            Response::ListSnapshots(_) => "list_snapshots",
            Response::OfferSnapshot(_) => "offer_snapshot",
            Response::LoadSnapshotChunk(_) => "load_snapshot_chunk",
            Response::ApplySnapshotChunk(_) => "apply_snapshot_chunk",
            Response::GetAppHash(_) => "get_app_hash",
            Response::GenerateFraudProof(_) => "generate_fraud_proof",
            Response::VerifyFraudProof(_) => "verify_fraud_proof",
        }
    }

    pub fn as_deliver_tx(&self) -> Option<&ResponseDeliverTx> {
        match self {
            Response::DeliverTx(res) => Some(res),
            _ => None,
        }
    }

    pub fn as_check_tx(&self) -> Option<&ResponseCheckTx> {
        match self {
            Response::CheckTx(res) => Some(res),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::types::serialization;

    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let req = Request::DeliverTx(RequestDeliverTx {
            tx: vec![1, 2, 3],
        });
        let bytes = serialization::encode(&req).unwrap();
        let decoded: Request = serialization::decode(&bytes).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.kind(), "deliver_tx");
    }

    #[test]
    fn test_exception_answers_any_request() {
        let resp = Response::Exception(ResponseException {
            error: "connection lost".to_string(),
        });
        let bytes = serialization::encode(&resp).unwrap();
        let decoded: Response = serialization::decode(&bytes).unwrap();
        assert_eq!(decoded.kind(), "exception");
    }
}
