//! Local ACI client
//!
//! Serves an in-process application from behind a single mutex. Async
//! calls invoke the application synchronously inside the lock, publish the
//! response through the process-wide callback and return a [`ReqRes`]
//! that is already completed. Only one application call is ever in
//! flight, so callers observe a total order matching call order.

use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;

use super::application::Application;
use super::messages::{Request, Response};

/// Process-wide callback invoked once per successful async request.
pub type GlobalCallback = Box<dyn Fn(&Request, &Response) + Send + Sync>;

/// Per-request callback, invoked at most once.
pub type ResponseCallback = Box<dyn FnOnce(&Response) + Send>;

/// Pairing of an outbound request with its eventual response: a
/// completion latch, a response slot and at most one post-completion
/// callback.
pub struct ReqRes {
    request: Request,
    state: Mutex<ReqResState>,
    latch: Condvar,
}

struct ReqResState {
    response: Option<Response>,
    completed: bool,
    // Tracks whether the regular completion path already ran, so a
    // callback installed afterwards is invoked inline instead of twice.
    callback_invoked: bool,
    callback: Option<ResponseCallback>,
}

impl ReqRes {
    /// A pending request/response pair.
    pub fn new(request: Request) -> Arc<Self> {
        Arc::new(Self {
            request,
            state: Mutex::new(ReqResState {
                response: None,
                completed: false,
                callback_invoked: false,
                callback: None,
            }),
            latch: Condvar::new(),
        })
    }

    /// A pair born completed, as produced by the local client.
    pub fn completed(request: Request, response: Response) -> Arc<Self> {
        Arc::new(Self {
            request,
            state: Mutex::new(ReqResState {
                response: Some(response),
                completed: true,
                callback_invoked: true,
                callback: None,
            }),
            latch: Condvar::new(),
        })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response, if the latch has been released.
    pub fn response(&self) -> Option<Response> {
        self.state.lock().unwrap().response.clone()
    }

    /// Block until the response is published.
    pub fn wait(&self) -> Response {
        let mut state = self.state.lock().unwrap();
        while !state.completed {
            state = self.latch.wait(state).unwrap();
        }
        state
            .response
            .clone()
            .expect("response slot is written before the latch is released")
    }

    /// Install the callback. If the pair is already completed the
    /// callback runs inline, under the guarding lock.
    pub fn set_callback(&self, cb: ResponseCallback) {
        let mut state = self.state.lock().unwrap();
        if state.callback_invoked {
            if let Some(response) = &state.response {
                cb(response);
            }
            return;
        }
        state.callback = Some(cb);
    }

    /// Publish the response, release the latch and run the callback if
    /// one was installed.
    pub fn complete(&self, response: Response) {
        let mut state = self.state.lock().unwrap();
        if state.completed {
            log::warn!("request completed twice: {}", self.request.kind());
            return;
        }
        state.response = Some(response);
        state.completed = true;
        if let Some(cb) = state.callback.take() {
            let response = state.response.clone();
            if let Some(response) = &response {
                cb(response);
            }
        }
        state.callback_invoked = true;
        self.latch.notify_all();
    }
}

struct LocalClientInner {
    app: Box<dyn Application>,
    callback: Option<GlobalCallback>,
}

/// Client serving an in-process application. Cloning shares the same
/// underlying connection and mutex.
#[derive(Clone)]
pub struct LocalClient {
    inner: Arc<Mutex<LocalClientInner>>,
}

impl LocalClient {
    pub fn new<A: Application>(app: A) -> Self {
        Self::from_boxed(Box::new(app))
    }

    pub fn from_boxed(app: Box<dyn Application>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LocalClientInner {
                app,
                callback: None,
            })),
        }
    }

    /// Install the process-wide response callback, under the same lock as
    /// request dispatch.
    pub fn set_response_callback(&self, cb: GlobalCallback) {
        let mut inner = self.inner.lock().unwrap();
        inner.callback = Some(cb);
    }

    /// Latched terminal error; always `None` for the local variant.
    pub fn error(&self) -> Option<String> {
        None
    }

    /// Invoke the application inside the lock, publish through the global
    /// callback and return an already-completed pair.
    pub fn request_async(&self, req: Request) -> Arc<ReqRes> {
        let mut inner = self.inner.lock().unwrap();
        let response = dispatch(inner.app.as_mut(), req.clone());
        if let Some(cb) = &inner.callback {
            cb(&req, &response);
        }
        ReqRes::completed(req, response)
    }

    /// Same as [`request_async`](Self::request_async) but returns the
    /// response directly without touching the global callback.
    pub fn request_sync(&self, req: Request) -> Result<Response> {
        let mut inner = self.inner.lock().unwrap();
        Ok(dispatch(inner.app.as_mut(), req))
    }
}

fn dispatch(app: &mut dyn Application, req: Request) -> Response {
    match req {
        Request::Echo(r) => Response::Echo(app.echo(r)),
        Request::Flush(_) => Response::Flush(Default::default()),
        Request::Info(r) => Response::Info(app.info(r)),
        Request::SetOption(r) => Response::SetOption(app.set_option(r)),
        Request::DeliverTx(r) => Response::DeliverTx(app.deliver_tx(r)),
        Request::CheckTx(r) => Response::CheckTx(app.check_tx(r)),
        Request::Query(r) => Response::Query(app.query(r)),
        Request::Commit(_) => Response::Commit(app.commit()),
        Request::InitChain(r) => Response::InitChain(app.init_chain(r)),
        Request::BeginBlock(r) => Response::BeginBlock(app.begin_block(r)),
        Request::EndBlock(r) => Response::EndBlock(app.end_block(r)),
        Request::ListSnapshots(r) => Response::ListSnapshots(app.list_snapshots(r)),
        Request::OfferSnapshot(r) => Response::OfferSnapshot(app.offer_snapshot(r)),
        Request::LoadSnapshotChunk(r) => Response::LoadSnapshotChunk(app.load_snapshot_chunk(r)),
        Request::ApplySnapshotChunk(r) => Response::ApplySnapshotChunk(app.apply_snapshot_chunk(r)),
        Request::GetAppHash(r) => Response::GetAppHash(app.get_app_hash(r)),
        Request::GenerateFraudProof(r) => Response::GenerateFraudProof(app.generate_fraud_proof(r)),
        Request::VerifyFraudProof(r) => Response::VerifyFraudProof(app.verify_fraud_proof(r)),
    }
}
