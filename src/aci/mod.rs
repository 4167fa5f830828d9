//! Application-consensus interface
//!
//! The request/response protocol between the node and the user-supplied
//! deterministic state machine: tagged envelopes, the local client with
//! its single-mutex serialization, and the four connection views handed
//! to the rest of the node.

pub mod application;
pub mod client;
pub mod conns;
pub mod messages;
pub mod types;

pub use application::{Application, NoopApplication};
pub use client::{GlobalCallback, LocalClient, ReqRes, ResponseCallback};
pub use conns::{AppConns, ConsensusConn, MempoolConn, QueryConn, SnapshotConn};
pub use messages::{Request, Response};
