//! Lamina: a modular rollup node runtime
//!
//! A process that produces, disseminates and validates a linear chain of
//! application-defined blocks. Block bodies are persisted to a pluggable
//! data availability layer while state transitions are driven through a
//! request/response interface to a user-supplied deterministic state
//! machine. A single aggregator produces blocks; full nodes re-execute
//! them from gossip and DA data; light nodes track headers and verify
//! fraud proofs.

pub mod aci;
pub mod config;
pub mod da;
pub mod header_exchange;
pub mod manager;
pub mod mempool;
pub mod node;
pub mod p2p;
pub mod rpc;
pub mod store;
pub mod types;

pub use node::{new_node, FullNode, LightNode, Node};
