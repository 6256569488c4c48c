//! Solana RPC and log-subscription plumbing.
//!
//! This crate provides the chain-facing side of the monitor: an RPC
//! client and `logsSubscribe` streams built on `solana_client`, and the
//! subscription manager that keeps one subscription per watched address
//! alive.
//!
//! ## Architecture
//!
//! - `endpoint` - Ordered RPC endpoint pool with rotation
//! - `rpc` - `ChainRpc` trait, `RpcClient`-backed implementation and mock
//! - `logs` - `LogStream` trait, `PubsubClient`-backed stream and mock
//! - `subscription` - Batched subscriptions, liveness check, reconnect loop

pub mod endpoint;
pub mod error;
pub mod logs;
pub mod rpc;
pub mod subscription;
pub mod transaction;

pub use endpoint::*;
pub use error::*;
pub use logs::*;
pub use rpc::*;
pub use subscription::*;
pub use transaction::*;
