//! Request coordination for a proxy in front of a replicated key-value
//! storage tier.
//!
//! Each client request is driven by one processor: it fans sub-requests out
//! to one storage replica per zone, applies a write quorum (W of N), runs a
//! prepare/commit protocol for writes, reconciles divergent replicas with
//! repairs, and sends exactly one reply to the client.

pub mod chaos;
pub mod codec;
pub mod conf;
pub mod env;
pub mod group;
pub mod hooks;
pub mod onephase;
pub mod ops;
pub mod pool;
pub mod process;
pub mod recency;
pub mod record;
pub mod replica;
pub mod request;
pub mod stats;
pub mod twophase;

pub use conf::ProcConfig;
pub use env::ProcessorEnv;
pub use pool::{ProcessorHandle, ProcessorPool, ProcessorPools};
pub use process::{process, ProcessorBase, RequestProcessor};
pub use request::{CancelHandle, InboundRequest};
