//! extfilter-worker — per-core packet analysis worker.
//!
//! Consumes raw Ethernet frames handed over by a distributor, reconstructs
//! flow context, feeds payload bytes into a DPI engine, matches HTTP
//! request URLs and TLS client identifiers against blocklists, and emits
//! interdiction orders (RST or HTTP redirect) through an outbound queue.
//!
//! ## Modules
//!
//! - [`decoder`]: Ethernet/VLAN/MPLS/IPv4/IPv6/TCP decode.
//! - [`flow`]: per-core flow table and backing pool.
//! - [`interdiction`]: pre-DPI ip:port fast path and the sender queue contract.
//! - [`dpi`]: DPI driver state machine plus a reference `DpiEngine`.
//! - [`http_classifier`] / [`tls_classifier`]: blocklist matching and verdicts.
//! - [`gc`]: amortized idle-flow eviction.
//! - [`worker`]: the packet loop tying everything together.
//! - [`config`]: shared, try-lock-guarded blocklist/flag configuration.
//! - [`stats`]: the `ThreadStats` counter surface.
//! - [`error`]: the error taxonomy.

pub mod config;
pub mod decoder;
pub mod dpi;
pub mod error;
pub mod flow;
pub mod gc;
pub mod http_classifier;
pub mod interdiction;
pub mod stats;
pub mod tls_classifier;
pub mod worker;

pub use error::{Result, WorkerError};
