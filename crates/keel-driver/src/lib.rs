//! Keel driver - reliable access to remote collection stores
//!
//! This crate provides:
//! - [`RemoteDriver`]: path and open-file operations against remote hosts,
//!   with POSIX error kinds on every failure
//! - A process-shared [`ConnectionCache`] of authenticated sessions, one per
//!   host, with idle eviction and generation counters
//! - A [`RetryEngine`] that reconnects and backs off on transient failures
//!   within a fixed deadline
//! - Backends: an in-memory store for tests and local use, and a client for
//!   the QUIC reference store served by [`StoreHost`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RemoteDriver  (path_ops, handle_ops, transfer)          │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ one attempt per iteration
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  RetryEngine   reconnect / back off / give up at 150 s   │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ acquire / invalidate
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  ConnectionCache   host key -> Connection (generation)   │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ RemoteBackend / Session
//!                              ▼
//!          MemoryBackend        StoreBackend ── QUIC ── StoreHost
//! ```

pub mod backend;
pub mod connection_cache;
pub mod driver;
pub mod handle_ops;
pub mod memory;
pub mod net;
pub mod path_ops;
pub mod retry;
pub mod store_client;
pub mod store_host;
pub mod transfer;

pub use backend::{ReadReply, RemoteBackend, RemoteResult, Session};
pub use connection_cache::{CacheOptions, Connection, ConnectionCache};
pub use driver::RemoteDriver;
pub use handle_ops::RemoteFile;
pub use memory::{MemoryBackend, Op};
pub use net::{CertFingerprint, NetError, QuicConnection};
pub use retry::{AttemptError, Backoff, RetryEngine, RetryLoop, RetryPolicy};
pub use store_client::{StoreBackend, StoreSession};
pub use store_host::{HostError, StoreHost, StoreHostConfig};
