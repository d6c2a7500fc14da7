//! streamgate - HTTP range-streaming gateway library
//!
//! Exposes media archived in a chat object store as byte-range-addressable
//! URLs suitable for direct playback. A pool of upstream sessions feeds a
//! range-aligned streaming engine with per-request failover; a ledger of
//! load, cool-off, and per-file blindness drives session selection.
//!
//! # Architecture
//!
//! - `upstream`: the session seam (backend trait, MTProto and in-memory
//!   implementations, descriptor synthesis)
//! - `pool`: session lifecycle, keyed by small integer ids
//! - `ledger`: work loads, blacklist, and blind tables plus the per-request
//!   touch-list guard
//! - `router`: least-loaded session selection
//! - `resolver`: descriptor cache with single-flight deduplication
//! - `stream`: range grammar, chunk alignment, and the failover engine
//! - `http`: axum frontend (file endpoint, watch page, status, CORS)
//! - `maintenance`: periodic reconnection, probing, and ledger sweeping
//! - `config` / `cli` / `error`: the usual service scaffolding

pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod ledger;
pub mod maintenance;
pub mod pool;
pub mod resolver;
pub mod router;
pub mod stream;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use error::{GatewayError, Result};
pub use ledger::{Ledger, LedgerGuard};
pub use pool::SessionPool;
pub use resolver::Resolver;

/// Session identifier within the pool.
pub type SessionId = usize;

/// Message identifier within the archive chat.
pub type MessageId = i32;

/// The always-present primary session.
pub const PRIMARY_SESSION_ID: SessionId = 0;

/// Reserved id of the optional power session (user credential).
pub const POWER_SESSION_ID: SessionId = 99;

/// Fixed upstream chunk size: all byte-range translation is relative to
/// this granularity.
pub const CHUNK_SIZE: u64 = 1024 * 1024;
