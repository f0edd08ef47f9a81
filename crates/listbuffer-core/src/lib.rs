//! listbuffer-core: Core library for listbuffer
//!
//! This crate keeps two Redis lists near their target depths by spilling
//! overflow from the in-queue to local chunk files and reloading it into the
//! out-queue when consumers catch up.
//!
//! # Architecture
//!
//! ```text
//!   producers → in-queue ──── direct transfer ────→ out-queue → consumers
//!                  │                                    ↑
//!                spill                                reload
//!                  ↓                                    │
//!             ChunkStore (data_dir/*.txt) ←→ ChunkIndex (SQLite)
//! ```
//!
//! # Modules
//!
//! - `broker`: Queue broker contract with Redis and in-memory clients
//! - `chunk_index`: SQLite ledger of live chunks, ordered by id
//! - `chunk_store`: Chunk files, tail writer and read-head handling
//! - `control`: Tick classification and the buffer engine loop
//! - `shutdown`: Cancellation flag and signal watcher
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod broker;
pub mod chunk_index;
pub mod chunk_store;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};

/// One queue entry. Opaque bytes; never contains a newline once stored.
pub type Item = Vec<u8>;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
