// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Staging Store
//!
//! The embedded row store that owns all pipeline state: files, POIs,
//! relationships, the transactional outbox, evidence tracking, and
//! triangulation sessions.
//!
//! ## Safety & Concurrency
//!
//! `rusqlite::Connection` is not `Sync`. All SQLite I/O runs on a dedicated
//! worker thread that owns the connection; async callers submit closures
//! over an mpsc channel and await their result on a oneshot. Transactions
//! retry on contention with exponential backoff, and writers never hold a
//! transaction across an await point by construction.

mod errors;
pub mod queries;
pub mod schema;
mod sqlite;
mod writer;

pub use errors::{StoreError, StoreResult};
pub use sqlite::{StagingStore, StoreConfig};
pub use writer::{BatchWriter, BatchWriterConfig, WriteCommand, WriterStats};
