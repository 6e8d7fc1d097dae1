// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prepared operations, one module per table family.
//!
//! Every function takes a `&Connection` (a `Transaction` derefs to one), so
//! callers choose the transactional scope. Inserts that must be idempotent
//! use `INSERT OR IGNORE` against the natural unique key.

pub mod evidence;
pub mod files;
pub mod outbox;
pub mod pois;
pub mod relationships;
pub mod runs;
pub mod triangulation;
