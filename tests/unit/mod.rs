// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the PostgresCluster operator
//!
//! This module contains unit tests for:
//! - Configuration generators (HBA order, determinism)
//! - Full reconciles against an in-memory platform
//! - Deletion handling
//! - Backup and pooler lifecycle

#[path = "../common/mod.rs"]
mod common;

mod backup;
mod deletion;
mod generators;
mod pgbouncer;
