//! Test helpers for peek-relay integration tests.
//!
//! - In-memory upstreams with release tracking
//! - A relay served over real TCP, plus a plain HTTP client for it

#![allow(unused_imports)] // Not every test file uses every helper

pub mod memory_upstream;
pub mod relay_server;

pub use memory_upstream::*;
pub use relay_server::*;

/// Deterministic payload that does not repeat at small scale.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
