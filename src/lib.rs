//! Meta-transaction relayer.
//!
//! Accepts pre-signed ERC-20 meta-transactions over HTTP and broadcasts them
//! from a single funded key through a nonce-safe dispatch queue.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
