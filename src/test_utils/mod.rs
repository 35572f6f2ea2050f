//! Test doubles shared by unit tests, integration tests and benches.

pub mod mocks;

pub use mocks::{MockConfig, MockGraceStore, MockLedgerClient};
