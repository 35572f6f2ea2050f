//! Grace-period store implementations.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryGraceStore;
pub use postgres::{PostgresConfig, PostgresGraceStore};
