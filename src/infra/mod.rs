//! Infrastructure layer implementations.

pub mod blockchain;
pub mod grace;

pub use blockchain::{EvmLedgerClient, LocalSigner, RpcClientConfig};
pub use grace::{InMemoryGraceStore, PostgresConfig, PostgresGraceStore};
