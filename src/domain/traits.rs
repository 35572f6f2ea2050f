//! Domain traits defining contracts for external systems.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{AppError, BlockchainError, SigningError};
use super::types::{BlockRef, BlockSummary, SignedTransaction, UnsignedTransaction};

/// Holds the relayer key and turns transaction fields into raw bytes.
///
/// Implementations must be pure with respect to external state and must
/// never log or expose the key material.
pub trait TransactionSigner: Send + Sync {
    /// Address derived from the key
    fn address(&self) -> Address;

    /// Produce a signed, serialized transaction
    fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, SigningError>;
}

/// Thin access to the chain node.
///
/// Errors are the closed [`BlockchainError`] set; the dispatch queue decides
/// retry behaviour from the variant alone.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Check node connectivity
    async fn health_check(&self) -> Result<(), BlockchainError> {
        self.chain_id().await.map(|_| ())
    }

    /// EIP-155 chain id
    async fn chain_id(&self) -> Result<u64, BlockchainError>;

    /// Confirmed transaction count of `address`
    async fn get_nonce(&self, address: Address) -> Result<u64, BlockchainError>;

    /// Transaction count including the node's pending pool
    async fn get_pending_nonce(&self, address: Address) -> Result<u64, BlockchainError> {
        self.get_nonce(address).await
    }

    /// Current gas price in wei
    async fn gas_price(&self) -> Result<u128, BlockchainError>;

    /// Submit a signed transaction to the node's pool
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<TxHash, BlockchainError>;

    /// Whether the node holds `hash` in its pool or chain
    async fn is_transaction_known(&self, hash: TxHash) -> Result<bool, BlockchainError>;

    /// Header summary of a block, `None` if the node does not know it
    async fn get_block(&self, block: BlockRef) -> Result<Option<BlockSummary>, BlockchainError>;

    /// Read-only contract call at the given block
    async fn call(&self, to: Address, data: Bytes, block: BlockRef)
    -> Result<Bytes, BlockchainError>;

    /// Native balance of `address` at the latest block
    async fn get_balance(&self, address: Address) -> Result<U256, BlockchainError>;
}

/// Key-value store of per-sender acceptance timestamps backing the grace period.
///
/// Entries older than the configured grace period carry no meaning and may be
/// evicted at any time through [`GracePeriodStore::purge_older_than`].
#[async_trait]
pub trait GracePeriodStore: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    /// When a request from `sender` was last accepted
    async fn last_accepted(&self, sender: Address) -> Result<Option<DateTime<Utc>>, AppError>;

    /// Record that a request from `sender` was accepted at `at`
    async fn record_accepted(&self, sender: Address, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Drop entries recorded before `cutoff`, returning how many were removed
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, AppError>;
}
