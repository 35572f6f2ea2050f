//! Mock implementations for testing.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::{
    AppError, BlockRef, BlockSummary, BlockchainError, DatabaseError, GracePeriodStore,
    LedgerClient, SignedTransaction,
};
use crate::infra::blockchain::IMetaToken;
use crate::infra::grace::InMemoryGraceStore;

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn error_message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// Scriptable in-memory ledger.
///
/// Broadcasts succeed unless an outcome was queued with
/// [`MockLedgerClient::script_broadcasts`]; each broadcast pops one outcome.
/// Accepted transactions enter a pool keyed by nonce: resending the same
/// transaction is answered like "already known", a different transaction at
/// a pooled nonce like "replacement transaction underpriced".
pub struct MockLedgerClient {
    config: MockConfig,
    is_healthy: AtomicBool,
    chain_id: u64,
    nonce: AtomicU64,
    pending_nonce: Mutex<Option<u64>>,
    nonce_failing: AtomicBool,
    pending_nonce_failing: AtomicBool,
    gas_price: Mutex<u128>,
    gas_price_step: Mutex<u128>,
    gas_price_failing: AtomicBool,
    broadcast_script: Mutex<VecDeque<Result<(), BlockchainError>>>,
    broadcast_delay: Mutex<Option<Duration>>,
    pool_before_reply: AtomicBool,
    pool: Mutex<HashMap<u64, TxHash>>,
    attempts: Mutex<Vec<SignedTransaction>>,
    accepted: Mutex<Vec<(u64, TxHash)>>,
    latest_block: Mutex<Option<BlockSummary>>,
    blocks: Mutex<HashMap<u64, BlockSummary>>,
    block_lookup_failing: AtomicBool,
    token_balances: Mutex<HashMap<Address, U256>>,
    native_balance: Mutex<U256>,
}

impl MockLedgerClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            is_healthy: AtomicBool::new(true),
            chain_id: 137,
            nonce: AtomicU64::new(0),
            pending_nonce: Mutex::new(None),
            nonce_failing: AtomicBool::new(false),
            pending_nonce_failing: AtomicBool::new(false),
            gas_price: Mutex::new(30_000_000_000),
            gas_price_step: Mutex::new(0),
            gas_price_failing: AtomicBool::new(false),
            broadcast_script: Mutex::new(VecDeque::new()),
            broadcast_delay: Mutex::new(None),
            pool_before_reply: AtomicBool::new(false),
            pool: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            latest_block: Mutex::new(None),
            blocks: Mutex::new(HashMap::new()),
            block_lookup_failing: AtomicBool::new(false),
            token_balances: Mutex::new(HashMap::new()),
            native_balance: Mutex::new(U256::ZERO),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Ledger whose confirmed transaction count starts at `nonce`
    #[must_use]
    pub fn with_nonce(nonce: u64) -> Self {
        let ledger = Self::new();
        ledger.set_nonce(nonce);
        ledger
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.nonce.store(nonce, Ordering::SeqCst);
    }

    /// Pending-pool nonce returned on resync; defaults to the confirmed nonce
    /// or one past the highest pooled nonce, whichever is larger
    pub fn set_pending_nonce(&self, nonce: u64) {
        *self.pending_nonce.lock().unwrap() = Some(nonce);
    }

    pub fn set_nonce_failing(&self, failing: bool) {
        self.nonce_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_pending_nonce_failing(&self, failing: bool) {
        self.pending_nonce_failing.store(failing, Ordering::SeqCst);
    }

    /// Raise the quoted gas price by `step` wei after every query
    pub fn set_gas_price_step(&self, step: u128) {
        *self.gas_price_step.lock().unwrap() = step;
    }

    pub fn set_gas_price_failing(&self, failing: bool) {
        self.gas_price_failing.store(failing, Ordering::SeqCst);
    }

    /// Queue outcomes for the next broadcasts, in order
    pub fn script_broadcasts(&self, outcomes: impl IntoIterator<Item = Result<(), BlockchainError>>) {
        self.broadcast_script.lock().unwrap().extend(outcomes);
    }

    pub fn set_broadcast_delay(&self, delay: Duration) {
        *self.broadcast_delay.lock().unwrap() = Some(delay);
    }

    /// Pool the transaction before the broadcast delay, so a caller that gives
    /// up waiting still leaves it on the node
    pub fn set_pool_before_reply(&self, enabled: bool) {
        self.pool_before_reply.store(enabled, Ordering::SeqCst);
    }

    /// Nonces currently held in the pool, ascending
    pub fn pooled_nonces(&self) -> Vec<u64> {
        let mut nonces: Vec<u64> = self.pool.lock().unwrap().keys().copied().collect();
        nonces.sort_unstable();
        nonces
    }

    /// Every signed transaction handed to `broadcast`, including failed attempts
    pub fn broadcast_attempts(&self) -> Vec<SignedTransaction> {
        self.attempts.lock().unwrap().clone()
    }

    /// `(nonce, hash)` of every broadcast that succeeded
    pub fn accepted(&self) -> Vec<(u64, TxHash)> {
        self.accepted.lock().unwrap().clone()
    }

    /// Nonces of every broadcast that succeeded, in order
    pub fn accepted_nonces(&self) -> Vec<u64> {
        self.accepted().into_iter().map(|(nonce, _)| nonce).collect()
    }

    pub fn set_latest_block(&self, block: BlockSummary) {
        *self.latest_block.lock().unwrap() = Some(block);
    }

    pub fn add_block(&self, block: BlockSummary) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    pub fn set_block_lookup_failing(&self, failing: bool) {
        self.block_lookup_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_token_balance(&self, account: Address, balance: U256) {
        self.token_balances.lock().unwrap().insert(account, balance);
    }

    pub fn set_native_balance(&self, balance: U256) {
        *self.native_balance.lock().unwrap() = balance;
    }

    fn check_should_fail(&self) -> Result<(), BlockchainError> {
        if self.config.should_fail {
            return Err(BlockchainError::Network(self.config.error_message()));
        }
        Ok(())
    }
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn health_check(&self) -> Result<(), BlockchainError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(BlockchainError::Network("Unhealthy".to_string()));
        }
        self.check_should_fail()
    }

    async fn chain_id(&self) -> Result<u64, BlockchainError> {
        self.check_should_fail()?;
        Ok(self.chain_id)
    }

    async fn get_nonce(&self, _address: Address) -> Result<u64, BlockchainError> {
        self.check_should_fail()?;
        if self.nonce_failing.load(Ordering::SeqCst) {
            return Err(BlockchainError::Timeout("nonce lookup".to_string()));
        }
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn get_pending_nonce(&self, address: Address) -> Result<u64, BlockchainError> {
        self.check_should_fail()?;
        if self.pending_nonce_failing.load(Ordering::SeqCst) {
            return Err(BlockchainError::Network("pending nonce lookup".to_string()));
        }
        let pending = *self.pending_nonce.lock().unwrap();
        if let Some(nonce) = pending {
            return Ok(nonce);
        }
        let confirmed = self.get_nonce(address).await?;
        let pooled = self.pool.lock().unwrap().keys().max().map(|n| n + 1);
        Ok(pooled.map_or(confirmed, |next| next.max(confirmed)))
    }

    async fn gas_price(&self) -> Result<u128, BlockchainError> {
        self.check_should_fail()?;
        if self.gas_price_failing.load(Ordering::SeqCst) {
            return Err(BlockchainError::Network("gas price unavailable".to_string()));
        }
        let mut price = self.gas_price.lock().unwrap();
        let quoted = *price;
        *price += *self.gas_price_step.lock().unwrap();
        Ok(quoted)
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<TxHash, BlockchainError> {
        self.check_should_fail()?;
        self.attempts.lock().unwrap().push(tx.clone());

        let scripted = self.broadcast_script.lock().unwrap().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }

        let pooled = self.pool.lock().unwrap().get(&tx.nonce).copied();
        match pooled {
            Some(hash) if hash == tx.hash => return Ok(tx.hash),
            Some(_) => {
                return Err(BlockchainError::NonceConflict(
                    "replacement transaction underpriced".to_string(),
                ));
            }
            None => {}
        }
        if self.pool_before_reply.load(Ordering::SeqCst) {
            self.pool.lock().unwrap().insert(tx.nonce, tx.hash);
        }

        let delay = *self.broadcast_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.pool.lock().unwrap().insert(tx.nonce, tx.hash);
        self.accepted.lock().unwrap().push((tx.nonce, tx.hash));
        Ok(tx.hash)
    }

    async fn is_transaction_known(&self, hash: TxHash) -> Result<bool, BlockchainError> {
        self.check_should_fail()?;
        Ok(self.pool.lock().unwrap().values().any(|pooled| *pooled == hash))
    }

    async fn get_block(&self, block: BlockRef) -> Result<Option<BlockSummary>, BlockchainError> {
        self.check_should_fail()?;
        if self.block_lookup_failing.load(Ordering::SeqCst) {
            return Err(BlockchainError::Network("block lookup".to_string()));
        }
        Ok(match block {
            BlockRef::Latest => *self.latest_block.lock().unwrap(),
            BlockRef::Number(n) => self.blocks.lock().unwrap().get(&n).copied(),
        })
    }

    async fn call(
        &self,
        _to: Address,
        data: Bytes,
        _block: BlockRef,
    ) -> Result<Bytes, BlockchainError> {
        self.check_should_fail()?;
        let decoded = IMetaToken::balanceOfCall::abi_decode(&data).map_err(|_| {
            BlockchainError::Rejected {
                reason: "execution reverted".to_string(),
                accepted: false,
            }
        })?;
        let balance = self
            .token_balances
            .lock()
            .unwrap()
            .get(&decoded.account)
            .copied()
            .unwrap_or(U256::ZERO);
        Ok(Bytes::from(balance.to_be_bytes::<32>().to_vec()))
    }

    async fn get_balance(&self, _address: Address) -> Result<U256, BlockchainError> {
        self.check_should_fail()?;
        Ok(*self.native_balance.lock().unwrap())
    }
}

/// Grace-period store with switchable failures over [`InMemoryGraceStore`]
pub struct MockGraceStore {
    inner: InMemoryGraceStore,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MockGraceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            inner: InMemoryGraceStore::new(),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(
                self.config.error_message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockGraceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GracePeriodStore for MockGraceStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn last_accepted(&self, sender: Address) -> Result<Option<DateTime<Utc>>, AppError> {
        self.check_should_fail()?;
        self.inner.last_accepted(sender).await
    }

    async fn record_accepted(&self, sender: Address, at: DateTime<Utc>) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.inner.record_accepted(sender, at).await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, AppError> {
        self.check_should_fail()?;
        self.inner.purge_older_than(cutoff).await
    }
}
