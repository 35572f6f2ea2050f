//! Dispatch queue: serializes transactions for the single relayer key.
//!
//! One worker task owns the nonce counter and the backlog. Callers only ever
//! touch the sending half of the backlog channel, under a short lock that also
//! guards the lifecycle state, so a job is either admitted before `stop()`
//! begins or rejected with [`DispatchError::QueueNotRunning`].

use std::env;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    BlockchainError, DispatchError, FailureClass, Job, JobReceipt, JobStatus, LedgerClient,
    QueueState, SigningError, TransactionSigner, TxRequest, UnsignedTransaction,
};

/// Retry and transaction parameters of the dispatch worker
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Broadcast attempts per job before giving up on transient failures
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single gas price query or broadcast
    pub attempt_timeout: Duration,
    /// Fixed gas price in wei; queried from the node per attempt when unset
    pub gas_price: Option<u128>,
    pub gas_limit: u64,
    /// Chain id; queried from the node at start when unset
    pub chain_id: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(30),
            gas_price: None,
            gas_limit: 250_000,
            chain_id: None,
        }
    }
}

impl DispatchConfig {
    /// Load from environment variables, falling back to defaults
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_attempts: env::var("DISPATCH_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &u32| n > 0)
                .unwrap_or(defaults.max_attempts),
            initial_backoff: env::var("DISPATCH_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: env::var("DISPATCH_MAX_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            attempt_timeout: env::var("DISPATCH_ATTEMPT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_timeout),
            gas_price: env::var("GAS_PRICE_WEI")
                .ok()
                .and_then(|v| v.parse().ok()),
            gas_limit: env::var("GAS_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.gas_limit),
            chain_id: env::var("CHAIN_ID").ok().and_then(|v| v.parse().ok()),
        }
    }
}

/// Delay before retry number `failures` (1-based): doubles from `initial`, capped at `max`
#[must_use]
pub fn backoff_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent).min(max)
}

/// Next nonce to use for the relayer key.
///
/// Only ever moves forward. Owned by the worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCounter {
    next: u64,
}

impl NonceCounter {
    #[must_use]
    pub fn new(next: u64) -> Self {
        Self { next }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.next
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }

    /// Adopt a nonce observed on the node, never moving backwards
    pub fn resync(&mut self, observed: u64) -> u64 {
        self.next = self.next.max(observed);
        self.next
    }
}

type JobResult = Result<JobReceipt, DispatchError>;

struct Envelope {
    job: Job,
    reply: oneshot::Sender<JobResult>,
}

/// Resolves exactly once with the outcome of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    #[must_use]
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Future for JobHandle {
    type Output = JobResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::WorkerGone)))
    }
}

#[derive(Default)]
struct Admission {
    state: QueueState,
    backlog: Option<mpsc::UnboundedSender<Envelope>>,
}

/// FIFO queue that signs and broadcasts jobs with strictly increasing nonces
pub struct DispatchQueue {
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<dyn TransactionSigner>,
    config: DispatchConfig,
    address: Address,
    admission: Mutex<Admission>,
    queue_size: Arc<AtomicUsize>,
    lifecycle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<dyn TransactionSigner>,
        config: DispatchConfig,
    ) -> Self {
        let address = signer.address();
        Self {
            ledger,
            signer,
            config,
            address,
            admission: Mutex::new(Admission::default()),
            queue_size: Arc::new(AtomicUsize::new(0)),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Relayer address that pays for every dispatched transaction
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Jobs admitted but not yet terminal
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        self.admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Resolve chain id and starting nonce, then spawn the worker.
    ///
    /// A no-op on a running queue. On failure the queue stays stopped and
    /// `start` may be called again.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut worker_slot = self.lifecycle.lock().await;

        match self.state() {
            QueueState::Running => return Ok(()),
            QueueState::Draining => {
                return Err(DispatchError::Startup("queue is draining".to_string()));
            }
            QueueState::Stopped => {}
        }

        let chain_id = match self.config.chain_id {
            Some(id) => id,
            None => self
                .ledger
                .chain_id()
                .await
                .map_err(|e| DispatchError::Startup(format!("failed to fetch chain id: {}", e)))?,
        };
        let nonce = self
            .ledger
            .get_nonce(self.address)
            .await
            .map_err(|e| DispatchError::Startup(format!("failed to fetch nonce: {}", e)))?;

        let (backlog, rx) = mpsc::unbounded_channel();
        let worker = DispatchWorker {
            ledger: Arc::clone(&self.ledger),
            signer: Arc::clone(&self.signer),
            config: self.config.clone(),
            address: self.address,
            chain_id,
            nonce: NonceCounter::new(nonce),
            queue_size: Arc::clone(&self.queue_size),
        };
        *worker_slot = Some(tokio::spawn(worker.run(rx)));

        {
            let mut admission = self
                .admission
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            admission.state = QueueState::Running;
            admission.backlog = Some(backlog);
        }

        info!(chain_id = chain_id, nonce = nonce, "Dispatch queue started");
        Ok(())
    }

    /// Stop admitting jobs and wait until every admitted job is terminal.
    ///
    /// Idempotent; concurrent callers all return after the drain completes.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut worker_slot = self.lifecycle.lock().await;

        let backlog = {
            let mut admission = self
                .admission
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if admission.state == QueueState::Stopped {
                return;
            }
            admission.state = QueueState::Draining;
            admission.backlog.take()
        };

        info!(pending = self.queue_size(), "Draining dispatch queue");
        // The worker exits once the channel is closed and empty
        drop(backlog);

        if let Some(worker) = worker_slot.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Dispatch worker terminated abnormally");
            }
        }

        self.admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = QueueState::Stopped;
        info!("Dispatch queue stopped");
    }

    /// Append a job to the backlog. Never touches the network.
    pub fn submit(&self, request: TxRequest) -> Result<JobHandle, DispatchError> {
        let admission = self
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let backlog = match (&admission.state, &admission.backlog) {
            (QueueState::Running, Some(backlog)) => backlog,
            _ => return Err(DispatchError::QueueNotRunning),
        };

        let job = Job::new(request);
        let job_id = job.id;
        let (reply, rx) = oneshot::channel();

        self.queue_size.fetch_add(1, Ordering::SeqCst);
        if backlog.send(Envelope { job, reply }).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::QueueNotRunning);
        }

        debug!(job_id = %job_id, "Job admitted");
        Ok(JobHandle { job_id, rx })
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.lifecycle.get_mut().take() {
            worker.abort();
        }
    }
}

enum AttemptError {
    Signing(SigningError),
    /// Failed before anything was sent
    Ledger(BlockchainError),
    /// The node may or may not have received `tx_hash`
    Broadcast {
        error: BlockchainError,
        tx_hash: TxHash,
    },
}

struct DispatchWorker {
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<dyn TransactionSigner>,
    config: DispatchConfig,
    address: Address,
    chain_id: u64,
    nonce: NonceCounter,
    queue_size: Arc<AtomicUsize>,
}

impl DispatchWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { job, reply }) = rx.recv().await {
            let job_id = job.id;
            let result = self.process(job).await;

            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            if reply.send(result).is_err() {
                debug!(job_id = %job_id, "Caller dropped job handle before completion");
            }
        }
        debug!(next_nonce = self.nonce.current(), "Dispatch worker exiting");
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn process(&mut self, mut job: Job) -> JobResult {
        let mut attempts = 0u32;
        let mut transient_failures = 0u32;
        let mut resynced = false;
        // Fixed for the job so every retry at one nonce is the same transaction
        let mut gas_price = self.config.gas_price;
        // Last broadcast whose outcome is unknown, as (nonce, hash)
        let mut in_doubt: Option<(u64, TxHash)> = None;

        loop {
            attempts += 1;
            let nonce = self.nonce.current();

            let error = match self.attempt(&mut job, nonce, &mut gas_price).await {
                Ok(tx_hash) => return Ok(self.complete(&mut job, nonce, tx_hash, attempts)),
                Err(AttemptError::Signing(e)) => {
                    set_status(&mut job, JobStatus::Failed);
                    warn!(nonce = nonce, error = %e, "Signing failed");
                    return Err(DispatchError::Signing(e));
                }
                Err(AttemptError::Ledger(e)) => e,
                Err(AttemptError::Broadcast { error, tx_hash }) => {
                    if error.is_transient() {
                        in_doubt = Some((nonce, tx_hash));
                    }
                    error
                }
            };

            match error.classify() {
                FailureClass::Transient => {
                    transient_failures += 1;
                    if transient_failures >= self.config.max_attempts {
                        set_status(&mut job, JobStatus::Failed);
                        warn!(nonce = nonce, attempt = attempts, error = %error, "Retries exhausted");
                        return Err(DispatchError::RetriesExhausted {
                            attempts,
                            last_error: error.to_string(),
                        });
                    }
                    let delay = backoff_delay(
                        self.config.initial_backoff,
                        self.config.max_backoff,
                        transient_failures,
                    );
                    warn!(
                        nonce = nonce,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient broadcast failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureClass::NonceConflict => {
                    if let Some((doubt_nonce, tx_hash)) = in_doubt.filter(|(n, _)| *n == nonce) {
                        if self.is_pooled(tx_hash).await {
                            info!(nonce = doubt_nonce, tx_hash = %tx_hash, "Earlier broadcast reached the node");
                            return Ok(self.complete(&mut job, doubt_nonce, tx_hash, attempts));
                        }
                    }
                    if resynced {
                        set_status(&mut job, JobStatus::Failed);
                        warn!(nonce = nonce, error = %error, "Nonce conflict persisted after resync");
                        return Err(DispatchError::NonceConflict(error.to_string()));
                    }
                    resynced = true;
                    let observed = match self.fetch_pending_nonce().await {
                        Ok(observed) => observed,
                        Err(e) => {
                            set_status(&mut job, JobStatus::Failed);
                            return Err(DispatchError::NonceConflict(format!(
                                "{}; resync failed: {}",
                                error, e
                            )));
                        }
                    };
                    let next = self.nonce.resync(observed);
                    warn!(stale = nonce, observed = observed, next = next, "Nonce conflict, resynced counter");
                }
                FailureClass::Permanent { accepted } => {
                    set_status(&mut job, JobStatus::Failed);
                    if accepted {
                        self.nonce.advance();
                    }
                    let reason = match error {
                        BlockchainError::Rejected { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    warn!(nonce = nonce, accepted = accepted, reason = %reason, "Transaction rejected");
                    return Err(DispatchError::Rejected(reason));
                }
            }
        }
    }

    fn complete(&mut self, job: &mut Job, nonce: u64, tx_hash: TxHash, attempts: u32) -> JobReceipt {
        self.nonce.advance();
        set_status(job, JobStatus::Broadcast);
        info!(nonce = nonce, tx_hash = %tx_hash, attempt = attempts, "Transaction broadcast");
        JobReceipt {
            job_id: job.id,
            tx_hash,
            nonce,
            attempts,
        }
    }

    /// Sign at `nonce` and broadcast once
    async fn attempt(
        &self,
        job: &mut Job,
        nonce: u64,
        gas_price: &mut Option<u128>,
    ) -> Result<TxHash, AttemptError> {
        let gas_price = match *gas_price {
            Some(price) => price,
            None => {
                let price = self.query_gas_price().await.map_err(AttemptError::Ledger)?;
                *gas_price = Some(price);
                price
            }
        };

        set_status(job, JobStatus::Signing);
        let unsigned = UnsignedTransaction {
            chain_id: self.chain_id,
            nonce,
            to: job.request.to,
            data: job.request.data.clone(),
            value: job.request.value,
            gas_price,
            gas_limit: self.config.gas_limit,
        };
        let signed = self.signer.sign(&unsigned).map_err(AttemptError::Signing)?;

        set_status(job, JobStatus::Broadcasting);
        let result =
            match tokio::time::timeout(self.config.attempt_timeout, self.ledger.broadcast(&signed))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BlockchainError::Timeout(format!(
                    "broadcast exceeded {:?}",
                    self.config.attempt_timeout
                ))),
            };
        result.map_err(|error| AttemptError::Broadcast {
            error,
            tx_hash: signed.hash,
        })
    }

    async fn is_pooled(&self, tx_hash: TxHash) -> bool {
        match tokio::time::timeout(
            self.config.attempt_timeout,
            self.ledger.is_transaction_known(tx_hash),
        )
        .await
        {
            Ok(Ok(known)) => known,
            Ok(Err(e)) => {
                warn!(tx_hash = %tx_hash, error = %e, "Transaction lookup failed");
                false
            }
            Err(_) => {
                warn!(tx_hash = %tx_hash, "Transaction lookup timed out");
                false
            }
        }
    }

    async fn query_gas_price(&self) -> Result<u128, BlockchainError> {
        tokio::time::timeout(self.config.attempt_timeout, self.ledger.gas_price())
            .await
            .map_err(|_| {
                BlockchainError::Timeout(format!(
                    "gas price query exceeded {:?}",
                    self.config.attempt_timeout
                ))
            })?
    }

    async fn fetch_pending_nonce(&self) -> Result<u64, BlockchainError> {
        tokio::time::timeout(
            self.config.attempt_timeout,
            self.ledger.get_pending_nonce(self.address),
        )
        .await
        .map_err(|_| BlockchainError::Timeout("pending nonce query timed out".to_string()))?
    }
}

fn set_status(job: &mut Job, status: JobStatus) {
    job.status = status;
    debug!(job_id = %job.id, status = %status, "Job status changed");
}
