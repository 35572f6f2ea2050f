//! Relay service: turns a meta-transaction request into a dispatched transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::utils::format_ether;
use alloy::primitives::{Address, B256};
use chrono::Utc;
use dashmap::DashSet;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use crate::domain::types::{decode_hex, parse_word};
use crate::domain::{
    AdmissionError, AppError, BlockRef, DispatchError, ForwardRequest, ForwardResponse, GracePeriodStore,
    HealthResponse, HealthStatus, LedgerClient, StatusResponse, TransferArgs, TxRequest,
    ValidationError,
};
use crate::infra::blockchain::{decode_transfer, encode_execute_meta_transaction};

use super::dispatch::DispatchQueue;
use super::validator::TransferValidator;

/// Static parameters of the relay service
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Token contract every meta-transaction is sent to
    pub token_address: Address,
    /// Minimum interval between accepted requests per sender, disabled when `None`
    pub grace_period: Option<Duration>,
    /// Maximum age of the block a balance check may use
    pub block_max_age: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn new(token_address: Address) -> Self {
        Self {
            token_address,
            grace_period: None,
            block_max_age: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Option<Duration>) -> Self {
        self.grace_period = grace_period.filter(|p| !p.is_zero());
        self
    }

    #[must_use]
    pub fn with_block_max_age(mut self, block_max_age: Duration) -> Self {
        self.block_max_age = block_max_age;
        self
    }
}

/// Fully decoded relay request, ready for submission
struct DecodedRequest {
    sender: Address,
    call: Vec<u8>,
    transfer: TransferArgs,
    block: BlockRef,
    r: B256,
    s: B256,
    v: u8,
}

/// Releases the sender's in-flight slot on drop
struct InFlightGuard {
    senders: Arc<DashSet<Address>>,
    sender: Address,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.senders.remove(&self.sender);
    }
}

/// Application service containing the relay flow
pub struct RelayService {
    ledger: Arc<dyn LedgerClient>,
    grace_store: Arc<dyn GracePeriodStore>,
    queue: Arc<DispatchQueue>,
    validator: TransferValidator,
    config: RelayConfig,
    in_flight: Arc<DashSet<Address>>,
}

impl RelayService {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        grace_store: Arc<dyn GracePeriodStore>,
        queue: Arc<DispatchQueue>,
        config: RelayConfig,
    ) -> Self {
        let validator = TransferValidator::new(
            Arc::clone(&ledger),
            config.token_address,
            config.block_max_age,
        );
        Self {
            ledger,
            grace_store,
            queue,
            validator,
            config,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Validate, admit and dispatch a meta-transaction, waiting for broadcast
    #[instrument(skip(self, request), fields(sender = %request.sender))]
    pub async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, AppError> {
        let decoded = Self::decode(request)?;

        if let Some(reason) = self
            .validator
            .validate(decoded.sender, &decoded.transfer, decoded.block)
            .await?
        {
            warn!(reason = %reason, "Transfer rejected by validator");
            return Err(ValidationError::Rejected(reason).into());
        }

        let data = encode_execute_meta_transaction(
            decoded.sender,
            decoded.call.into(),
            decoded.r,
            decoded.s,
            decoded.v,
        );

        let guard = self.acquire_sender(decoded.sender)?;
        self.check_grace_period(decoded.sender).await?;

        let accepted_at = Utc::now();
        let handle = self
            .queue
            .submit(TxRequest::call(self.config.token_address, data))?;
        let job_id = handle.job_id();

        // The sender stays admitted until the job is terminal, even if the
        // caller goes away first
        let grace_store = self
            .config
            .grace_period
            .map(|_| Arc::clone(&self.grace_store));
        let sender = decoded.sender;
        let completion = tokio::spawn(async move {
            let _guard = guard;
            let receipt = handle.await?;
            if let Some(store) = grace_store {
                if let Err(e) = store.record_accepted(sender, accepted_at).await {
                    error!(sender = %sender, error = %e, "Failed to record acceptance time");
                }
            }
            Ok::<_, DispatchError>(receipt)
        });
        let receipt = completion
            .await
            .map_err(|e| AppError::Internal(format!("relay task failed: {}", e)))??;

        info!(
            job_id = %job_id,
            tx_hash = %receipt.tx_hash,
            nonce = receipt.nonce,
            amount = %decoded.transfer.amount,
            "Meta-transaction relayed"
        );
        Ok(ForwardResponse {
            tx_id: receipt.tx_hash.to_string(),
        })
    }

    /// Relayer status for `GET /status`
    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<StatusResponse, AppError> {
        let network_id = self.ledger.chain_id().await?;
        let balance = self.ledger.get_balance(self.queue.address()).await?;

        Ok(StatusResponse {
            network_id,
            address: self.queue.address().to_checksum(None),
            gas: format_ether(balance),
            queue_size: self.queue.queue_size(),
            contract_address: self.config.token_address.to_checksum(None),
            grace_period_ms: self.config.grace_period.map(|p| p.as_millis() as u64),
        })
    }

    /// Perform health check on ledger, grace store and queue
    pub async fn health_check(&self) -> HealthResponse {
        let ledger = match self.ledger.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Ledger health check failed");
                HealthStatus::Unhealthy
            }
        };
        let grace_store = match self.grace_store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Grace store health check failed");
                HealthStatus::Unhealthy
            }
        };
        HealthResponse::new(ledger, grace_store, self.queue.state())
    }

    fn decode(request: &ForwardRequest) -> Result<DecodedRequest, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            ValidationError::InvalidBody(e.to_string())
        })?;

        let sender = Address::from_str(&request.sender)
            .map_err(|e| ValidationError::InvalidBody(e.to_string()))?;
        let call = decode_hex(&request.abi_function_call).map_err(ValidationError::InvalidBody)?;
        let transfer = decode_transfer(&call).ok_or(ValidationError::UndecodableCall)?;

        let block = request
            .block_number
            .as_deref()
            .map(BlockRef::from_str)
            .transpose()
            .map_err(|message| invalid_field("blockNumber", message))?
            .unwrap_or_default();

        let r = parse_word(&request.r).map_err(|m| invalid_field("r", m))?;
        let s = parse_word(&request.s).map_err(|m| invalid_field("s", m))?;
        let v = parse_word(&request.v)
            .and_then(|word| {
                if word[..31].iter().any(|b| *b != 0) {
                    return Err("recovery id must fit in one byte".to_string());
                }
                Ok(word[31])
            })
            .map_err(|m| invalid_field("v", m))?;

        Ok(DecodedRequest {
            sender,
            call,
            transfer,
            block,
            r,
            s,
            v,
        })
    }

    fn acquire_sender(&self, sender: Address) -> Result<InFlightGuard, AdmissionError> {
        if !self.in_flight.insert(sender) {
            warn!("Concurrent request from sender rejected");
            return Err(AdmissionError::ConcurrentRequest);
        }
        Ok(InFlightGuard {
            senders: Arc::clone(&self.in_flight),
            sender,
        })
    }

    async fn check_grace_period(&self, sender: Address) -> Result<(), AppError> {
        let Some(period) = self.config.grace_period else {
            return Ok(());
        };
        let Some(last) = self.grace_store.last_accepted(sender).await? else {
            return Ok(());
        };

        let period = chrono::Duration::from_std(period)
            .map_err(|e| AppError::Internal(format!("grace period out of range: {}", e)))?;
        let retry_after = last + period;
        if Utc::now() < retry_after {
            warn!(retry_after = %retry_after, "Grace period did not pass");
            return Err(AdmissionError::GracePeriod { retry_after }.into());
        }
        Ok(())
    }
}

fn invalid_field(field: &str, message: String) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dispatch::DispatchConfig;
    use crate::domain::{BlockSummary, TransactionSigner};
    use crate::infra::blockchain::{LocalSigner, encode_transfer};
    use crate::infra::grace::InMemoryGraceStore;
    use crate::test_utils::MockLedgerClient;
    use alloy::primitives::{U256, address};

    const SENDER: Address = address!("FeaED3f817169C012D040F05C6c52bCE5740Fc37");
    const RECIPIENT: Address = address!("4DCeBf483fA7f31FfCee6e4EAffC1D78308Ec2cD");
    const TOKEN: Address = address!("0B220b82F3eA3B7F6d9A1D8ab58930C064A2b5Bf");

    fn request(amount: u64) -> ForwardRequest {
        ForwardRequest {
            r: format!("0x{}", "11".repeat(32)),
            s: format!("0x{}", "22".repeat(32)),
            v: "0x1b".to_string(),
            sender: SENDER.to_checksum(None),
            abi_function_call: alloy::hex::encode_prefixed(encode_transfer(RECIPIENT, U256::from(amount))),
            signed_request: None,
            block_number: None,
        }
    }

    async fn setup(
        grace_period: Option<Duration>,
    ) -> (Arc<MockLedgerClient>, Arc<InMemoryGraceStore>, RelayService) {
        let ledger = Arc::new(MockLedgerClient::with_nonce(3));
        ledger.set_latest_block(BlockSummary {
            number: 10,
            timestamp: Utc::now().timestamp() as u64,
            pending: false,
        });
        ledger.set_token_balance(SENDER, U256::from(500u64));

        let signer: Arc<dyn TransactionSigner> = Arc::new(LocalSigner::random());
        let queue = Arc::new(DispatchQueue::new(
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            signer,
            DispatchConfig::default(),
        ));
        queue.start().await.unwrap();

        let store = Arc::new(InMemoryGraceStore::new());
        let service = RelayService::new(
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            Arc::clone(&store) as Arc<dyn GracePeriodStore>,
            queue,
            RelayConfig::new(TOKEN).with_grace_period(grace_period),
        );
        (ledger, store, service)
    }

    #[tokio::test]
    async fn test_forward_dispatches_meta_transaction() {
        let (ledger, _store, service) = setup(None).await;

        let response = service.forward(&request(500)).await.unwrap();

        let accepted = ledger.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].0, 3);
        assert_eq!(response.tx_id, accepted[0].1.to_string());
    }

    #[tokio::test]
    async fn test_forward_rejects_undecodable_call() {
        let (ledger, _store, service) = setup(None).await;
        let mut req = request(500);
        req.abi_function_call = "0xdeadbeef".to_string();

        let err = service.forward(&req).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::UndecodableCall)
        ));
        assert!(ledger.broadcast_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_forward_rejects_bad_body() {
        let (_ledger, _store, service) = setup(None).await;
        let mut req = request(500);
        req.sender = "not-an-address".to_string();

        let err = service.forward(&req).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::InvalidBody(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_surfaces_validator_message() {
        let (_ledger, _store, service) = setup(None).await;

        let err = service.forward(&request(499)).await.unwrap_err();
        match err {
            AppError::Validation(ValidationError::Rejected(message)) => {
                assert_eq!(message, "Only full withdrawals are supported");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_grace_period_blocks_second_request() {
        let (ledger, store, service) = setup(Some(Duration::from_secs(60))).await;

        service.forward(&request(500)).await.unwrap();
        assert!(store.last_accepted(SENDER).await.unwrap().is_some());

        let err = service.forward(&request(500)).await.unwrap_err();
        match err {
            AppError::Admission(AdmissionError::GracePeriod { retry_after }) => {
                assert!(retry_after > Utc::now());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(ledger.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_does_not_start_grace_period() {
        let (ledger, store, service) = setup(Some(Duration::from_secs(60))).await;
        ledger.script_broadcasts([Err(crate::domain::BlockchainError::Rejected {
            reason: "execution reverted".to_string(),
            accepted: false,
        })]);

        let err = service.forward(&request(500)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Dispatch(DispatchError::Rejected(_))
        ));
        assert!(store.last_accepted(SENDER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_from_same_sender() {
        let (ledger, _store, service) = setup(None).await;
        ledger.set_broadcast_delay(Duration::from_millis(200));
        let service = Arc::new(service);

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.forward(&request(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = service.forward(&request(500)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Admission(AdmissionError::ConcurrentRequest)
        ));

        assert!(first.await.unwrap().is_ok());
        // Slot is released once the first request completes
        assert!(service.forward(&request(500)).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_request_holds_sender_until_job_finishes() {
        let (ledger, store, service) = setup(Some(Duration::from_secs(60))).await;
        ledger.set_broadcast_delay(Duration::from_millis(200));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), service.forward(&request(500))).await;
        assert!(abandoned.is_err());

        let err = service.forward(&request(500)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Admission(AdmissionError::ConcurrentRequest)
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ledger.accepted().len(), 1);
        assert!(store.last_accepted(SENDER).await.unwrap().is_some());

        let err = service.forward(&request(500)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Admission(AdmissionError::GracePeriod { .. })
        ));
    }

    #[tokio::test]
    async fn test_grace_period_starts_at_submission() {
        let (ledger, store, service) = setup(Some(Duration::from_secs(60))).await;
        ledger.set_broadcast_delay(Duration::from_millis(200));

        let submitted = Utc::now();
        service.forward(&request(500)).await.unwrap();
        let finished = Utc::now();

        let recorded = store.last_accepted(SENDER).await.unwrap().unwrap();
        assert!(recorded >= submitted);
        assert!(finished - recorded >= chrono::Duration::milliseconds(200));
    }

    #[tokio::test]
    async fn test_status_reports_queue_and_config() {
        let (ledger, _store, service) = setup(Some(Duration::from_millis(1500))).await;
        ledger.set_native_balance(U256::from(1_500_000_000_000_000_000u128));

        let status = service.status().await.unwrap();
        assert_eq!(status.network_id, 137);
        assert!(status.gas.starts_with("1.5"));
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.contract_address, TOKEN.to_checksum(None));
        assert_eq!(status.grace_period_ms, Some(1500));
    }

    #[tokio::test]
    async fn test_zero_grace_period_is_disabled() {
        let config = RelayConfig::new(TOKEN).with_grace_period(Some(Duration::ZERO));
        assert!(config.grace_period.is_none());
    }
}
