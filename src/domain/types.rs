//! Domain types with validation support.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Lifecycle status of a dispatch job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for the worker
    #[default]
    Queued,
    /// Worker is producing the signed transaction
    Signing,
    /// Signed transaction handed to the ledger client
    Broadcasting,
    /// Accepted by the node for broadcast (terminal)
    Broadcast,
    /// Gave up on the job (terminal)
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Signing => "signing",
            Self::Broadcasting => "broadcasting",
            Self::Broadcast => "broadcast",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Broadcast | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "signing" => Ok(Self::Signing),
            "broadcasting" => Ok(Self::Broadcasting),
            "broadcast" => Ok(Self::Broadcast),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of the dispatch queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    #[default]
    Stopped,
    Running,
    Draining,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transaction a caller wants the relayer key to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl TxRequest {
    /// Contract call with zero native value
    #[must_use]
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::ZERO,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// Unit of work owned by the dispatch queue between admission and completion
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub request: TxRequest,
    pub status: JobStatus,
    pub admitted_at: DateTime<Utc>,
}

impl Job {
    #[must_use]
    pub fn new(request: TxRequest) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            status: JobStatus::Queued,
            admitted_at: Utc::now(),
        }
    }
}

/// Successful outcome of a dispatch job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReceipt {
    pub job_id: Uuid,
    pub tx_hash: TxHash,
    /// Nonce the broadcast transaction was signed with
    pub nonce: u64,
    /// Number of sign+broadcast attempts, including nonce resync retries
    pub attempts: u32,
}

/// Everything the signer needs to produce a raw transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_price: u128,
    pub gas_limit: u64,
}

/// Signed, serialized transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: TxHash,
    pub nonce: u64,
}

/// Block selector used for state reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockRef {
    #[default]
    Latest,
    Number(u64),
}

impl BlockRef {
    /// JSON-RPC block parameter
    #[must_use]
    pub fn to_rpc_param(&self) -> String {
        match self {
            Self::Latest => "latest".to_string(),
            Self::Number(n) => format!("0x{:x}", n),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for BlockRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed
            .map(Self::Number)
            .map_err(|e| format!("Invalid block number '{}': {}", s, e))
    }
}

/// Header fields the transfer validator needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub number: u64,
    /// Unix seconds
    pub timestamp: u64,
    /// True for the pending block, which has no sealed header yet
    pub pending: bool,
}

/// Decoded ERC-20 `transfer(recipient, amount)` arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferArgs {
    pub recipient: Address,
    pub amount: U256,
}

/// Meta-transaction relay request
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    /// Signature component r (hex)
    #[validate(custom(function = "validate_hex"))]
    #[schema(example = "0x3c8d2b1f9a4e6d7c5b3a29180f7e6d5c4b3a29180f7e6d5c4b3a29180f7e6d5c")]
    pub r: String,
    /// Signature component s (hex)
    #[validate(custom(function = "validate_hex"))]
    #[schema(example = "0x1f9a4e6d7c5b3a29180f7e6d5c4b3a29180f7e6d5c4b3a29180f7e6d5c3c8d2b")]
    pub s: String,
    /// Signature recovery id v (hex)
    #[validate(custom(function = "validate_hex"))]
    #[schema(example = "0x1b")]
    pub v: String,
    /// Address that signed the meta-transaction
    #[validate(custom(function = "validate_address"))]
    #[schema(example = "0xFeaED3f817169C012D040F05C6c52bCE5740Fc37")]
    pub sender: String,
    /// ABI-encoded `transfer(recipient, amount)` call (hex)
    #[validate(custom(function = "validate_hex"))]
    #[schema(example = "0xa9059cbb0000000000000000000000004dcebf483fa7f31ffcee6e4eaffc1d78308ec2cd00000000000000000000000000000000000000000000000000038d7ea4c68000")]
    pub abi_function_call: String,
    /// Full signed request as produced by the wallet (hex, informational)
    #[validate(custom(function = "validate_hex"))]
    pub signed_request: Option<String>,
    /// Block at which the sender's balance is checked (decimal or 0x hex)
    pub block_number: Option<String>,
}

/// Successful relay response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForwardResponse {
    /// Hash of the broadcast transaction
    #[schema(example = "0x5eab1f1b2f8b0e5d0c6f3f19b8a2f2e7d8c1f3a5b9e0d4c2a1f6e7d8c9b0a1f2")]
    pub tx_id: String,
}

/// Relayer status report
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub network_id: u64,
    /// Relayer funding address
    pub address: String,
    /// Native balance of the funding address, in ether
    pub gas: String,
    /// Jobs admitted but not yet terminal
    pub queue_size: usize,
    pub contract_address: String,
    /// Minimum interval between accepted requests per sender (null when disabled)
    pub grace_period_ms: Option<u64>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Ledger RPC health status
    pub ledger: HealthStatus,
    /// Grace-period store health status
    pub grace_store: HealthStatus,
    /// Dispatch queue lifecycle state
    pub queue: QueueState,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    /// A stopped or draining queue makes the relayer unhealthy; a broken grace
    /// store only degrades it.
    #[must_use]
    pub fn new(ledger: HealthStatus, grace_store: HealthStatus, queue: QueueState) -> Self {
        let status = match (ledger, queue) {
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            (_, QueueState::Stopped | QueueState::Draining) => HealthStatus::Unhealthy,
            (HealthStatus::Healthy, QueueState::Running) if grace_store == HealthStatus::Healthy => {
                HealthStatus::Healthy
            }
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            ledger,
            grace_store,
            queue,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "validation_error")]
    pub r#type: String,
    /// Human-readable error message
    #[schema(example = "Only full withdrawals are supported")]
    pub message: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Seconds until rate limit resets
    #[schema(example = 60)]
    pub retry_after: u64,
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn validate_hex(value: &str) -> Result<(), validator::ValidationError> {
    let digits = strip_hex_prefix(value);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut err = validator::ValidationError::new("hex");
        err.message = Some("expected hex string".into());
        return Err(err);
    }
    Ok(())
}

fn validate_address(value: &str) -> Result<(), validator::ValidationError> {
    if Address::from_str(value).is_err() {
        let mut err = validator::ValidationError::new("address");
        err.message = Some("expected eth address".into());
        return Err(err);
    }
    Ok(())
}

/// Decode a hex string into bytes, tolerating a missing `0x` and odd length
pub fn decode_hex(value: &str) -> Result<Vec<u8>, String> {
    let digits = strip_hex_prefix(value);
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{}", digits);
        padded.as_str()
    } else {
        digits
    };
    alloy::hex::decode(digits).map_err(|e| e.to_string())
}

/// Parse a hex value of at most 32 bytes into a left-padded word
pub fn parse_word(value: &str) -> Result<B256, String> {
    let bytes = decode_hex(value)?;
    if bytes.len() > 32 {
        return Err(format!("expected at most 32 bytes, got {}", bytes.len()));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(B256::from(word))
}
