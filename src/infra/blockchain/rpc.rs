//! JSON-RPC ledger client for EVM nodes.
//!
//! Read calls are retried on transient failures. Broadcasts are never retried
//! here; the dispatch queue owns that policy and needs to see every failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::domain::types::decode_hex;
use crate::domain::{BlockRef, BlockSummary, BlockchainError, LedgerClient, SignedTransaction};

/// Configuration for the RPC client
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Raw JSON-RPC transport, abstracted so the client can be tested without a node
#[async_trait]
pub trait JsonRpcTransport: Send + Sync {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BlockchainError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: Option<String>,
    hash: Option<String>,
    timestamp: String,
}

/// HTTP transport over `reqwest`
pub struct HttpJsonRpcTransport {
    http_client: Client,
    rpc_url: String,
    next_id: AtomicU64,
}

impl HttpJsonRpcTransport {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, BlockchainError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlockchainError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl JsonRpcTransport for HttpJsonRpcTransport {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BlockchainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BlockchainError::Timeout(e.to_string())
                } else {
                    BlockchainError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BlockchainError::RateLimited(format!("HTTP {}", status)));
        }
        if status.is_server_error() {
            return Err(BlockchainError::Network(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(BlockchainError::InvalidResponse(format!("HTTP {}", status)));
        }

        let rpc_response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| BlockchainError::InvalidResponse(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            return Err(classify_rpc_error(error.code, &error.message));
        }

        Ok(rpc_response.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Map a JSON-RPC error object onto the ledger error set.
///
/// Anything not recognised as transient or a nonce conflict is a permanent
/// rejection that did not enter the pool; [`EvmLedgerClient::broadcast`]
/// refines `accepted` by probing the node.
pub fn classify_rpc_error(code: i64, message: &str) -> BlockchainError {
    let lower = message.to_lowercase();

    if code == -32005 || lower.contains("rate limit") || lower.contains("too many requests") {
        return BlockchainError::RateLimited(message.to_string());
    }
    if lower.contains("nonce too low")
        || lower.contains("nonce has already been used")
        || lower.contains("oldnonce")
        || lower.contains("replacement transaction underpriced")
    {
        return BlockchainError::NonceConflict(message.to_string());
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return BlockchainError::Timeout(message.to_string());
    }
    if lower.contains("header not found") || lower.contains("service unavailable") {
        return BlockchainError::Network(message.to_string());
    }

    BlockchainError::Rejected {
        reason: format!("{}: {}", code, message),
        accepted: false,
    }
}

fn is_already_known(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("already known") || lower.contains("known transaction")
}

fn parse_quantity(value: &str) -> Result<U256, BlockchainError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| BlockchainError::InvalidResponse(format!("bad quantity '{}': {}", value, e)))
}

fn parse_u64(value: &str) -> Result<u64, BlockchainError> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity)
        .map_err(|_| BlockchainError::InvalidResponse(format!("quantity '{}' exceeds u64", value)))
}

fn parse_u128(value: &str) -> Result<u128, BlockchainError> {
    let quantity = parse_quantity(value)?;
    u128::try_from(quantity)
        .map_err(|_| BlockchainError::InvalidResponse(format!("quantity '{}' exceeds u128", value)))
}

/// EVM ledger client
pub struct EvmLedgerClient {
    transport: Box<dyn JsonRpcTransport>,
    config: RpcClientConfig,
}

impl EvmLedgerClient {
    /// Create a new client over HTTP with custom configuration
    pub fn new(rpc_url: &str, config: RpcClientConfig) -> Result<Self, BlockchainError> {
        let transport = HttpJsonRpcTransport::new(rpc_url, config.timeout)?;
        info!(rpc_url = %rpc_url, "Created EVM ledger client");
        Ok(Self::with_transport(Box::new(transport), config))
    }

    /// Create a new client over HTTP with default configuration
    pub fn with_defaults(rpc_url: &str) -> Result<Self, BlockchainError> {
        Self::new(rpc_url, RpcClientConfig::default())
    }

    /// Create a new client with a specific transport (useful for testing)
    pub fn with_transport(transport: Box<dyn JsonRpcTransport>, config: RpcClientConfig) -> Self {
        Self { transport, config }
    }

    /// Make a read-only RPC call, retrying transient failures
    #[instrument(skip(self, params))]
    async fn rpc_call<R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, BlockchainError> {
        let mut attempt = 0;
        loop {
            match self.transport.send_request(method, params.clone()).await {
                Ok(value) => {
                    return serde_json::from_value(value).map_err(|e| {
                        BlockchainError::InvalidResponse(format!("{}: {}", method, e))
                    });
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(attempt = attempt, error = %e, method = %method, "RPC call failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transaction_count(&self, address: Address, tag: &str) -> Result<u64, BlockchainError> {
        let count: String = self
            .rpc_call("eth_getTransactionCount", json!([address, tag]))
            .await?;
        parse_u64(&count)
    }

    /// Pool lookup after a rejection; a failed lookup counts as not accepted
    async fn is_known_to_node(&self, hash: TxHash) -> bool {
        match self
            .transport
            .send_request("eth_getTransactionByHash", json!([hash]))
            .await
        {
            Ok(value) => !value.is_null(),
            Err(e) => {
                debug!(tx_hash = %hash, error = %e, "Acceptance lookup failed, assuming not accepted");
                false
            }
        }
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    #[instrument(skip(self))]
    async fn chain_id(&self) -> Result<u64, BlockchainError> {
        let id: String = self.rpc_call("eth_chainId", json!([])).await?;
        parse_u64(&id)
    }

    #[instrument(skip(self))]
    async fn get_nonce(&self, address: Address) -> Result<u64, BlockchainError> {
        self.transaction_count(address, "latest").await
    }

    #[instrument(skip(self))]
    async fn get_pending_nonce(&self, address: Address) -> Result<u64, BlockchainError> {
        self.transaction_count(address, "pending").await
    }

    #[instrument(skip(self))]
    async fn gas_price(&self) -> Result<u128, BlockchainError> {
        let price: String = self.rpc_call("eth_gasPrice", json!([])).await?;
        parse_u128(&price)
    }

    #[instrument(skip(self, tx), fields(nonce = tx.nonce, tx_hash = %tx.hash))]
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<TxHash, BlockchainError> {
        let result = self
            .transport
            .send_request("eth_sendRawTransaction", json!([tx.raw]))
            .await;

        match result {
            Ok(value) => {
                let hash: TxHash = serde_json::from_value(value)
                    .map_err(|e| BlockchainError::InvalidResponse(e.to_string()))?;
                if hash != tx.hash {
                    warn!(node_hash = %hash, "Node reported a different transaction hash");
                }
                Ok(hash)
            }
            Err(BlockchainError::Rejected { reason, .. }) if is_already_known(&reason) => {
                debug!("Node already knows the transaction");
                Ok(tx.hash)
            }
            Err(BlockchainError::Rejected { reason, .. }) => {
                let accepted = self.is_known_to_node(tx.hash).await;
                warn!(reason = %reason, accepted = accepted, "Broadcast rejected");
                Err(BlockchainError::Rejected { reason, accepted })
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn is_transaction_known(&self, hash: TxHash) -> Result<bool, BlockchainError> {
        let tx: Option<serde_json::Value> = self
            .rpc_call("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok(tx.is_some())
    }

    #[instrument(skip(self))]
    async fn get_block(&self, block: BlockRef) -> Result<Option<BlockSummary>, BlockchainError> {
        let raw: Option<RpcBlock> = self
            .rpc_call(
                "eth_getBlockByNumber",
                json!([block.to_rpc_param(), false]),
            )
            .await?;

        raw.map(|b| {
            let pending = b.number.is_none() || b.hash.is_none();
            Ok(BlockSummary {
                number: b.number.as_deref().map(parse_u64).transpose()?.unwrap_or(0),
                timestamp: parse_u64(&b.timestamp)?,
                pending,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, data))]
    async fn call(
        &self,
        to: Address,
        data: Bytes,
        block: BlockRef,
    ) -> Result<Bytes, BlockchainError> {
        let ret: String = self
            .rpc_call(
                "eth_call",
                json!([{ "to": to, "data": data }, block.to_rpc_param()]),
            )
            .await?;
        decode_hex(&ret)
            .map(Bytes::from)
            .map_err(BlockchainError::InvalidResponse)
    }

    #[instrument(skip(self))]
    async fn get_balance(&self, address: Address) -> Result<U256, BlockchainError> {
        let balance: String = self
            .rpc_call("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_quantity(&balance)
    }
}
