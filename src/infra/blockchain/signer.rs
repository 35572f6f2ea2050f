//! Local private-key signer producing EIP-155 legacy transactions.

use std::fmt;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, TxKind};
use alloy::signers::local::PrivateKeySigner;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::domain::{
    AppError, ConfigError, SignedTransaction, SigningError, TransactionSigner, UnsignedTransaction,
};
use crate::domain::types::decode_hex;

/// Signer backed by an in-process secp256k1 key
pub struct LocalSigner {
    inner: PrivateKeySigner,
}

impl LocalSigner {
    #[must_use]
    pub fn new(inner: PrivateKeySigner) -> Self {
        Self { inner }
    }

    /// Parse a hex-encoded 32-byte private key (with or without `0x`)
    pub fn from_secret(secret: &SecretString) -> Result<Self, AppError> {
        let invalid = |message: String| {
            AppError::Config(ConfigError::InvalidValue {
                name: "RELAYER_PRIVATE_KEY".to_string(),
                message,
            })
        };

        let bytes = decode_hex(secret.expose_secret().trim()).map_err(invalid)?;
        if bytes.len() != 32 {
            return Err(invalid(format!("key must be 32 bytes, got {}", bytes.len())));
        }
        let inner = PrivateKeySigner::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::new(inner))
    }

    /// Fresh random key, for tests and local tooling
    #[must_use]
    pub fn random() -> Self {
        Self::new(PrivateKeySigner::random())
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.inner.address())
            .finish_non_exhaustive()
    }
}

impl TransactionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, SigningError> {
        if tx.to == Address::ZERO {
            return Err(SigningError::InvalidDestination(tx.to.to_string()));
        }
        if tx.gas_limit == 0 {
            return Err(SigningError::InvalidField("gas limit must be positive".to_string()));
        }

        let mut legacy = TxLegacy {
            chain_id: Some(tx.chain_id),
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: TxKind::Call(tx.to),
            value: tx.value,
            input: tx.data.clone(),
        };

        let signature = self
            .inner
            .sign_transaction_sync(&mut legacy)
            .map_err(|e| SigningError::Backend(e.to_string()))?;
        let signed = legacy.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::from(signed).encoded_2718();

        debug!(nonce = tx.nonce, tx_hash = %hash, "Signed transaction");
        Ok(SignedTransaction {
            raw: raw.into(),
            hash,
            nonce: tx.nonce,
        })
    }
}
