//! Business rules a relayed transfer must satisfy.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::domain::{AppError, BlockRef, LedgerClient, TransferArgs};
use crate::infra::blockchain::{decode_uint256, encode_balance_of};

pub const MSG_ZERO_AMOUNT: &str = "Cannot transfer 0 tokens";
pub const MSG_SELF_TRANSFER: &str = "Sender and recipient addresses must differ";
pub const MSG_STALE_BLOCK: &str = "Provided block is too old and can contain stale data";
pub const MSG_PARTIAL_WITHDRAWAL: &str = "Only full withdrawals are supported";

/// Checks a decoded transfer against chain state.
///
/// Only full-balance withdrawals are relayed, checked against the sender's
/// token balance at a recent block.
pub struct TransferValidator {
    ledger: Arc<dyn LedgerClient>,
    token_address: Address,
    block_max_age: Duration,
}

impl TransferValidator {
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerClient>, token_address: Address, block_max_age: Duration) -> Self {
        Self {
            ledger,
            token_address,
            block_max_age,
        }
    }

    /// `Ok(None)` when the transfer is acceptable, `Ok(Some(reason))` when it
    /// breaks a rule. `Err` only for infrastructure failures.
    #[instrument(skip(self, args), fields(recipient = %args.recipient, amount = %args.amount))]
    pub async fn validate(
        &self,
        sender: Address,
        args: &TransferArgs,
        block: BlockRef,
    ) -> Result<Option<String>, AppError> {
        if args.amount.is_zero() {
            return Ok(Some(MSG_ZERO_AMOUNT.to_string()));
        }

        if sender == args.recipient {
            return Ok(Some(MSG_SELF_TRANSFER.to_string()));
        }

        let summary = match self.ledger.get_block(block).await {
            Ok(Some(summary)) => summary,
            Ok(None) => return Ok(Some(format!("Block {} not found", block))),
            Err(e) => {
                debug!(error = %e, "Block lookup failed");
                return Ok(Some(format!("Block {} is too old", block)));
            }
        };

        if summary.pending {
            return Ok(Some(format!("Block {} is still pending", block)));
        }

        let now = Utc::now().timestamp().max(0) as u64;
        if now.saturating_sub(summary.timestamp) > self.block_max_age.as_secs() {
            return Ok(Some(MSG_STALE_BLOCK.to_string()));
        }

        let ret = self
            .ledger
            .call(self.token_address, encode_balance_of(sender), block)
            .await?;
        let balance = decode_uint256(&ret)?;
        if balance != args.amount {
            return Ok(Some(MSG_PARTIAL_WITHDRAWAL.to_string()));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BlockSummary;
    use crate::test_utils::MockLedgerClient;
    use alloy::primitives::{U256, address};

    const SENDER: Address = address!("FeaED3f817169C012D040F05C6c52bCE5740Fc37");
    const RECIPIENT: Address = address!("4DCeBf483fA7f31FfCee6e4EAffC1D78308Ec2cD");
    const TOKEN: Address = address!("0B220b82F3eA3B7F6d9A1D8ab58930C064A2b5Bf");

    fn fresh_block(number: u64) -> BlockSummary {
        BlockSummary {
            number,
            timestamp: Utc::now().timestamp() as u64,
            pending: false,
        }
    }

    fn setup() -> (Arc<MockLedgerClient>, TransferValidator) {
        let ledger = Arc::new(MockLedgerClient::new());
        ledger.set_latest_block(fresh_block(100));
        ledger.set_token_balance(SENDER, U256::from(1_000u64));
        let validator = TransferValidator::new(
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            TOKEN,
            Duration::from_secs(300),
        );
        (ledger, validator)
    }

    fn transfer(amount: u64) -> TransferArgs {
        TransferArgs {
            recipient: RECIPIENT,
            amount: U256::from(amount),
        }
    }

    #[tokio::test]
    async fn test_full_withdrawal_is_accepted() {
        let (_ledger, validator) = setup();
        let result = validator
            .validate(SENDER, &transfer(1_000), BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_zero_amount() {
        let (_ledger, validator) = setup();
        let result = validator
            .validate(SENDER, &transfer(0), BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("Cannot transfer 0 tokens"));
    }

    #[tokio::test]
    async fn test_zero_amount_checked_before_self_transfer() {
        let (_ledger, validator) = setup();
        let args = TransferArgs {
            recipient: SENDER,
            amount: U256::ZERO,
        };
        let result = validator
            .validate(SENDER, &args, BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some(MSG_ZERO_AMOUNT));
    }

    #[tokio::test]
    async fn test_sender_equals_recipient() {
        let (_ledger, validator) = setup();
        let args = TransferArgs {
            recipient: SENDER,
            amount: U256::from(1_000u64),
        };
        let result = validator
            .validate(SENDER, &args, BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(
            result.as_deref(),
            Some("Sender and recipient addresses must differ")
        );
    }

    #[tokio::test]
    async fn test_unknown_block() {
        let (_ledger, validator) = setup();
        let result = validator
            .validate(SENDER, &transfer(1_000), BlockRef::Number(42))
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("Block 42 not found"));
    }

    #[tokio::test]
    async fn test_block_lookup_failure_reports_too_old() {
        let (ledger, validator) = setup();
        ledger.set_block_lookup_failing(true);
        let result = validator
            .validate(SENDER, &transfer(1_000), BlockRef::Number(7))
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("Block 7 is too old"));
    }

    #[tokio::test]
    async fn test_pending_block() {
        let (ledger, validator) = setup();
        ledger.set_latest_block(BlockSummary {
            pending: true,
            ..fresh_block(101)
        });
        let result = validator
            .validate(SENDER, &transfer(1_000), BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("Block latest is still pending"));
    }

    #[tokio::test]
    async fn test_stale_block() {
        let (ledger, validator) = setup();
        ledger.add_block(BlockSummary {
            number: 50,
            timestamp: (Utc::now().timestamp() - 301) as u64,
            pending: false,
        });
        let result = validator
            .validate(SENDER, &transfer(1_000), BlockRef::Number(50))
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some(MSG_STALE_BLOCK));
    }

    #[tokio::test]
    async fn test_partial_withdrawal() {
        let (_ledger, validator) = setup();
        let result = validator
            .validate(SENDER, &transfer(999), BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("Only full withdrawals are supported"));
    }

    #[tokio::test]
    async fn test_unreachable_node_reports_block_too_old() {
        let ledger = Arc::new(MockLedgerClient::failing("node down"));
        let validator = TransferValidator::new(ledger, TOKEN, Duration::from_secs(300));
        let result = validator
            .validate(SENDER, &transfer(1_000), BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("Block latest is too old"));
    }
}
