//! ABI bindings for the meta-transaction enabled ERC-20 token.

use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::domain::{BlockchainError, TransferArgs};

sol! {
    interface IMetaToken {
        function transfer(address recipient, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function executeMetaTransaction(
            address userAddress,
            bytes functionSignature,
            bytes32 sigR,
            bytes32 sigS,
            uint8 sigV
        ) external payable returns (bytes);
    }
}

/// Decode calldata as `transfer(recipient, amount)`.
///
/// Returns `None` for any other function or malformed arguments.
#[must_use]
pub fn decode_transfer(call: &[u8]) -> Option<TransferArgs> {
    if call.len() < 4 || call[..4] != IMetaToken::transferCall::SELECTOR {
        return None;
    }
    IMetaToken::transferCall::abi_decode(call)
        .ok()
        .map(|decoded| TransferArgs {
            recipient: decoded.recipient,
            amount: decoded.amount,
        })
}

#[must_use]
pub fn encode_transfer(recipient: Address, amount: U256) -> Bytes {
    IMetaToken::transferCall { recipient, amount }
        .abi_encode()
        .into()
}

#[must_use]
pub fn encode_balance_of(account: Address) -> Bytes {
    IMetaToken::balanceOfCall { account }.abi_encode().into()
}

/// Wrap a user-signed call into `executeMetaTransaction` for the relayer to send
#[must_use]
pub fn encode_execute_meta_transaction(
    user: Address,
    function_signature: Bytes,
    r: B256,
    s: B256,
    v: u8,
) -> Bytes {
    IMetaToken::executeMetaTransactionCall {
        userAddress: user,
        functionSignature: function_signature,
        sigR: r,
        sigS: s,
        sigV: v,
    }
    .abi_encode()
    .into()
}

/// Decode a single `uint256` return word
pub fn decode_uint256(ret: &[u8]) -> Result<U256, BlockchainError> {
    if ret.len() < 32 {
        return Err(BlockchainError::InvalidResponse(format!(
            "expected 32-byte uint256 return, got {} bytes",
            ret.len()
        )));
    }
    Ok(U256::from_be_slice(&ret[..32]))
}
