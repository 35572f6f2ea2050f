//! Blockchain client implementations.
//!
//! JSON-RPC access to an EVM node, local transaction signing, and ABI bindings
//! for the relayed token contract.

pub mod contract;
pub mod rpc;
pub mod signer;

pub use contract::{
    IMetaToken, decode_transfer, decode_uint256, encode_balance_of,
    encode_execute_meta_transaction, encode_transfer,
};
pub use rpc::{EvmLedgerClient, HttpJsonRpcTransport, JsonRpcTransport, RpcClientConfig};
pub use signer::LocalSigner;
