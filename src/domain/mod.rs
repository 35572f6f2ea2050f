//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{
    AdmissionError, AppError, BlockchainError, ConfigError, DatabaseError, DispatchError,
    FailureClass, SigningError, ValidationError,
};
pub use traits::{GracePeriodStore, LedgerClient, TransactionSigner};
pub use types::{
    BlockRef, BlockSummary, ErrorDetail, ErrorResponse, ForwardRequest, ForwardResponse,
    HealthResponse, HealthStatus, Job, JobReceipt, JobStatus, QueueState, RateLimitResponse,
    SignedTransaction, StatusResponse, TransferArgs, TxRequest, UnsignedTransaction,
};
