//! Application layer containing business logic and shared state.

pub mod dispatch;
pub mod service;
pub mod state;
pub mod validator;
pub mod worker;

pub use dispatch::{DispatchConfig, DispatchQueue, JobHandle, NonceCounter};
pub use service::{RelayConfig, RelayService};
pub use state::AppState;
pub use validator::TransferValidator;
pub use worker::{GracePruner, GracePrunerConfig, spawn_grace_pruner};
