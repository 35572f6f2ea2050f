//! Application state management.

use std::sync::Arc;

use crate::domain::{GracePeriodStore, LedgerClient};

use super::dispatch::DispatchQueue;
use super::service::{RelayConfig, RelayService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RelayService>,
    pub queue: Arc<DispatchQueue>,
    pub ledger: Arc<dyn LedgerClient>,
    pub grace_store: Arc<dyn GracePeriodStore>,
}

impl AppState {
    /// Create a new application state around an already constructed queue
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        grace_store: Arc<dyn GracePeriodStore>,
        queue: Arc<DispatchQueue>,
        config: RelayConfig,
    ) -> Self {
        let service = Arc::new(RelayService::new(
            Arc::clone(&ledger),
            Arc::clone(&grace_store),
            Arc::clone(&queue),
            config,
        ));
        Self {
            service,
            queue,
            ledger,
            grace_store,
        }
    }
}
