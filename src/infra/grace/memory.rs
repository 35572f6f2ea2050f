//! Process-local grace-period store.

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::{AppError, GracePeriodStore};

/// Grace-period store kept in memory; entries are lost on restart
#[derive(Debug, Default)]
pub struct InMemoryGraceStore {
    entries: DashMap<Address, DateTime<Utc>>,
}

impl InMemoryGraceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl GracePeriodStore for InMemoryGraceStore {
    async fn last_accepted(&self, sender: Address) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self.entries.get(&sender).map(|entry| *entry))
    }

    async fn record_accepted(&self, sender: Address, at: DateTime<Utc>) -> Result<(), AppError> {
        self.entries
            .entry(sender)
            .and_modify(|existing| {
                if at > *existing {
                    *existing = at;
                }
            })
            .or_insert(at);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, AppError> {
        let before = self.entries.len();
        self.entries.retain(|_, accepted_at| *accepted_at >= cutoff);
        Ok(before.saturating_sub(self.entries.len()))
    }
}
