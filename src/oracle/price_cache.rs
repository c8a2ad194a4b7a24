//! Price cache holding the last healthy reading per branch

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{BranchId, HealthyReading};
use crate::error::{Result, SentinelError};

/// Last accepted healthy value of a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedPrice {
    pub last_good_value: Decimal,
    pub last_good_at: DateTime<Utc>,
}

/// Frozen price served to consumers, with its age at read time.
///
/// Carries no health information: consumers must have passed the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenPrice {
    pub value: Decimal,
    pub observed_at: DateTime<Utc>,
    pub age: Duration,
}

impl FrozenPrice {
    /// Staleness ceiling, composable with the gate check
    pub fn ensure_fresh(&self, max_age: Duration) -> Result<Decimal> {
        if self.age > max_age {
            return Err(SentinelError::StaleData(format!(
                "price observed {}s ago exceeds ceiling of {}s",
                self.age.num_seconds(),
                max_age.num_seconds()
            )));
        }
        Ok(self.value)
    }
}

/// Per-branch last-good price store.
///
/// Only healthy readings can be recorded, so failures never touch the stored
/// value. Records older than the stored one are dropped.
#[derive(Debug)]
pub struct PriceCache {
    prices: HashMap<BranchId, RwLock<Option<CachedPrice>>>,
}

impl PriceCache {
    pub fn new(branches: impl IntoIterator<Item = BranchId>) -> Self {
        Self {
            prices: branches
                .into_iter()
                .map(|b| (b, RwLock::new(None)))
                .collect(),
        }
    }

    /// Record a healthy reading. Returns whether it was accepted.
    pub async fn record(&self, branch: &BranchId, reading: &HealthyReading) -> bool {
        let Some(slot) = self.prices.get(branch) else {
            debug!("Dropping price for unknown branch {}", branch);
            return false;
        };

        let mut cached = slot.write().await;
        if let Some(current) = *cached {
            if reading.observed_at < current.last_good_at {
                debug!(
                    branch = %branch,
                    "Dropping out-of-order price observed at {} (stored {})",
                    reading.observed_at,
                    current.last_good_at
                );
                return false;
            }
        }

        *cached = Some(CachedPrice {
            last_good_value: reading.value,
            last_good_at: reading.observed_at,
        });
        true
    }

    /// Last good value and its age, regardless of shutdown state
    pub async fn read(&self, branch: &BranchId) -> Option<FrozenPrice> {
        let cached = (*self.prices.get(branch)?.read().await)?;
        Some(FrozenPrice {
            value: cached.last_good_value,
            observed_at: cached.last_good_at,
            age: Utc::now().signed_duration_since(cached.last_good_at),
        })
    }

    /// Raw cached entry
    pub async fn get(&self, branch: &BranchId) -> Option<CachedPrice> {
        *self.prices.get(branch)?.read().await
    }

    /// Check if a price was ever recorded for a branch
    pub async fn has_price(&self, branch: &BranchId) -> bool {
        self.get(branch).await.is_some()
    }
}
