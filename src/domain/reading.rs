use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::ProbeFailure;

/// A price accepted by the probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthyReading {
    pub value: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// A probe attempt that did not yield a usable price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedReading {
    pub reason: ProbeFailure,
    pub observed_at: DateTime<Utc>,
}

/// Result of one probe attempt. Produced and consumed within a single
/// supervisor cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleReading {
    Healthy(HealthyReading),
    Failed(FailedReading),
}

impl OracleReading {
    pub fn healthy(value: Decimal, observed_at: DateTime<Utc>) -> Self {
        OracleReading::Healthy(HealthyReading { value, observed_at })
    }

    pub fn failed(reason: ProbeFailure, observed_at: DateTime<Utc>) -> Self {
        OracleReading::Failed(FailedReading {
            reason,
            observed_at,
        })
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        match self {
            OracleReading::Healthy(r) => r.observed_at,
            OracleReading::Failed(r) => r.observed_at,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, OracleReading::Healthy(_))
    }
}
