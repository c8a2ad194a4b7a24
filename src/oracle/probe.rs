//! Health Probe
//!
//! Wraps one upstream price source and classifies each query as healthy or
//! failed. A probe never blocks past its timeout and never returns an error:
//! every failure mode ends up in `OracleReading::Failed`.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::source::{PriceSource, SourceError};
use crate::domain::OracleReading;
use crate::error::ProbeFailure;

/// Validation applied to quotes before they count as healthy
#[derive(Debug, Clone, Default)]
pub struct QuoteValidation {
    /// Reject quotes published longer ago than this
    pub max_quote_age: Option<ChronoDuration>,
    /// Reject moves larger than this fraction of the last good price (0.5 = 50%)
    pub max_deviation: Option<Decimal>,
}

/// Classifies one price source's answers
#[derive(Clone)]
pub struct HealthProbe {
    source: Arc<dyn PriceSource>,
    timeout: Duration,
    validation: QuoteValidation,
}

impl HealthProbe {
    pub fn new(source: Arc<dyn PriceSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            validation: QuoteValidation::default(),
        }
    }

    pub fn with_validation(mut self, validation: QuoteValidation) -> Self {
        self.validation = validation;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Query the source once.
    ///
    /// `reference` is the last good price, used for the deviation check.
    pub async fn probe(&self, reference: Option<Decimal>) -> OracleReading {
        let outcome = tokio::time::timeout(self.timeout, self.source.fetch_quote()).await;
        let observed_at = Utc::now();

        let quote = match outcome {
            Err(_) => {
                return OracleReading::failed(
                    ProbeFailure::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    },
                    observed_at,
                )
            }
            Ok(Err(SourceError::Upstream(msg))) => {
                return OracleReading::failed(ProbeFailure::UpstreamError(msg), observed_at)
            }
            Ok(Err(SourceError::Malformed(msg))) => {
                return OracleReading::failed(ProbeFailure::Malformed(msg), observed_at)
            }
            Ok(Ok(quote)) => quote,
        };

        if quote.price <= Decimal::ZERO {
            return OracleReading::failed(
                ProbeFailure::Malformed(format!("non-positive price {}", quote.price)),
                observed_at,
            );
        }

        if let Some(published_at) = quote.published_at {
            let age = observed_at.signed_duration_since(published_at);
            // Small tolerance for clock skew between us and the source
            if age < -ChronoDuration::seconds(5) {
                return OracleReading::failed(
                    ProbeFailure::Malformed(format!(
                        "quote published in the future ({})",
                        published_at.to_rfc3339()
                    )),
                    observed_at,
                );
            }
            if let Some(max_age) = self.validation.max_quote_age {
                if age > max_age {
                    return OracleReading::failed(
                        ProbeFailure::Stale {
                            age_secs: age.num_seconds(),
                        },
                        observed_at,
                    );
                }
            }
        }

        if let (Some(max_deviation), Some(reference)) = (self.validation.max_deviation, reference) {
            if reference > Decimal::ZERO {
                let change = ((quote.price - reference) / reference).abs();
                if change > max_deviation {
                    return OracleReading::failed(
                        ProbeFailure::Malformed(format!(
                            "price moved {}% against last good {}",
                            (change * Decimal::ONE_HUNDRED).round_dp(2),
                            reference
                        )),
                        observed_at,
                    );
                }
            }
        }

        OracleReading::healthy(quote.price, observed_at)
    }
}
