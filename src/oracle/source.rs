//! Upstream price sources

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Raw quote returned by an upstream source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub price: Decimal,
    /// Publication time reported by the source, if it reports one
    pub published_at: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            published_at: None,
        }
    }

    pub fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// Errors raised by a source before the probe classifies them
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Malformed(String),
}

/// A single upstream oracle feeding one branch
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_quote(&self) -> Result<Quote, SourceError>;
}

/// Price source reading a JSON document over HTTP.
///
/// The price may be a JSON number or a decimal string. The publication
/// time, when configured, is read as unix seconds.
pub struct HttpPriceSource {
    client: reqwest::Client,
    url: String,
    price_pointer: String,
    published_at_pointer: Option<String>,
}

impl HttpPriceSource {
    pub fn new(
        url: impl Into<String>,
        price_pointer: impl Into<String>,
        published_at_pointer: Option<String>,
        request_timeout: Duration,
    ) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            price_pointer: price_pointer.into(),
            published_at_pointer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Extract a quote from a decoded response body
    pub fn parse_body(&self, body: &Value) -> Result<Quote, SourceError> {
        let price = body
            .pointer(&self.price_pointer)
            .ok_or_else(|| SourceError::Malformed(format!("missing field {}", self.price_pointer)))
            .and_then(decimal_from_json)?;

        let published_at = match &self.published_at_pointer {
            Some(pointer) => {
                let secs = body
                    .pointer(pointer)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        SourceError::Malformed(format!("missing or non-integer field {}", pointer))
                    })?;
                let at = Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                    SourceError::Malformed(format!("timestamp {} out of range", secs))
                })?;
                Some(at)
            }
            None => None,
        };

        Ok(Quote {
            price,
            published_at,
        })
    }
}

fn decimal_from_json(value: &Value) -> Result<Decimal, SourceError> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| SourceError::Malformed(format!("invalid price {:?}: {}", s, e))),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map_err(|e| SourceError::Malformed(format!("invalid price {}: {}", n, e))),
        other => Err(SourceError::Malformed(format!(
            "price is not a number: {}",
            other
        ))),
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_quote(&self) -> Result<Quote, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Upstream(format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        self.parse_body(&body)
    }
}
