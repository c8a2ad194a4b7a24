//! Oracle access: upstream sources, health classification and the
//! last-good price cache.

pub mod price_cache;
pub mod probe;
pub mod source;

pub use price_cache::{CachedPrice, FrozenPrice, PriceCache};
pub use probe::{HealthProbe, QuoteValidation};
pub use source::{HttpPriceSource, PriceSource, Quote, SourceError};
