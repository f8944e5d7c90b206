pub mod pricing;

pub use pricing::{FareLeg, FareQuote, PricingConfig, PricingEngine, PricingError};
