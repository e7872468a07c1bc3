//! Cost tracking for Homunculus.
//!
//! Turns log an estimated USD cost next to their token usage; the prices
//! come from a prefix-keyed table of model families.

pub mod pricing;

pub use pricing::{ModelPricing, PricingTable};
