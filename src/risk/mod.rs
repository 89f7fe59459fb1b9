//! Pre-trade risk checks
//!
//! A mistyped command like `BUY NIFTY 24000 CE 5000` must be caught before it
//! reaches the broker. The gate is a pure predicate over an intent, a limits
//! snapshot and a reference price source.

pub mod gate;
pub mod prices;

pub use gate::{evaluate, RiskDecision, RiskGate, RiskLimits, RiskReason, STRIKE_STEP};
pub use prices::{PremiumTable, ReferencePrices};
