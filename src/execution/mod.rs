//! Order execution
//!
//! Accepted intents become broker orders here. Every order is tracked in an
//! in-memory ledger under its idempotency key.

pub mod executor;
pub mod idempotency;
pub mod order;

pub use executor::{ExecutorSettings, OrderExecutor, OrderResult};
pub use idempotency::{IdempotencyKey, KeyScope, TimeBucket, KEY_LEN};
pub use order::{Admission, Order, OrderLedger, OrderState};
