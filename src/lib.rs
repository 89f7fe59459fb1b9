//! Options Relay Library
//!
//! Text trade commands from whitelisted senders become risk-checked,
//! idempotent options orders against a brokerage.

pub mod broker;
pub mod cli;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod pipeline;
pub mod position;
pub mod retry;
pub mod risk;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
