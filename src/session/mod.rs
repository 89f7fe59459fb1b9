//! Brokerage session lifecycle
//!
//! One session per process. Token refresh is single-flight: callers that find
//! the session expiring share one login instead of racing their own.
//!
//! ```text
//! Absent ──► Refreshing ──► Live ──(expiring / forced)──► Refreshing
//!                 │
//!                 └──(login exhausted)──► CoolingDown ──(interval elapsed)──► Refreshing
//! ```

pub mod manager;

pub use manager::{Session, SessionManager, SessionPhase, SessionPolicy};
