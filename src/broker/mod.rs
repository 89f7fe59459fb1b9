//! Brokerage collaborators
//!
//! The relay talks to a brokerage through [`BrokerageClient`] and resolves
//! contracts to broker instrument ids through [`InstrumentResolver`]. Both are
//! external systems; this module defines the contracts plus two local
//! implementations:
//! - [`PaperBroker`] - in-process simulated brokerage (dry runs, tests)
//! - [`InstrumentMaster`] - resolver backed by a pre-filtered instrument file

pub mod instruments;
pub mod paper;
pub mod types;

use async_trait::async_trait;

use crate::command::Contract;
use crate::error::{BrokerError, ResolveError};

pub use instruments::{InstrumentMaster, InstrumentRecord};
pub use paper::{PaperBroker, ScriptedFailure};
pub use types::{AccessToken, BrokerOrderId, Credentials, Fill, InstrumentId, LoginGrant, OrderTicket};

/// Brokerage API surface used by the relay
#[async_trait]
pub trait BrokerageClient: Send + Sync {
    /// Start a session
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, BrokerError>;

    /// Place an order. The ticket's tag is the idempotency key: a broker that
    /// already accepted an order with this tag must return the same order id.
    async fn submit_order(
        &self,
        token: &AccessToken,
        ticket: &OrderTicket,
    ) -> Result<BrokerOrderId, BrokerError>;

    /// Fills reported by the broker for this session (reconciliation)
    async fn list_fills(&self, token: &AccessToken) -> Result<Vec<Fill>, BrokerError>;
}

/// Maps a contract at the nearest expiry to the broker's instrument id
#[async_trait]
pub trait InstrumentResolver: Send + Sync {
    async fn resolve(&self, contract: &Contract) -> Result<InstrumentId, ResolveError>;
}
