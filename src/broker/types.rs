//! Brokerage wire-agnostic types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::command::Action;

/// Broker's identifier for a tradeable contract
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-assigned order id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerOrderId(String);

impl BrokerOrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: AccessToken,
    /// Lifetime announced by the broker
    pub ttl: Duration,
}

/// Login material. Storage is someone else's problem; we only carry it.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub client_code: String,
    pub totp_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("client_code", &self.client_code)
            .field("totp_secret", &"***")
            .finish()
    }
}

/// One order submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTicket {
    pub instrument_id: InstrumentId,
    pub side: Action,
    pub lots: u32,
    /// Client order tag carrying the idempotency key
    pub tag: String,
}

impl OrderTicket {
    pub fn signed_lots(&self) -> i64 {
        self.side.sign() * i64::from(self.lots)
    }
}

/// Broker-reported execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub instrument_id: InstrumentId,
    pub signed_lots: i64,
}
