//! Idempotency keys
//!
//! A key is the first 20 hex chars of SHA-256 over a canonical `|`-joined
//! string of sender, intent and time bucket. Re-deliveries inside one bucket
//! collapse to the same key, which doubles as the broker order tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::command::Intent;

/// Hex characters kept from the digest
pub const KEY_LEN: usize = 20;

/// Bump when the canonical layout changes
const KEY_VERSION: &str = "v1";

/// What kind of request produced the order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    Trade,
    SquareOff,
}

impl KeyScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            KeyScope::Trade => "TRADE",
            KeyScope::SquareOff => "SQUAREOFF",
        }
    }
}

/// Fixed-width window of wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeBucket(pub u64);

impl TimeBucket {
    pub fn at(time: DateTime<Utc>, width_secs: u64) -> Self {
        let secs = u64::try_from(time.timestamp()).unwrap_or(0);
        Self(secs / width_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn derive(scope: KeyScope, sender: &str, intent: &Intent, bucket: TimeBucket) -> Self {
        Self::digest(&Self::canonical(scope, sender, intent, bucket))
    }

    /// Key for closing a position at a given version. A later close of the
    /// same size, after the position changed, gets a different key.
    pub fn derive_square_off(
        sender: &str,
        intent: &Intent,
        position_version: u64,
        bucket: TimeBucket,
    ) -> Self {
        let canonical = format!(
            "{}|{}",
            Self::canonical(KeyScope::SquareOff, sender, intent, bucket),
            position_version
        );
        Self::digest(&canonical)
    }

    fn canonical(scope: KeyScope, sender: &str, intent: &Intent, bucket: TimeBucket) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            KEY_VERSION,
            scope.as_str(),
            sender,
            intent.action.as_str(),
            intent.contract.underlying,
            intent.contract.strike,
            intent.contract.option_type.as_str(),
            intent.lots,
            bucket.0
        )
    }

    fn digest(canonical: &str) -> Self {
        let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
        Self(digest[..KEY_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
