//! Order lifecycle and the in-memory order ledger

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::broker::{BrokerOrderId, InstrumentId};
use crate::command::Intent;
use crate::error::{Error, ExecutionError, Result};

use super::idempotency::IdempotencyKey;

/// Order state machine.
///
/// ```text
/// Created -> Validated -> Submitting -> Submitted -> PartiallyFilled -> Filled
///              ^  |             |            \---------------------------/
///              |  +-------------+--> Rejected | Failed
///              +------------(resubmit)-----------+
/// ```
///
/// `Failed -> Validated` is the only edge out of a failed order: a later
/// command with the same key resubmits it. The broker dedupes on the key, so
/// a resubmission cannot produce a second order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    /// Passed risk checks
    Validated,
    /// Instrument resolved, broker call in progress
    Submitting,
    /// Broker acknowledged with an order id
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
    /// Retries exhausted or session unavailable
    Failed,
}

impl OrderState {
    /// Whether `next` is a legal forward move from this state
    pub const fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Created, Validated)
                | (Validated, Submitting)
                | (Validated, Rejected)
                | (Validated, Failed)
                | (Submitting, Submitted)
                | (Submitting, Rejected)
                | (Submitting, Failed)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (PartiallyFilled, Filled)
                | (Failed, Validated)
        )
    }

    /// The executor is finished with the order. Later states only arrive
    /// as broker updates.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::PartiallyFilled | Self::Filled | Self::Rejected | Self::Failed
        )
    }

    /// Broker accepted the order
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled | Self::Filled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Validated => "VALIDATED",
            Self::Submitting => "SUBMITTING",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One order, keyed by its idempotency key
#[derive(Debug, Clone)]
pub struct Order {
    pub idempotency_key: IdempotencyKey,
    pub intent: Intent,
    pub estimated_value: Option<Decimal>,
    pub instrument_id: Option<InstrumentId>,
    pub state: OrderState,
    pub broker_order_id: Option<BrokerOrderId>,
    pub last_error: Option<ExecutionError>,
    pub attempts: u32,
    /// Times this order was resubmitted after failing
    pub resubmissions: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(key: IdempotencyKey, intent: Intent, estimated_value: Option<Decimal>) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key: key,
            intent,
            estimated_value,
            instrument_id: None,
            state: OrderState::Created,
            broker_order_id: None,
            last_error: None,
            attempts: 0,
            resubmissions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, to: OrderState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Start another run of a failed order under the same key
    pub fn resubmit(&mut self) -> Result<()> {
        self.transition(OrderState::Validated)?;
        self.resubmissions += 1;
        self.last_error = None;
        self.attempts = 0;
        Ok(())
    }
}

/// Outcome of asking the ledger to start an order
#[derive(Debug, Clone)]
pub enum Admission {
    /// New order recorded in `Created`, caller must drive it
    Fresh,
    /// Failed order moved back to `Validated`, caller must drive it again
    Resubmit { resubmissions: u32 },
    /// A finished order already exists for the key
    Replay(Order),
    /// Another caller is driving this key right now
    InFlight,
}

/// Orders by idempotency key
#[derive(Debug, Default)]
pub struct OrderLedger {
    orders: DashMap<IdempotencyKey, Order>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key`.
    ///
    /// A `Failed` order is resubmitted in place, keeping its history.
    pub fn admit(
        &self,
        key: &IdempotencyKey,
        intent: &Intent,
        estimated_value: Option<Decimal>,
    ) -> Admission {
        match self.orders.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get().state;
                if state.is_success() || state == OrderState::Rejected {
                    Admission::Replay(entry.get().clone())
                } else if state == OrderState::Failed {
                    let order = entry.get_mut();
                    match order.resubmit() {
                        Ok(()) => Admission::Resubmit {
                            resubmissions: order.resubmissions,
                        },
                        Err(_) => Admission::InFlight,
                    }
                } else {
                    Admission::InFlight
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Order::new(key.clone(), intent.clone(), estimated_value));
                Admission::Fresh
            }
        }
    }

    /// Mutate one order in place and return the updated copy
    pub fn update<F>(&self, key: &IdempotencyKey, f: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> Result<()>,
    {
        let mut order = self
            .orders
            .get_mut(key)
            .ok_or_else(|| Error::OrderNotFound(key.to_string()))?;
        f(order.value_mut())?;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<Order> {
        self.orders.get(key).map(|o| o.clone())
    }

    pub fn find_by_broker_id(&self, broker_order_id: &BrokerOrderId) -> Option<IdempotencyKey> {
        self.orders
            .iter()
            .find(|o| o.broker_order_id.as_ref() == Some(broker_order_id))
            .map(|o| o.key().clone())
    }

    /// All orders, oldest first
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.iter().map(|o| o.clone()).collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
