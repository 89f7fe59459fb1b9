//! Risk gate
//!
//! Checks run in a fixed order and the first failure decides the reason:
//! 1. underlying is allowed (and has a lot size)
//! 2. 1 <= lots <= max_lots_per_order
//! 3. strike is a multiple of [`STRIKE_STEP`]
//! 4. a positive reference price exists
//! 5. lots * lot_size * price <= max_order_value

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::command::Intent;

use super::prices::ReferencePrices;

/// Strikes must be multiples of this
pub const STRIKE_STEP: u32 = 50;

/// Risk limits snapshot. One instance is read for a whole command.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_lots_per_order: u32,
    pub max_order_value: Decimal,
    pub allowed_underlyings: HashSet<String>,
    /// Exchange lot size per underlying
    pub lot_sizes: HashMap<String, u32>,
}

impl RiskLimits {
    pub fn lot_size(&self, underlying: &str) -> Option<u32> {
        self.lot_sizes.get(underlying).copied()
    }
}

/// Why the gate refused an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskReason {
    UnknownUnderlying,
    QuantityExceeded,
    InvalidStrike,
    NoReferencePrice,
    ValueExceeded,
}

impl RiskReason {
    pub fn code(self) -> &'static str {
        match self {
            RiskReason::UnknownUnderlying => "UNKNOWN_UNDERLYING",
            RiskReason::QuantityExceeded => "QUANTITY_EXCEEDED",
            RiskReason::InvalidStrike => "INVALID_STRIKE",
            RiskReason::NoReferencePrice => "NO_REFERENCE_PRICE",
            RiskReason::ValueExceeded => "VALUE_EXCEEDED",
        }
    }
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of a risk evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accepted { estimated_value: Decimal },
    Rejected { reason: RiskReason, message: String },
}

impl RiskDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RiskDecision::Accepted { .. })
    }

    pub fn reason(&self) -> Option<RiskReason> {
        match self {
            RiskDecision::Accepted { .. } => None,
            RiskDecision::Rejected { reason, .. } => Some(*reason),
        }
    }

    fn reject(reason: RiskReason, message: String) -> Self {
        RiskDecision::Rejected { reason, message }
    }
}

/// Evaluate an intent against a limits snapshot. Pure and deterministic.
pub fn evaluate(
    intent: &Intent,
    limits: &RiskLimits,
    prices: &dyn ReferencePrices,
) -> RiskDecision {
    let contract = &intent.contract;

    let lot_size = match limits.lot_size(&contract.underlying) {
        Some(size) if limits.allowed_underlyings.contains(&contract.underlying) => size,
        _ => {
            return RiskDecision::reject(
                RiskReason::UnknownUnderlying,
                format!("{} is not a tradeable underlying", contract.underlying),
            )
        }
    };

    if intent.lots < 1 {
        return RiskDecision::reject(
            RiskReason::QuantityExceeded,
            "Quantity must be at least 1 lot".to_string(),
        );
    }
    if intent.lots > limits.max_lots_per_order {
        return RiskDecision::reject(
            RiskReason::QuantityExceeded,
            format!(
                "Quantity {} exceeds max allowed {} lots",
                intent.lots, limits.max_lots_per_order
            ),
        );
    }

    if contract.strike % STRIKE_STEP != 0 {
        return RiskDecision::reject(
            RiskReason::InvalidStrike,
            format!(
                "Strike {} is not a multiple of {}",
                contract.strike, STRIKE_STEP
            ),
        );
    }

    let price = match prices.price(contract) {
        Some(p) if p > Decimal::ZERO => p,
        _ => {
            return RiskDecision::reject(
                RiskReason::NoReferencePrice,
                format!("No reference price for {}", contract),
            )
        }
    };

    let estimated_value = Decimal::from(intent.lots) * Decimal::from(lot_size) * price;
    if estimated_value > limits.max_order_value {
        return RiskDecision::reject(
            RiskReason::ValueExceeded,
            format!(
                "Estimated order value ₹{} exceeds limit ₹{}",
                estimated_value.round_dp(2),
                limits.max_order_value.round_dp(2)
            ),
        );
    }

    debug!(intent = %intent, %estimated_value, "Risk checks passed");
    RiskDecision::Accepted { estimated_value }
}

/// Risk gate bound to a reference price source
#[derive(Clone)]
pub struct RiskGate {
    prices: Arc<dyn ReferencePrices>,
}

impl RiskGate {
    pub fn new(prices: Arc<dyn ReferencePrices>) -> Self {
        Self { prices }
    }

    pub fn evaluate(&self, intent: &Intent, limits: &RiskLimits) -> RiskDecision {
        evaluate(intent, limits, self.prices.as_ref())
    }
}
