//! Reference prices used to estimate order value

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::command::Contract;

/// Source of a per-contract reference premium.
///
/// Must be a pure function of the contract for the duration of one evaluation.
pub trait ReferencePrices: Send + Sync {
    fn price(&self, contract: &Contract) -> Option<Decimal>;
}

impl<F> ReferencePrices for F
where
    F: Fn(&Contract) -> Option<Decimal> + Send + Sync,
{
    fn price(&self, contract: &Contract) -> Option<Decimal> {
        self(contract)
    }
}

/// Approximate premium per unit, keyed by underlying.
///
/// Deliberately coarse: it bounds fat-finger orders, it does not price them.
#[derive(Debug, Clone, Default)]
pub struct PremiumTable {
    premiums: HashMap<String, Decimal>,
}

impl PremiumTable {
    pub fn new(premiums: HashMap<String, Decimal>) -> Self {
        let premiums = premiums
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        Self { premiums }
    }

    pub fn len(&self) -> usize {
        self.premiums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.premiums.is_empty()
    }
}

impl ReferencePrices for PremiumTable {
    fn price(&self, contract: &Contract) -> Option<Decimal> {
        self.premiums.get(&contract.underlying).copied()
    }
}
