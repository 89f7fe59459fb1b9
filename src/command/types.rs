//! Parsed command types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    /// +1 for buys, -1 for sells
    pub fn sign(self) -> i64 {
        match self {
            Action::Buy => 1,
            Action::Sell => -1,
        }
    }

    /// Side that flattens a position of the given sign
    pub fn closing(net_lots: i64) -> Self {
        if net_lots > 0 {
            Action::Sell
        } else {
            Action::Buy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call or put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionType::Call => "CE",
            OptionType::Put => "PE",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "CE" => Some(OptionType::Call),
            "PE" => Some(OptionType::Put),
            _ => None,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An option contract at the nearest expiry.
///
/// Expiry selection is left to the instrument resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Contract {
    pub underlying: String,
    pub strike: u32,
    pub option_type: OptionType,
}

impl Contract {
    pub fn new(underlying: impl Into<String>, strike: u32, option_type: OptionType) -> Self {
        Self {
            underlying: underlying.into(),
            strike,
            option_type,
        }
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.underlying, self.strike, self.option_type)
    }
}

/// A structured trading intent parsed from a BUY/SELL command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intent {
    pub action: Action,
    pub contract: Contract,
    /// Lots as typed by the sender; range is enforced by the risk gate
    pub lots: u32,
}

impl Intent {
    pub fn new(action: Action, contract: Contract, lots: u32) -> Self {
        Self {
            action,
            contract,
            lots,
        }
    }

    /// Lots with the direction applied, as seen by position tracking
    pub fn signed_lots(&self) -> i64 {
        self.action.sign() * i64::from(self.lots)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} x {}", self.action, self.contract, self.lots)
    }
}

/// Everything a sender can ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Trade(Intent),
    Status,
    SquareOffAll,
    SquareOffLeg(Contract),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_lots() {
        let contract = Contract::new("NIFTY", 24000, OptionType::Call);
        assert_eq!(Intent::new(Action::Buy, contract.clone(), 3).signed_lots(), 3);
        assert_eq!(Intent::new(Action::Sell, contract, 3).signed_lots(), -3);
    }

    #[test]
    fn test_closing_side() {
        assert_eq!(Action::closing(4), Action::Sell);
        assert_eq!(Action::closing(-2), Action::Buy);
    }

    #[test]
    fn test_display() {
        let intent = Intent::new(Action::Sell, Contract::new("BANKNIFTY", 52000, OptionType::Put), 1);
        assert_eq!(intent.to_string(), "SELL BANKNIFTY 52000 PE x 1");
    }
}
