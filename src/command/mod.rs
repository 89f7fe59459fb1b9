//! Text command model and parser
//!
//! Supported forms (case-insensitive):
//! - `BUY|SELL <UNDERLYING> <STRIKE> <CE|PE> <LOTS>` - place a new order
//! - `STATUS` - view tracked positions
//! - `SQUAREOFF` - close every open position at market
//! - `SQUAREOFF <UNDERLYING> <STRIKE> <CE|PE>` - close one leg at market

pub mod parser;
pub mod types;

pub use parser::parse;
pub use types::{Action, Command, Contract, Intent, OptionType};
