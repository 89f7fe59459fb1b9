//! Command tokenizer
//!
//! Purely syntactic: the underlying is uppercased but not checked against the
//! allow-list, and lots are not range-checked. Both belong to the risk gate.

use crate::error::ParseError;

use super::types::{Action, Command, Contract, Intent, OptionType};

const TRADE_ARITY: usize = 5;
const SQUAREOFF_LEG_ARITY: usize = 4;

/// Parse a raw text command. Total over all inputs.
pub fn parse(text: &str) -> Result<Command, ParseError> {
    let tokens: Vec<String> = text.split_whitespace().map(str::to_uppercase).collect();

    let Some(keyword) = tokens.first() else {
        return Err(ParseError::ArityMismatch {
            expected: 1,
            found: 0,
        });
    };

    match keyword.as_str() {
        "STATUS" => {
            expect_arity(&tokens, 1)?;
            Ok(Command::Status)
        }
        "BUY" => parse_trade(Action::Buy, &tokens),
        "SELL" => parse_trade(Action::Sell, &tokens),
        "SQUAREOFF" => parse_squareoff(&tokens),
        other => Err(ParseError::UnknownAction(other.to_string())),
    }
}

fn parse_trade(action: Action, tokens: &[String]) -> Result<Command, ParseError> {
    expect_arity(tokens, TRADE_ARITY)?;

    let contract = parse_contract(&tokens[1..4])?;
    let lots = parse_number("lots", &tokens[4])?;

    Ok(Command::Trade(Intent::new(action, contract, lots)))
}

fn parse_squareoff(tokens: &[String]) -> Result<Command, ParseError> {
    match tokens.len() {
        1 => Ok(Command::SquareOffAll),
        SQUAREOFF_LEG_ARITY => Ok(Command::SquareOffLeg(parse_contract(&tokens[1..4])?)),
        found => Err(ParseError::ArityMismatch {
            expected: SQUAREOFF_LEG_ARITY,
            found,
        }),
    }
}

/// `<UNDERLYING> <STRIKE> <CE|PE>`
fn parse_contract(tokens: &[String]) -> Result<Contract, ParseError> {
    let strike = parse_number("strike", &tokens[1])?;
    let option_type = OptionType::from_token(&tokens[2])
        .ok_or_else(|| ParseError::UnknownOptionType(tokens[2].clone()))?;

    Ok(Contract::new(tokens[0].clone(), strike, option_type))
}

fn expect_arity(tokens: &[String], expected: usize) -> Result<(), ParseError> {
    if tokens.len() != expected {
        return Err(ParseError::ArityMismatch {
            expected,
            found: tokens.len(),
        });
    }
    Ok(())
}

/// Only bare ASCII digits are accepted: no sign, no separators, no decimals.
fn parse_number(field: &'static str, token: &str) -> Result<u32, ParseError> {
    let malformed = || ParseError::MalformedNumber {
        field,
        token: token.to_string(),
    };

    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    token.parse::<u32>().map_err(|_| malformed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;

    fn kind(text: &str) -> ParseErrorKind {
        parse(text).unwrap_err().kind()
    }

    #[test]
    fn test_parse_buy() {
        let cmd = parse("BUY NIFTY 24000 CE 2").unwrap();
        assert_eq!(
            cmd,
            Command::Trade(Intent::new(
                Action::Buy,
                Contract::new("NIFTY", 24000, OptionType::Call),
                2
            ))
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let cmd = parse("  sell   banknifty 52000 pe 1 ").unwrap();
        match cmd {
            Command::Trade(intent) => {
                assert_eq!(intent.action, Action::Sell);
                assert_eq!(intent.contract.underlying, "BANKNIFTY");
                assert_eq!(intent.contract.option_type, OptionType::Put);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_underlying_passes_through() {
        let cmd = parse("BUY dogecoin 100 CE 1").unwrap();
        match cmd {
            Command::Trade(intent) => assert_eq!(intent.contract.underlying, "DOGECOIN"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_status() {
        assert_eq!(parse("status").unwrap(), Command::Status);
        assert_eq!(kind("STATUS NOW"), ParseErrorKind::ArityMismatch);
    }

    #[test]
    fn test_squareoff_forms() {
        assert_eq!(parse("SQUAREOFF").unwrap(), Command::SquareOffAll);
        assert_eq!(
            parse("squareoff NIFTY 24000 CE").unwrap(),
            Command::SquareOffLeg(Contract::new("NIFTY", 24000, OptionType::Call))
        );
        assert_eq!(kind("SQUAREOFF NIFTY"), ParseErrorKind::ArityMismatch);
    }

    #[test]
    fn test_malformed_numbers() {
        assert_eq!(kind("BUY NIFTY -24000 CE 2"), ParseErrorKind::MalformedNumber);
        assert_eq!(kind("BUY NIFTY 24000.5 CE 2"), ParseErrorKind::MalformedNumber);
        assert_eq!(kind("BUY NIFTY 24000 CE two"), ParseErrorKind::MalformedNumber);
        assert_eq!(kind("BUY NIFTY 24000 CE -1"), ParseErrorKind::MalformedNumber);
        assert_eq!(kind("BUY NIFTY 24000 CE +1"), ParseErrorKind::MalformedNumber);
        assert_eq!(kind("BUY NIFTY 99999999999 CE 1"), ParseErrorKind::MalformedNumber);
    }

    #[test]
    fn test_zero_lots_is_syntactically_valid() {
        assert!(matches!(parse("BUY NIFTY 24000 CE 0"), Ok(Command::Trade(_))));
    }

    #[test]
    fn test_unknown_action() {
        assert_eq!(kind("HOLD NIFTY 24000 CE 2"), ParseErrorKind::UnknownAction);
        assert_eq!(kind("hello"), ParseErrorKind::UnknownAction);
    }

    #[test]
    fn test_arity() {
        assert_eq!(kind(""), ParseErrorKind::ArityMismatch);
        assert_eq!(kind("   "), ParseErrorKind::ArityMismatch);
        assert_eq!(kind("BUY NIFTY 24000 CE"), ParseErrorKind::ArityMismatch);
        assert_eq!(kind("BUY NIFTY 24000 CE 2 NOW"), ParseErrorKind::ArityMismatch);
    }

    #[test]
    fn test_option_type() {
        assert_eq!(kind("BUY NIFTY 24000 XX 2"), ParseErrorKind::UnknownOptionType);
    }
}
