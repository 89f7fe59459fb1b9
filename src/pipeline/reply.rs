//! Reply text sent back to the sender

use crate::command::{Contract, Intent};
use crate::error::{ExecutionError, ParseError, ParseErrorKind};
use crate::execution::OrderResult;
use crate::position::Position;
use crate::risk::RiskReason;

const USAGE: &str = "*Place order:*\n\
BUY NIFTY 24000 CE 2\n\
SELL BANKNIFTY 52000 PE 1\n\n\
*Square off:*\n\
SQUAREOFF                   ← close all positions\n\
SQUAREOFF NIFTY 24000 CE    ← close specific leg\n\n\
*Status:*\n\
STATUS";

pub fn unauthorised() -> String {
    "❌ Unauthorised sender.".to_string()
}

pub fn usage(error: &ParseError) -> String {
    let headline = match error.kind() {
        ParseErrorKind::UnknownAction => "Unrecognised command",
        ParseErrorKind::ArityMismatch => "Wrong number of words",
        ParseErrorKind::MalformedNumber => "Bad number",
        ParseErrorKind::UnknownOptionType => "Bad option type",
    };
    format!("⚠️ {}: {}.\n\n{}", headline, error, USAGE)
}

pub fn risk_rejected(reason: RiskReason, message: &str) -> String {
    format!("🚫 Risk check failed ({}): {}", reason.code(), message)
}

pub fn order_placed(intent: &Intent, result: &OrderResult) -> String {
    let mut reply = format!(
        "✅ Order placed!\nOrder ID: {}\n{}\nStatus: {}",
        result.broker_order_id, intent, result.state
    );
    if result.replayed {
        reply.push_str("\n(duplicate message, order was already placed)");
    }
    reply
}

pub fn order_failed(error: &ExecutionError) -> String {
    format!("❌ Order failed: {}", error)
}

pub fn positions(open: &[Position]) -> String {
    if open.is_empty() {
        return "📊 No open positions.".to_string();
    }
    let mut lines = vec!["📊 *Open Positions*".to_string()];
    for p in open {
        lines.push(format!(
            "• {} ({}): net {:+} lots",
            p.contract, p.instrument_id, p.net_lots
        ));
    }
    lines.join("\n")
}

/// Result of closing one leg
#[derive(Debug, Clone)]
pub struct SquareOffLine {
    pub intent: Intent,
    pub outcome: Result<OrderResult, String>,
}

pub fn nothing_to_square_off() -> String {
    "📊 No open positions to square off.".to_string()
}

pub fn no_open_leg(contract: &Contract) -> String {
    format!("⚠️ No open position in {}", contract)
}

pub fn square_off(lines: &[SquareOffLine]) -> String {
    let mut out = vec!["🔴 *Squareoff Results:*".to_string()];
    for line in lines {
        match &line.outcome {
            Ok(result) if result.replayed => out.push(format!(
                "⚠️ {} → duplicate, already placed as Order ID {}",
                line.intent, result.broker_order_id
            )),
            Ok(result) => out.push(format!(
                "✅ {} → Order ID {}",
                line.intent, result.broker_order_id
            )),
            Err(e) => out.push(format!("❌ {} → {}", line.intent, e)),
        }
    }
    out.join("\n")
}
