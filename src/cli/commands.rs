//! CLI command implementations

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::{InstrumentMaster, PaperBroker};
use crate::command::{parse, Command};
use crate::config::Config;
use crate::dispatch::{Dispatcher, InboundMessage, OutboundReply};
use crate::execution::OrderExecutor;
use crate::pipeline::{reply, Pipeline};
use crate::position::PositionTracker;
use crate::risk::{RiskDecision, RiskGate};
use crate::session::SessionManager;

/// Wire every component from config against the paper brokerage
pub async fn build_pipeline(config: &Config) -> Result<Arc<Pipeline>> {
    let broker = Arc::new(PaperBroker::new(
        Duration::from_secs(config.broker.token_ttl_secs),
        Duration::from_millis(config.broker.paper_latency_ms),
    ));

    let instruments = match &config.instruments.master_path {
        Some(path) => InstrumentMaster::load(path)
            .await
            .with_context(|| format!("Failed to load instrument master {}", path.display()))?,
        None => InstrumentMaster::default(),
    };

    let session = SessionManager::new(
        broker.clone(),
        config.credentials(),
        config.session_policy(),
    );
    let executor = OrderExecutor::new(
        broker,
        Arc::new(instruments),
        session,
        config.executor_settings(),
    );

    let positions = PositionTracker::new(config.positions.persistence_path.clone());
    if let Err(e) = positions.load().await {
        warn!("Could not load positions: {} (starting fresh)", e);
    }

    Ok(Arc::new(Pipeline::new(
        Arc::new(config.whitelist()),
        RiskGate::new(Arc::new(config.premium_table())),
        config.risk_limits(),
        Arc::new(executor),
        Arc::new(positions),
        config.idempotency.bucket_secs,
    )))
}

/// Split a `sender: text` line
fn split_message(line: &str) -> Option<InboundMessage> {
    let (sender, text) = line.split_once(':')?;
    let (sender, text) = (sender.trim(), text.trim());
    if sender.is_empty() || text.is_empty() {
        return None;
    }
    Some(InboundMessage::new(sender, text))
}

/// Relay `sender: text` lines from stdin until EOF or Ctrl-C
pub async fn run(config: &Config) -> Result<()> {
    info!("Starting options relay against the paper brokerage");
    let pipeline = build_pipeline(config).await?;

    let (reply_tx, mut reply_rx) = mpsc::channel::<OutboundReply>(64);
    let dispatcher = Dispatcher::new(
        Arc::clone(&pipeline),
        reply_tx,
        config.execution.queue_capacity,
    )
    .with_idle_timeout(Duration::from_secs(config.execution.worker_idle_secs));

    let printer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            println!("→ {}:\n{}\n", reply.sender, reply.text);
        }
    });

    println!("Enter messages as `sender: command` (Ctrl-D to stop)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match split_message(&line) {
                    Some(message) => {
                        if let Err(e) = dispatcher.dispatch(message).await {
                            error!("Dispatch failed: {}", e);
                        }
                    }
                    None => warn!("Ignoring line without `sender: text`: {}", line),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    drop(dispatcher);
    if let Err(e) = printer.await {
        error!("Reply printer failed: {}", e);
    }

    match pipeline.reconcile().await {
        Ok(drift) if drift.is_empty() => info!("Positions match broker fills"),
        Ok(drift) => {
            for d in drift {
                warn!(
                    "Drift on {}: tracked {} lots, broker {} lots",
                    d.instrument_id, d.tracked_lots, d.broker_lots
                );
            }
        }
        Err(e) => warn!("Could not reconcile with broker: {}", e),
    }

    info!("Relay stopped");
    Ok(())
}

/// Parse a command and print the result
pub fn parse_command(text: &str) -> Result<()> {
    match parse(text) {
        Ok(command) => println!("{:#?}", command),
        Err(e) => println!("{}", reply::usage(&e)),
    }
    Ok(())
}

/// Run a trade command through the risk gate without executing it
pub fn check(config: &Config, text: &str) -> Result<()> {
    let intent = match parse(text) {
        Ok(Command::Trade(intent)) => intent,
        Ok(other) => {
            println!("{:?} is not subject to risk checks", other);
            return Ok(());
        }
        Err(e) => {
            println!("{}", reply::usage(&e));
            return Ok(());
        }
    };

    let gate = RiskGate::new(Arc::new(config.premium_table()));
    match gate.evaluate(&intent, &config.risk_limits()) {
        RiskDecision::Accepted { estimated_value } => {
            println!("✅ {} accepted, estimated value ₹{}", intent, estimated_value.round_dp(2));
        }
        RiskDecision::Rejected { reason, message } => {
            println!("{}", reply::risk_rejected(reason, &message));
        }
    }
    Ok(())
}

/// Show persisted positions
pub async fn status(config: &Config) -> Result<()> {
    let Some(path) = &config.positions.persistence_path else {
        println!("positions.persistence_path not set - nothing persisted");
        return Ok(());
    };

    let tracker = PositionTracker::new(Some(path.clone()));
    tracker.load().await?;

    println!("\n=== POSITIONS ===\n");
    println!("{}", reply::positions(&tracker.open_positions().await));
    println!("\nTracked instruments: {}", tracker.position_count().await);
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
