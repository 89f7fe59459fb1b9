//! Command pipeline
//!
//! One inbound message in, exactly one reply out:
//! whitelist -> per-sender lock -> parse -> risk -> execute -> positions -> reply.
//! Square-offs skip the risk gate since they only ever reduce exposure.

pub mod reply;
pub mod whitelist;

pub use reply::SquareOffLine;
pub use whitelist::{SenderWhitelist, StaticWhitelist};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::broker::BrokerOrderId;
use crate::command::{parse, Action, Command, Contract, Intent};
use crate::error::{ExecutionError, Result};
use crate::execution::{
    IdempotencyKey, KeyScope, Order, OrderExecutor, OrderResult, OrderState, TimeBucket,
};
use crate::position::{Position, PositionDrift, PositionTracker};
use crate::risk::{RiskDecision, RiskGate, RiskLimits};

/// Wall-clock source for idempotency time buckets
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Pipeline {
    whitelist: Arc<dyn SenderWhitelist>,
    risk: RiskGate,
    limits: RwLock<Arc<RiskLimits>>,
    executor: Arc<OrderExecutor>,
    positions: Arc<PositionTracker>,
    sender_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Width of the idempotency time bucket
    key_bucket_secs: u64,
    clock: Clock,
}

impl Pipeline {
    pub fn new(
        whitelist: Arc<dyn SenderWhitelist>,
        risk: RiskGate,
        limits: RiskLimits,
        executor: Arc<OrderExecutor>,
        positions: Arc<PositionTracker>,
        key_bucket_secs: u64,
    ) -> Self {
        Self {
            whitelist,
            risk,
            limits: RwLock::new(Arc::new(limits)),
            executor,
            positions,
            sender_locks: DashMap::new(),
            key_bucket_secs,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for idempotency buckets
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn is_whitelisted(&self, sender: &str) -> bool {
        self.whitelist.is_whitelisted(sender).await
    }

    pub fn positions(&self) -> &Arc<PositionTracker> {
        &self.positions
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    /// Current limits snapshot
    pub fn limits(&self) -> Arc<RiskLimits> {
        Arc::clone(&self.limits.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in new limits. Commands already past the risk gate keep the old ones.
    pub fn reload_limits(&self, limits: RiskLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(limits);
        info!("Risk limits reloaded");
    }

    /// Handle one inbound message
    pub async fn handle(&self, sender: &str, text: &str) -> String {
        let request_id = Uuid::new_v4();
        let span = info_span!("command", %request_id, sender);
        self.handle_in_span(sender, text).instrument(span).await
    }

    /// Position summary for a sender
    pub async fn status(&self, sender: &str) -> String {
        let request_id = Uuid::new_v4();
        let span = info_span!("status", %request_id, sender);
        async {
            if !self.whitelist.is_whitelisted(sender).await {
                warn!("Rejected status request from unauthorised sender");
                return reply::unauthorised();
            }
            self.status_reply().await
        }
        .instrument(span)
        .await
    }

    /// Compare tracked positions with broker fills
    pub async fn reconcile(&self) -> std::result::Result<Vec<PositionDrift>, ExecutionError> {
        let fills = self.executor.list_fills().await?;
        Ok(self.positions.reconcile(&fills).await)
    }

    /// Feed an out-of-band broker status update into the order ledger
    pub fn on_order_update(&self, broker_order_id: &BrokerOrderId, state: OrderState) -> Result<Order> {
        self.executor.apply_broker_update(broker_order_id, state)
    }

    async fn handle_in_span(&self, sender: &str, text: &str) -> String {
        if !self.whitelist.is_whitelisted(sender).await {
            warn!("Rejected message from unauthorised sender");
            return reply::unauthorised();
        }

        let lock = self.sender_lock(sender);
        let _guard = lock.lock().await;

        let command = match parse(text) {
            Ok(command) => command,
            Err(e) => {
                info!(kind = ?e.kind(), error = %e, "Unparseable command");
                return reply::usage(&e);
            }
        };

        match command {
            Command::Status => self.status_reply().await,
            Command::Trade(intent) => self.trade(sender, intent).await,
            Command::SquareOffAll => self.square_off_all(sender).await,
            Command::SquareOffLeg(contract) => self.square_off_leg(sender, &contract).await,
        }
    }

    fn bucket(&self) -> TimeBucket {
        TimeBucket::at((self.clock)(), self.key_bucket_secs)
    }

    fn sender_lock(&self, sender: &str) -> Arc<Mutex<()>> {
        self.sender_locks
            .entry(sender.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn status_reply(&self) -> String {
        let snapshot = self.positions.snapshot().await;
        let open: Vec<Position> = snapshot.into_iter().filter(|p| !p.is_flat()).collect();
        reply::positions(&open)
    }

    async fn trade(&self, sender: &str, intent: Intent) -> String {
        let limits = self.limits();
        let estimated_value = match self.risk.evaluate(&intent, &limits) {
            RiskDecision::Accepted { estimated_value } => estimated_value,
            RiskDecision::Rejected { reason, message } => {
                warn!(intent = %intent, reason = %reason, "Risk check failed: {}", message);
                return reply::risk_rejected(reason, &message);
            }
        };

        let key = IdempotencyKey::derive(KeyScope::Trade, sender, &intent, self.bucket());
        match self.executor.execute(&intent, Some(estimated_value), &key).await {
            Ok(result) => {
                self.record_fill(&intent, &result).await;
                reply::order_placed(&intent, &result)
            }
            Err(e) => reply::order_failed(&e),
        }
    }

    /// Apply a confirmed order to positions. Replays were applied the first time.
    async fn record_fill(&self, intent: &Intent, result: &OrderResult) {
        if result.replayed {
            return;
        }
        self.positions
            .apply_result(&result.instrument_id, &intent.contract, intent.signed_lots())
            .await;
    }

    async fn square_off_all(&self, sender: &str) -> String {
        let open = self.positions.open_positions().await;
        if open.is_empty() {
            return reply::nothing_to_square_off();
        }

        info!(legs = open.len(), "Squaring off all open positions");
        let mut lines = Vec::with_capacity(open.len());
        for position in &open {
            lines.push(self.close(sender, position).await);
        }
        reply::square_off(&lines)
    }

    async fn square_off_leg(&self, sender: &str, contract: &Contract) -> String {
        match self.positions.find_open(contract).await {
            Some(position) => {
                let line = self.close(sender, &position).await;
                reply::square_off(&[line])
            }
            None => reply::no_open_leg(contract),
        }
    }

    /// Opposite-side order for the full net quantity
    async fn close(&self, sender: &str, position: &Position) -> SquareOffLine {
        let action = Action::closing(position.net_lots);
        let lots = match u32::try_from(position.net_lots.unsigned_abs()) {
            Ok(lots) => lots,
            Err(_) => {
                let intent = Intent::new(action, position.contract.clone(), u32::MAX);
                return SquareOffLine {
                    intent,
                    outcome: Err(format!("position of {} lots is too large", position.net_lots)),
                };
            }
        };
        let intent = Intent::new(action, position.contract.clone(), lots);

        let key =
            IdempotencyKey::derive_square_off(sender, &intent, position.version, self.bucket());
        let outcome = match self.executor.execute(&intent, None, &key).await {
            Ok(result) => {
                self.record_fill(&intent, &result).await;
                Ok(result)
            }
            Err(e) => Err(e.to_string()),
        };
        SquareOffLine { intent, outcome }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::{
        Credentials, InstrumentMaster, InstrumentRecord, PaperBroker, ScriptedFailure,
    };
    use crate::command::OptionType;
    use crate::error::BrokerError;
    use crate::execution::ExecutorSettings;
    use crate::retry::RetryPolicy;
    use crate::risk::PremiumTable;
    use crate::session::{SessionManager, SessionPolicy};
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    pub(crate) const TRADER: &str = "919876543210";
    pub(crate) const DESK: &str = "919812345678";

    /// 2024-06-03 09:15:00 UTC
    const MARKET_OPEN_SECS: i64 = 1_717_406_100;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    pub(crate) fn limits(max_lots: u32) -> RiskLimits {
        RiskLimits {
            max_lots_per_order: max_lots,
            max_order_value: dec!(100000),
            allowed_underlyings: HashSet::from(["NIFTY".to_string(), "BANKNIFTY".to_string()]),
            lot_sizes: HashMap::from([("NIFTY".to_string(), 50), ("BANKNIFTY".to_string(), 15)]),
        }
    }

    fn record(underlying: &str, strike: u32, option_type: OptionType, token: &str) -> InstrumentRecord {
        InstrumentRecord {
            underlying: underlying.into(),
            strike,
            option_type,
            token: token.into(),
        }
    }

    pub(crate) fn pipeline(broker: Arc<PaperBroker>) -> Pipeline {
        let master = InstrumentMaster::from_records(vec![
            record("NIFTY", 24000, OptionType::Call, "43650"),
            record("NIFTY", 24000, OptionType::Put, "43651"),
            record("BANKNIFTY", 52000, OptionType::Put, "51002"),
        ])
        .unwrap();
        let session = SessionManager::new(
            broker.clone(),
            Credentials::default(),
            SessionPolicy {
                login_retry: RetryPolicy::immediate(1),
                ..SessionPolicy::default()
            },
        );
        let executor = OrderExecutor::new(
            broker,
            Arc::new(master),
            session,
            ExecutorSettings {
                retry: RetryPolicy::immediate(3),
                ..ExecutorSettings::default()
            },
        );
        // NIFTY: 2 lots * 50 * 400 = 40000
        let prices = PremiumTable::new(HashMap::from([
            ("NIFTY".to_string(), dec!(400)),
            ("BANKNIFTY".to_string(), dec!(300)),
        ]));

        Pipeline::new(
            Arc::new(StaticWhitelist::new([TRADER, DESK])),
            RiskGate::new(Arc::new(prices)),
            limits(10),
            Arc::new(executor),
            Arc::new(PositionTracker::new(None)),
            60,
        )
        .with_clock(|| at(MARKET_OPEN_SECS))
    }

    pub(crate) fn paper() -> Arc<PaperBroker> {
        Arc::new(PaperBroker::new(Duration::from_secs(3600), Duration::ZERO))
    }

    #[tokio::test]
    async fn test_accepted_buy_is_placed() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;

        assert!(reply.starts_with("✅ Order placed!"), "{}", reply);
        assert!(reply.contains("Order ID: PAPER-000001"));
        assert_eq!(broker.order_count(), 1);

        let orders = pipeline.executor().ledger().orders();
        assert_eq!(orders[0].estimated_value, Some(dec!(40000)));
    }

    #[tokio::test]
    async fn test_invalid_strike_never_reaches_broker() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24010 CE 2").await;

        assert!(reply.contains("INVALID_STRIKE"), "{}", reply);
        assert!(reply.contains("not a multiple of 50"));
        assert_eq!(broker.login_calls(), 0);
        assert_eq!(broker.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_quantity_exceeded() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 11").await;

        assert!(reply.contains("QUANTITY_EXCEEDED"), "{}", reply);
        assert_eq!(broker.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_status_reflects_confirmed_orders() {
        let pipeline = pipeline(paper());

        assert_eq!(pipeline.handle(TRADER, "STATUS").await, "📊 No open positions.");

        pipeline.handle(TRADER, "buy nifty 24000 ce 2").await;
        let status = pipeline.handle(TRADER, "STATUS").await;
        assert!(status.contains("NIFTY 24000 CE (43650): net +2 lots"), "{}", status);

        assert_eq!(pipeline.status(TRADER).await, status);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let broker = paper();
        broker.fail_submits([ScriptedFailure::before_accept(BrokerError::Timeout(5000))]);
        let pipeline = pipeline(broker.clone());

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;

        assert!(reply.starts_with("✅ Order placed!"), "{}", reply);
        assert_eq!(broker.submit_calls(), 2);
        assert_eq!(broker.order_count(), 1);
        let positions = pipeline.positions().snapshot().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_lots, 2);
    }

    #[tokio::test]
    async fn test_redelivered_message_applied_once() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        let first = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        let second = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;

        assert!(!first.contains("duplicate"), "{}", first);
        assert!(second.contains("duplicate"), "{}", second);
        assert_eq!(first.lines().nth(1), second.lines().nth(1));
        assert_eq!(broker.submit_calls(), 1);
        assert_eq!(broker.order_count(), 1);
        assert_eq!(pipeline.positions().snapshot().await[0].net_lots, 2);
    }

    #[tokio::test]
    async fn test_same_command_in_next_bucket_is_new_order() {
        let broker = paper();
        let now = Arc::new(AtomicI64::new(MARKET_OPEN_SECS));
        let clock = Arc::clone(&now);
        let pipeline = pipeline(broker.clone()).with_clock(move || at(clock.load(Ordering::SeqCst)));

        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        now.fetch_add(59, Ordering::SeqCst);
        let redelivered = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        assert!(redelivered.contains("duplicate"), "{}", redelivered);
        assert_eq!(broker.order_count(), 1);

        now.fetch_add(1, Ordering::SeqCst);
        let repeated = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        assert!(!repeated.contains("duplicate"), "{}", repeated);
        assert!(repeated.contains("Order ID: PAPER-000002"), "{}", repeated);
        assert_eq!(pipeline.positions().snapshot().await[0].net_lots, 4);
    }

    #[tokio::test]
    async fn test_unauthorised_sender() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        let reply = pipeline.handle("910000000000", "BUY NIFTY 24000 CE 2").await;
        assert_eq!(reply, "❌ Unauthorised sender.");
        assert_eq!(pipeline.status("910000000000").await, "❌ Unauthorised sender.");
        assert_eq!(broker.login_calls(), 0);
    }

    #[tokio::test]
    async fn test_parse_errors_get_usage() {
        let pipeline = pipeline(paper());

        let reply = pipeline.handle(TRADER, "HOLD NIFTY 24000 CE 2").await;
        assert!(reply.starts_with("⚠️ Unrecognised command"), "{}", reply);

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000 CE").await;
        assert!(reply.starts_with("⚠️ Wrong number of words"), "{}", reply);

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000.5 CE 1").await;
        assert!(reply.starts_with("⚠️ Bad number"), "{}", reply);
    }

    #[tokio::test]
    async fn test_broker_rejection_reply() {
        let broker = paper();
        broker.fail_submits([ScriptedFailure::before_accept(BrokerError::Rejected(
            "insufficient margin".into(),
        ))]);
        let pipeline = pipeline(broker);

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        assert_eq!(
            reply,
            "❌ Order failed: order rejected by broker: insufficient margin"
        );
        assert!(pipeline.positions().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_square_off_all() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        assert_eq!(
            pipeline.handle(TRADER, "SQUAREOFF").await,
            "📊 No open positions to square off."
        );

        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        pipeline.handle(TRADER, "SELL BANKNIFTY 52000 PE 1").await;

        let reply = pipeline.handle(TRADER, "SQUAREOFF").await;
        assert!(reply.contains("✅ SELL NIFTY 24000 CE x 2"), "{}", reply);
        assert!(reply.contains("✅ BUY BANKNIFTY 52000 PE x 1"), "{}", reply);
        assert_eq!(broker.order_count(), 4);

        assert!(pipeline.positions().open_positions().await.is_empty());
        assert_eq!(pipeline.handle(TRADER, "STATUS").await, "📊 No open positions.");
    }

    #[tokio::test]
    async fn test_square_off_leg() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        let reply = pipeline.handle(TRADER, "SQUAREOFF NIFTY 24000 PE").await;
        assert_eq!(reply, "⚠️ No open position in NIFTY 24000 PE");

        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        pipeline.handle(TRADER, "BUY NIFTY 24000 PE 1").await;

        let reply = pipeline.handle(TRADER, "SQUAREOFF NIFTY 24000 PE").await;
        assert!(reply.contains("✅ SELL NIFTY 24000 PE x 1"), "{}", reply);

        let open = pipeline.positions().open_positions().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].contract, Contract::new("NIFTY", 24000, OptionType::Call));
    }

    #[tokio::test]
    async fn test_repeated_square_off_after_reopen_closes_again() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());

        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        let first = pipeline.handle(TRADER, "SQUAREOFF").await;
        assert!(first.contains("✅ SELL NIFTY 24000 CE x 2 → Order ID PAPER-000002"), "{}", first);

        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 3").await;
        pipeline.handle(TRADER, "SELL NIFTY 24000 CE 1").await;
        let second = pipeline.handle(TRADER, "SQUAREOFF").await;

        assert!(second.contains("✅ SELL NIFTY 24000 CE x 2 → Order ID PAPER-000005"), "{}", second);
        assert_eq!(broker.order_count(), 5);
        assert!(pipeline.positions().open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_square_off_bypasses_risk_limits() {
        let pipeline = pipeline(paper());
        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 5").await;
        pipeline.reload_limits(limits(1));

        let reply = pipeline.handle(TRADER, "SQUAREOFF NIFTY 24000 CE").await;
        assert!(reply.contains("✅ SELL NIFTY 24000 CE x 5"), "{}", reply);
    }

    #[tokio::test]
    async fn test_reload_limits() {
        let broker = paper();
        let pipeline = pipeline(broker.clone());
        pipeline.reload_limits(limits(1));

        let reply = pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;
        assert!(reply.contains("QUANTITY_EXCEEDED"));
        assert_eq!(pipeline.limits().max_lots_per_order, 1);
        assert_eq!(broker.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_and_order_updates() {
        let pipeline = pipeline(paper());
        pipeline.handle(TRADER, "BUY NIFTY 24000 CE 2").await;

        assert!(pipeline.reconcile().await.unwrap().is_empty());

        let order = pipeline
            .on_order_update(&BrokerOrderId::new("PAPER-000001"), OrderState::Filled)
            .unwrap();
        assert_eq!(order.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_concurrent_commands_share_one_login() {
        let broker = paper();
        broker.set_login_delay(Duration::from_millis(20));
        let pipeline = Arc::new(pipeline(broker.clone()));

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.handle(TRADER, "BUY NIFTY 24000 CE 1").await })
        };
        let second = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.handle(DESK, "BUY NIFTY 24000 PE 1").await })
        };

        assert!(first.await.unwrap().starts_with("✅"));
        assert!(second.await.unwrap().starts_with("✅"));
        assert_eq!(broker.login_calls(), 1);
        assert_eq!(broker.order_count(), 2);
    }
}
