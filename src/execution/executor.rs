//! Order executor
//!
//! Drives one accepted intent through instrument resolution, session
//! acquisition and submission. Submissions are retried under the same
//! idempotency key, which travels to the broker as the order tag.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::broker::{
    AccessToken, BrokerOrderId, BrokerageClient, Fill, InstrumentId, InstrumentResolver,
    OrderTicket,
};
use crate::command::Intent;
use crate::error::{AuthError, BrokerError, ExecutionError, ResolveError, Result};
use crate::retry::{RetryPolicy, Retryable};
use crate::session::SessionManager;

use super::idempotency::IdempotencyKey;
use super::order::{Admission, Order, OrderLedger, OrderState};

/// Executor timeouts and retry policy
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub retry: RetryPolicy,
    /// Bound on waiting for one broker submit
    pub submit_timeout: Duration,
    pub resolve_timeout: Duration,
    /// Bound on waiting for a session token
    pub token_wait: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            submit_timeout: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(2),
            token_wait: Duration::from_secs(10),
        }
    }
}

/// Successful execution
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub idempotency_key: IdempotencyKey,
    pub broker_order_id: BrokerOrderId,
    pub instrument_id: InstrumentId,
    pub state: OrderState,
    pub attempts: u32,
    /// Served from the ledger without a broker call
    pub replayed: bool,
}

/// Failure of a single submit attempt
#[derive(Error, Debug)]
enum SubmitError {
    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Auth(AuthError),
}

impl Retryable for SubmitError {
    fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Broker(e) => e.is_retryable(),
            SubmitError::Auth(_) => false,
        }
    }
}

pub struct OrderExecutor {
    broker: Arc<dyn BrokerageClient>,
    resolver: Arc<dyn InstrumentResolver>,
    session: SessionManager,
    ledger: OrderLedger,
    settings: ExecutorSettings,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<dyn BrokerageClient>,
        resolver: Arc<dyn InstrumentResolver>,
        session: SessionManager,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            broker,
            resolver,
            session,
            ledger: OrderLedger::new(),
            settings,
        }
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Execute an accepted intent at most once per key
    pub async fn execute(
        &self,
        intent: &Intent,
        estimated_value: Option<Decimal>,
        key: &IdempotencyKey,
    ) -> std::result::Result<OrderResult, ExecutionError> {
        match self.ledger.admit(key, intent, estimated_value) {
            Admission::Fresh => self.record(key, |o| o.transition(OrderState::Validated)),
            Admission::Resubmit { resubmissions } => {
                info!(key = %key, resubmissions, "Resubmitting previously failed order");
            }
            Admission::Replay(order) => {
                info!(key = %key, state = %order.state, "Replaying recorded order");
                return Self::replay(order);
            }
            Admission::InFlight => {
                warn!(key = %key, "Order with this key is already in flight");
                return Err(ExecutionError::BrokerUnavailable {
                    attempts: 0,
                    last_error: "order already in flight".to_string(),
                });
            }
        }

        info!(key = %key, intent = %intent, "Executing order");

        let instrument_id = match self.resolve(intent).await {
            Ok(id) => id,
            Err((state, e)) => return self.finish_with_error(key, state, e, 0),
        };
        self.record(key, |o| {
            o.instrument_id = Some(instrument_id.clone());
            o.transition(OrderState::Submitting)
        });

        let token = match self.acquire_token().await {
            Ok(token) => token,
            Err(e) => return self.finish_with_error(key, OrderState::Failed, e.into(), 0),
        };

        let ticket = OrderTicket {
            instrument_id: instrument_id.clone(),
            side: intent.action,
            lots: intent.lots,
            tag: key.to_string(),
        };
        self.submit(key, ticket, token).await
    }

    fn replay(order: Order) -> std::result::Result<OrderResult, ExecutionError> {
        match (order.state, order.broker_order_id, order.instrument_id) {
            (state, Some(broker_order_id), Some(instrument_id)) if state.is_success() => {
                Ok(OrderResult {
                    idempotency_key: order.idempotency_key,
                    broker_order_id,
                    instrument_id,
                    state,
                    attempts: order.attempts,
                    replayed: true,
                })
            }
            _ => Err(order.last_error.unwrap_or_else(|| {
                ExecutionError::BrokerRejected("order previously rejected".to_string())
            })),
        }
    }

    async fn resolve(
        &self,
        intent: &Intent,
    ) -> std::result::Result<InstrumentId, (OrderState, ExecutionError)> {
        let limit = self.settings.resolve_timeout;
        match timeout(limit, self.resolver.resolve(&intent.contract)).await {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(ResolveError::NotFound(what))) => {
                Err((OrderState::Rejected, ExecutionError::NotFound(what)))
            }
            Ok(Err(ResolveError::Unavailable(msg))) => Err((
                OrderState::Failed,
                ExecutionError::BrokerUnavailable {
                    attempts: 0,
                    last_error: msg,
                },
            )),
            Err(_) => Err((
                OrderState::Failed,
                ExecutionError::BrokerUnavailable {
                    attempts: 0,
                    last_error: format!("instrument lookup timed out after {}ms", limit.as_millis()),
                },
            )),
        }
    }

    /// Valid token, with one forced refresh if the first try fails.
    ///
    /// The forced refresh is suppressed while the session is cooling down
    /// after exhausted logins: it returns `SessionDown` without a login.
    async fn acquire_token(&self) -> std::result::Result<AccessToken, AuthError> {
        let wait = self.settings.token_wait;
        match self.session.get_valid_token(Instant::now() + wait).await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "No session token, forcing one refresh");
                self.session.force_refresh(None, Instant::now() + wait).await
            }
        }
    }

    async fn submit(
        &self,
        key: &IdempotencyKey,
        ticket: OrderTicket,
        token: AccessToken,
    ) -> std::result::Result<OrderResult, ExecutionError> {
        let current_token = Mutex::new(token);
        let reauthenticated = AtomicBool::new(false);
        let attempts_made = AtomicU32::new(0);

        let ticket = &ticket;
        let current_token = &current_token;
        let reauthenticated = &reauthenticated;
        let attempts_made = &attempts_made;

        let result = self
            .settings
            .retry
            .run("submit_order", |attempt| async move {
                attempts_made.store(attempt, Ordering::SeqCst);
                let token = current_token
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();

                match self.submit_once(&token, ticket).await {
                    Err(BrokerError::Unauthorized(msg))
                        if !reauthenticated.swap(true, Ordering::SeqCst) =>
                    {
                        warn!(key = %ticket.tag, reason = %msg, "Broker refused session token, refreshing");
                        let deadline = Instant::now() + self.settings.token_wait;
                        let fresh = self
                            .session
                            .force_refresh(Some(&token), deadline)
                            .await
                            .map_err(SubmitError::Auth)?;
                        *current_token.lock().unwrap_or_else(PoisonError::into_inner) =
                            fresh.clone();
                        self.submit_once(&fresh, ticket)
                            .await
                            .map_err(SubmitError::Broker)
                    }
                    other => other.map_err(SubmitError::Broker),
                }
            })
            .await;

        let attempts = attempts_made.load(Ordering::SeqCst);
        match result {
            Ok(broker_order_id) => {
                let recorded = self.ledger.update(key, |o| {
                    o.broker_order_id = Some(broker_order_id.clone());
                    o.attempts = attempts;
                    o.transition(OrderState::Submitted)
                });
                if let Err(e) = recorded {
                    error!(key = %key, error = %e, "Failed to record submitted order");
                }
                info!(
                    key = %key,
                    broker_order_id = %broker_order_id,
                    attempts,
                    "Order submitted"
                );
                Ok(OrderResult {
                    idempotency_key: key.clone(),
                    broker_order_id,
                    instrument_id: ticket.instrument_id.clone(),
                    state: OrderState::Submitted,
                    attempts,
                    replayed: false,
                })
            }
            Err(failure) => {
                let (state, e) = match failure.error {
                    SubmitError::Broker(BrokerError::Rejected(msg)) => {
                        (OrderState::Rejected, ExecutionError::BrokerRejected(msg))
                    }
                    SubmitError::Broker(e) => (
                        OrderState::Failed,
                        ExecutionError::BrokerUnavailable {
                            attempts: failure.attempts,
                            last_error: e.to_string(),
                        },
                    ),
                    SubmitError::Auth(e) => (OrderState::Failed, ExecutionError::Auth(e)),
                };
                self.finish_with_error(key, state, e, failure.attempts)
            }
        }
    }

    /// One bounded submit. The broker call runs in its own task so an
    /// abandoned wait never cancels a request already on the wire.
    async fn submit_once(
        &self,
        token: &AccessToken,
        ticket: &OrderTicket,
    ) -> std::result::Result<BrokerOrderId, BrokerError> {
        let broker = Arc::clone(&self.broker);
        let token = token.clone();
        let owned_ticket = ticket.clone();
        let call = tokio::spawn(async move { broker.submit_order(&token, &owned_ticket).await });

        let limit = self.settings.submit_timeout;
        match timeout(limit, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BrokerError::Transport(format!("submit task failed: {}", e))),
            Err(_) => Err(BrokerError::Timeout(limit.as_millis() as u64)),
        }
    }

    fn record<F>(&self, key: &IdempotencyKey, f: F)
    where
        F: FnOnce(&mut Order) -> Result<()>,
    {
        if let Err(e) = self.ledger.update(key, f) {
            error!(key = %key, error = %e, "Order ledger update failed");
        }
    }

    fn finish_with_error(
        &self,
        key: &IdempotencyKey,
        state: OrderState,
        e: ExecutionError,
        attempts: u32,
    ) -> std::result::Result<OrderResult, ExecutionError> {
        warn!(key = %key, state = %state, error = %e, "Order did not go through");
        let recorded = e.clone();
        self.record(key, move |o| {
            o.last_error = Some(recorded);
            o.attempts = attempts;
            o.transition(state)
        });
        Err(e)
    }

    /// Apply an out-of-band status update reported by the broker
    pub fn apply_broker_update(
        &self,
        broker_order_id: &BrokerOrderId,
        state: OrderState,
    ) -> Result<Order> {
        let key = self
            .ledger
            .find_by_broker_id(broker_order_id)
            .ok_or_else(|| crate::error::Error::OrderNotFound(broker_order_id.to_string()))?;
        let order = self.ledger.update(&key, |o| o.transition(state))?;
        info!(broker_order_id = %broker_order_id, state = %state, "Applied broker order update");
        Ok(order)
    }

    /// Fills reported by the broker for the current session
    pub async fn list_fills(&self) -> std::result::Result<Vec<Fill>, ExecutionError> {
        let token = self.acquire_token().await?;
        let limit = self.settings.submit_timeout;

        self.settings
            .retry
            .run("list_fills", |_| {
                let token = &token;
                async move {
                    match timeout(limit, self.broker.list_fills(token)).await {
                        Ok(result) => result,
                        Err(_) => Err(BrokerError::Timeout(limit.as_millis() as u64)),
                    }
                }
            })
            .await
            .map_err(|failure| ExecutionError::BrokerUnavailable {
                attempts: failure.attempts,
                last_error: failure.error.to_string(),
            })
    }
}
