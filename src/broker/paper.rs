//! Paper brokerage
//!
//! In-process simulated broker used for dry runs and tests. It honours the
//! same contract as a real brokerage: order tags are deduplicated, tokens
//! expire, and failures can be scripted ahead of time.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::BrokerError;

use super::types::{AccessToken, BrokerOrderId, Credentials, Fill, LoginGrant, OrderTicket};
use super::BrokerageClient;

/// A failure the paper broker will return on a future call
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub error: BrokerError,
    /// Accept the order first and then report the error (lost acknowledgement)
    pub after_accept: bool,
}

impl ScriptedFailure {
    pub fn before_accept(error: BrokerError) -> Self {
        Self {
            error,
            after_accept: false,
        }
    }

    pub fn after_accept(error: BrokerError) -> Self {
        Self {
            error,
            after_accept: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: BrokerOrderId,
    fill: Fill,
}

/// Simulated brokerage
pub struct PaperBroker {
    token_ttl: Duration,
    latency: Duration,
    login_delay: Mutex<Duration>,
    next_order: AtomicU64,
    next_token: AtomicU64,
    /// tag -> order
    orders: DashMap<String, PaperOrder>,
    live_tokens: DashMap<String, ()>,
    login_calls: AtomicU32,
    submit_calls: AtomicU32,
    login_failures: Mutex<VecDeque<BrokerError>>,
    submit_failures: Mutex<VecDeque<ScriptedFailure>>,
}

impl PaperBroker {
    pub fn new(token_ttl: Duration, latency: Duration) -> Self {
        info!(
            "Paper broker ready (token ttl {}s, latency {}ms)",
            token_ttl.as_secs(),
            latency.as_millis()
        );
        Self {
            token_ttl,
            latency,
            login_delay: Mutex::new(Duration::ZERO),
            next_order: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            orders: DashMap::new(),
            live_tokens: DashMap::new(),
            login_calls: AtomicU32::new(0),
            submit_calls: AtomicU32::new(0),
            login_failures: Mutex::new(VecDeque::new()),
            submit_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Delay applied to every login call
    pub fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Queue login failures, consumed one per login call
    pub fn fail_logins(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.login_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors);
    }

    /// Queue submit failures, consumed one per submit call
    pub fn fail_submits(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.submit_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(failures);
    }

    /// Invalidate every issued token, as a broker-side session expiry would
    pub fn revoke_tokens(&self) {
        self.live_tokens.clear();
    }

    pub fn login_calls(&self) -> u32 {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Distinct orders accepted
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    fn accept(&self, ticket: &OrderTicket) -> BrokerOrderId {
        self.orders
            .entry(ticket.tag.clone())
            .or_insert_with(|| {
                let seq = self.next_order.fetch_add(1, Ordering::SeqCst);
                let id = BrokerOrderId::new(format!("PAPER-{:06}", seq));
                info!(order_id = %id, tag = %ticket.tag, "Paper order accepted");
                PaperOrder {
                    id,
                    fill: Fill {
                        instrument_id: ticket.instrument_id.clone(),
                        signed_lots: ticket.signed_lots(),
                    },
                }
            })
            .id
            .clone()
    }
}

#[async_trait]
impl BrokerageClient for PaperBroker {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, BrokerError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.login_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .login_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = scripted {
            debug!(error = %error, "Scripted login failure");
            return Err(error);
        }

        let seq = self.next_token.fetch_add(1, Ordering::SeqCst);
        let token = format!("paper-{}-{}", credentials.client_code, seq);
        self.live_tokens.insert(token.clone(), ());

        Ok(LoginGrant {
            token: AccessToken::new(token),
            ttl: self.token_ttl,
        })
    }

    async fn submit_order(
        &self,
        token: &AccessToken,
        ticket: &OrderTicket,
    ) -> Result<BrokerOrderId, BrokerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        if !self.live_tokens.contains_key(token.expose()) {
            return Err(BrokerError::Unauthorized("session expired".to_string()));
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .submit_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(failure) = scripted {
            if failure.after_accept {
                self.accept(ticket);
            }
            debug!(error = %failure.error, after_accept = failure.after_accept, "Scripted submit failure");
            return Err(failure.error);
        }

        Ok(self.accept(ticket))
    }

    async fn list_fills(&self, token: &AccessToken) -> Result<Vec<Fill>, BrokerError> {
        if !self.live_tokens.contains_key(token.expose()) {
            return Err(BrokerError::Unauthorized("session expired".to_string()));
        }
        Ok(self.orders.iter().map(|o| o.fill.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InstrumentId;
    use crate::command::Action;

    fn ticket(tag: &str) -> OrderTicket {
        OrderTicket {
            instrument_id: InstrumentId::new("43650"),
            side: Action::Buy,
            lots: 2,
            tag: tag.to_string(),
        }
    }

    #[tokio::test]
    async fn test_same_tag_same_order() {
        let broker = PaperBroker::new(Duration::from_secs(60), Duration::ZERO);
        let grant = broker.login(&Credentials::default()).await.unwrap();

        let first = broker.submit_order(&grant.token, &ticket("k1")).await.unwrap();
        let second = broker.submit_order(&grant.token, &ticket("k1")).await.unwrap();
        let other = broker.submit_order(&grant.token, &ticket("k2")).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(broker.order_count(), 2);
    }

    #[tokio::test]
    async fn test_revoked_token_unauthorized() {
        let broker = PaperBroker::new(Duration::from_secs(60), Duration::ZERO);
        let grant = broker.login(&Credentials::default()).await.unwrap();
        broker.revoke_tokens();

        let err = broker.submit_order(&grant.token, &ticket("k1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_lost_ack_still_records_order() {
        let broker = PaperBroker::new(Duration::from_secs(60), Duration::ZERO);
        let grant = broker.login(&Credentials::default()).await.unwrap();
        broker.fail_submits([ScriptedFailure::after_accept(BrokerError::Timeout(100))]);

        assert!(broker.submit_order(&grant.token, &ticket("k1")).await.is_err());
        assert_eq!(broker.order_count(), 1);

        let fills = broker.list_fills(&grant.token).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].signed_lots, 2);
    }
}
