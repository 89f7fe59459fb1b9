//! Session manager with single-flight refresh

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::broker::{AccessToken, BrokerageClient, Credentials};
use crate::error::{AuthError, BrokerError};
use crate::retry::RetryPolicy;

/// Session timing and retry knobs
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Refresh this long before the broker-announced expiry
    pub safety_margin: Duration,
    /// Bound on a single login call
    pub login_timeout: Duration,
    /// Refuse new logins for this long after a refresh gives up
    pub cooldown: Duration,
    pub login_retry: RetryPolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(300),
            login_timeout: Duration::from_secs(5),
            cooldown: Duration::from_secs(60),
            login_retry: RetryPolicy::default(),
        }
    }
}

/// A live brokerage session
#[derive(Debug, Clone)]
pub struct Session {
    pub token: AccessToken,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl Session {
    /// Usable only while outside the safety margin
    pub fn is_usable_at(&self, now: Instant, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Absent,
    Live,
    Refreshing,
    CoolingDown,
}

type RefreshFlight = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

enum SessionState {
    Absent,
    Live(Session),
    Refreshing(RefreshFlight),
    CoolingDown { until: Instant },
}

/// What a caller should do after inspecting the state
enum Step {
    Ready(Result<AccessToken, AuthError>),
    Join(RefreshFlight),
    Start,
}

struct Inner {
    broker: Arc<dyn BrokerageClient>,
    credentials: Credentials,
    policy: SessionPolicy,
    state: Mutex<SessionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs detached from any caller, so abandoning a wait never cancels it
    async fn refresh(self: Arc<Self>) -> Result<Session, AuthError> {
        let outcome = self.login_with_retry().await;

        let mut state = self.lock();
        *state = match &outcome {
            Ok(session) => SessionState::Live(session.clone()),
            Err(_) => SessionState::CoolingDown {
                until: Instant::now() + self.policy.cooldown,
            },
        };
        outcome
    }

    async fn login_with_retry(&self) -> Result<Session, AuthError> {
        let login_timeout = self.policy.login_timeout;

        let result = self
            .policy
            .login_retry
            .run("broker_login", |attempt| async move {
                info!(attempt, "Logging in to broker");
                match timeout(login_timeout, self.broker.login(&self.credentials)).await {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::Timeout(login_timeout.as_millis() as u64)),
                }
            })
            .await;

        match result {
            Ok(grant) => {
                let now = Instant::now();
                info!(ttl_secs = grant.ttl.as_secs(), "Broker session established");
                Ok(Session {
                    token: grant.token,
                    issued_at: now,
                    expires_at: now + grant.ttl,
                })
            }
            Err(failure) => {
                error!(
                    attempts = failure.attempts,
                    error = %failure.error,
                    cooldown_secs = self.policy.cooldown.as_secs(),
                    "Broker login failed, cooling down"
                );
                Err(match failure.error {
                    BrokerError::Unauthorized(msg) | BrokerError::Rejected(msg) => {
                        AuthError::InvalidCredentials(msg)
                    }
                    _ => AuthError::SessionDown,
                })
            }
        }
    }
}

/// Owner of the process-wide brokerage session
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        broker: Arc<dyn BrokerageClient>,
        credentials: Credentials,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                credentials,
                policy,
                state: Mutex::new(SessionState::Absent),
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &*self.inner.lock() {
            SessionState::Absent => SessionPhase::Absent,
            SessionState::Live(_) => SessionPhase::Live,
            SessionState::Refreshing(_) => SessionPhase::Refreshing,
            SessionState::CoolingDown { .. } => SessionPhase::CoolingDown,
        }
    }

    /// Current live session, if any
    pub fn session(&self) -> Option<Session> {
        match &*self.inner.lock() {
            SessionState::Live(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Return a token valid beyond the safety margin, refreshing at most once
    /// across all concurrent callers. `deadline` bounds only this caller's wait.
    pub async fn get_valid_token(&self, deadline: Instant) -> Result<AccessToken, AuthError> {
        let flight = {
            let mut state = self.inner.lock();
            let now = Instant::now();
            let margin = self.inner.policy.safety_margin;

            let step = match &*state {
                SessionState::Live(session) if session.is_usable_at(now, margin) => {
                    Step::Ready(Ok(session.token.clone()))
                }
                SessionState::Refreshing(flight) if flight.peek().is_none() => {
                    Step::Join(flight.clone())
                }
                SessionState::CoolingDown { until } if now < *until => {
                    Step::Ready(Err(AuthError::SessionDown))
                }
                _ => Step::Start,
            };

            match step {
                Step::Ready(result) => return result,
                Step::Join(flight) => flight,
                Step::Start => self.start_refresh(&mut state),
            }
        };

        Self::wait(flight, deadline).await
    }

    /// Replace a token the broker refused.
    ///
    /// Only refreshes if the session still holds `stale`, so a burst of
    /// callers hit by the same expiry share one login.
    pub async fn force_refresh(
        &self,
        stale: Option<&AccessToken>,
        deadline: Instant,
    ) -> Result<AccessToken, AuthError> {
        let flight = {
            let mut state = self.inner.lock();
            let now = Instant::now();
            let margin = self.inner.policy.safety_margin;

            let step = match &*state {
                SessionState::Refreshing(flight) if flight.peek().is_none() => {
                    Step::Join(flight.clone())
                }
                SessionState::CoolingDown { until } if now < *until => {
                    Step::Ready(Err(AuthError::SessionDown))
                }
                SessionState::Live(session)
                    if stale != Some(&session.token) && session.is_usable_at(now, margin) =>
                {
                    Step::Ready(Ok(session.token.clone()))
                }
                _ => Step::Start,
            };

            match step {
                Step::Ready(result) => return result,
                Step::Join(flight) => flight,
                Step::Start => {
                    warn!("Forcing broker session refresh");
                    self.start_refresh(&mut state)
                }
            }
        };

        Self::wait(flight, deadline).await
    }

    /// Caller must hold the state lock
    fn start_refresh(&self, state: &mut SessionState) -> RefreshFlight {
        info!("Starting broker session refresh");

        let task = tokio::spawn(Arc::clone(&self.inner).refresh());
        let flight = async move {
            task.await.unwrap_or_else(|e| {
                error!(error = %e, "Session refresh task failed");
                Err(AuthError::SessionDown)
            })
        }
        .boxed()
        .shared();

        *state = SessionState::Refreshing(flight.clone());
        flight
    }

    async fn wait(flight: RefreshFlight, deadline: Instant) -> Result<AccessToken, AuthError> {
        match timeout_at(deadline, flight).await {
            Ok(Ok(session)) => Ok(session.token),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Timed out waiting for broker session refresh");
                Err(AuthError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use tokio_test::{assert_err, assert_ok};

    fn broker(ttl: Duration) -> Arc<PaperBroker> {
        Arc::new(PaperBroker::new(ttl, Duration::ZERO))
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            safety_margin: Duration::from_secs(5),
            login_timeout: Duration::from_secs(1),
            cooldown: Duration::from_secs(60),
            login_retry: RetryPolicy::immediate(3),
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let broker = broker(Duration::from_secs(3600));
        broker.set_login_delay(Duration::from_millis(50));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_valid_token(soon()).await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(broker.login_calls(), 1);
        assert!(tokens.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(manager.phase(), SessionPhase::Live);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh_of_expiring_session() {
        // ttl inside the 5s margin: the live session is already due for refresh
        let broker = broker(Duration::from_secs(1));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());
        let expiring = manager.get_valid_token(soon()).await.unwrap();
        assert_eq!(manager.phase(), SessionPhase::Live);

        broker.set_login_delay(Duration::from_millis(50));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_valid_token(soon()).await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(broker.login_calls(), 2);
        assert!(tokens.iter().all(|t| *t == tokens[0]));
        assert_ne!(tokens[0], expiring);
    }

    #[tokio::test]
    async fn test_fresh_token_reused() {
        let broker = broker(Duration::from_secs(3600));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());

        let first = assert_ok!(manager.get_valid_token(soon()).await);
        let second = assert_ok!(manager.get_valid_token(soon()).await);

        assert_eq!(first, second);
        assert_eq!(broker.login_calls(), 1);
        assert!(manager.session().is_some());
    }

    #[tokio::test]
    async fn test_token_inside_safety_margin_is_refreshed() {
        // ttl shorter than the 5s margin: every call sees an expiring session
        let broker = broker(Duration::from_secs(1));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());

        let first = manager.get_valid_token(soon()).await.unwrap();
        let second = manager.get_valid_token(soon()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(broker.login_calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_login_enters_cooldown() {
        let broker = broker(Duration::from_secs(3600));
        broker.fail_logins((0..3).map(|_| BrokerError::Transport("connection refused".into())));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());

        assert_eq!(manager.get_valid_token(soon()).await, Err(AuthError::SessionDown));
        assert_eq!(broker.login_calls(), 3);
        assert_eq!(manager.phase(), SessionPhase::CoolingDown);

        // Refused without touching the broker
        assert_eq!(manager.get_valid_token(soon()).await, Err(AuthError::SessionDown));
        assert_eq!(
            manager.force_refresh(None, soon()).await,
            Err(AuthError::SessionDown)
        );
        assert_eq!(broker.login_calls(), 3);
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let broker = broker(Duration::from_secs(3600));
        broker.fail_logins([BrokerError::Timeout(10)]);
        let policy = SessionPolicy {
            cooldown: Duration::from_millis(50),
            login_retry: RetryPolicy::immediate(1),
            ..policy()
        };
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy);

        assert_err!(manager.get_valid_token(soon()).await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_ok!(manager.get_valid_token(soon()).await);
        assert_eq!(broker.login_calls(), 2);
    }

    #[tokio::test]
    async fn test_deadline_does_not_cancel_refresh() {
        let broker = broker(Duration::from_secs(3600));
        broker.set_login_delay(Duration::from_millis(200));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());

        let impatient = manager
            .get_valid_token(Instant::now() + Duration::from_millis(20))
            .await;
        assert_eq!(impatient, Err(AuthError::Timeout));
        assert_eq!(manager.phase(), SessionPhase::Refreshing);

        let patient = manager.get_valid_token(soon()).await;
        assert!(patient.is_ok());
        assert_eq!(broker.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_collapses_on_stale_token() {
        let broker = broker(Duration::from_secs(3600));
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());
        let stale = manager.get_valid_token(soon()).await.unwrap();

        let (a, b) = tokio::join!(
            manager.force_refresh(Some(&stale), soon()),
            manager.force_refresh(Some(&stale), soon())
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a, stale);
        assert_eq!(a, b);
        assert_eq!(broker.login_calls(), 2);

        // Already replaced: a late caller with the old token gets the new one
        let late = manager.force_refresh(Some(&stale), soon()).await.unwrap();
        assert_eq!(late, a);
        assert_eq!(broker.login_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_credentials_not_retried() {
        let broker = broker(Duration::from_secs(3600));
        broker.fail_logins([BrokerError::Unauthorized("bad totp".into())]);
        let manager = SessionManager::new(broker.clone(), Credentials::default(), policy());

        let result = manager.get_valid_token(soon()).await;
        assert_eq!(result, Err(AuthError::InvalidCredentials("bad totp".into())));
        assert_eq!(broker.login_calls(), 1);
    }
}
