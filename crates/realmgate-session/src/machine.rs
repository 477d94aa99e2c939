//! The session state machine.
//!
//! A [`SessionMachine`] owns one logical session and drives it through the
//! authentication lifecycle:
//!
//! ```text
//! Unauthenticated ──submit_login──▶ Authenticating ──ok──▶ Authenticated
//!        ▲                               │                   │    ▲
//!        └────────────failure────────────┘             refresh   ok
//!        ▲                                                   ▼    │
//!        └──────────────failure / logout──────────────── Refreshing
//! ```
//!
//! State lives behind a `parking_lot` mutex that is never held across an
//! `.await`. Transitions that call the gateway are serialized by an async
//! gate, and every committed token change bumps a generation counter. A
//! refresh caller that observed an older generation than the current one
//! returns the outcome of the refresh that already happened instead of
//! calling the provider again.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use realmgate_oauth::{
    AuthError, Credentials, Profile, Result, SharedGateway, SharedTokenStore, StoredTokens,
    TokenSet,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::state::{Session, SessionState, StateChange};
use crate::subscribers::{Subscribers, SubscriptionId};

/// Tokens and profile produced by a successful login or restore.
type Established = (TokenSet, DateTime<Utc>, Profile);

// ============================================================================
// Inner state
// ============================================================================

#[derive(Debug)]
struct Inner {
    state: SessionState,
    tokens: Option<TokenSet>,
    expires_at: Option<DateTime<Utc>>,
    profile: Option<Profile>,
    last_error: Option<AuthError>,
    session_id: Option<Uuid>,
    remember: bool,
    generation: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            tokens: None,
            expires_at: None,
            profile: None,
            last_error: None,
            session_id: None,
            remember: false,
            generation: 0,
        }
    }

    fn snapshot(&self) -> Session {
        let tokens = self.tokens.as_ref();
        Session {
            session_id: self.session_id,
            state: self.state.clone(),
            access_token: tokens.map(|t| t.access_token.clone()),
            refresh_token: tokens.and_then(|t| t.refresh_token.clone()),
            id_token: tokens.and_then(|t| t.id_token.clone()),
            expires_at: self.expires_at,
            profile: self.profile.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at.is_none_or(|exp| now + window >= exp)
    }

    /// Result seen by a caller whose refresh was served by another caller.
    fn outcome(&self) -> Result<()> {
        if self.state == SessionState::Authenticated {
            Ok(())
        } else {
            Err(self.last_error.clone().unwrap_or(AuthError::NotAuthenticated))
        }
    }

    fn establish(&mut self, session_id: Uuid, established: Established, remember: bool) {
        let (tokens, issued_at, profile) = established;
        self.expires_at = Some(tokens.expires_at(issued_at));
        self.tokens = Some(tokens);
        self.profile = Some(profile);
        self.last_error = None;
        self.session_id = Some(session_id);
        self.remember = remember;
        self.state = SessionState::Authenticated;
        self.generation += 1;
    }

    fn replace_tokens(&mut self, tokens: TokenSet, issued_at: DateTime<Utc>) {
        self.expires_at = Some(tokens.expires_at(issued_at));
        self.tokens = Some(tokens);
        self.last_error = None;
        self.state = SessionState::Authenticated;
        self.generation += 1;
    }

    fn clear(&mut self, next: SessionState, error: Option<AuthError>) {
        self.state = next;
        self.tokens = None;
        self.expires_at = None;
        self.profile = None;
        self.session_id = None;
        self.remember = false;
        self.last_error = error;
        self.generation += 1;
    }
}

/// State a failed login or refresh lands in.
fn failure_state(error: &AuthError) -> SessionState {
    match error {
        AuthError::Config(_) | AuthError::InvalidResponse(_) => {
            SessionState::Failed(error.to_string())
        }
        _ => SessionState::Unauthenticated,
    }
}

// ============================================================================
// Cancellation guard
// ============================================================================

/// Puts the pre-call state back if a transition's future is dropped before
/// it commits. Committing any outcome bumps the generation, which disarms
/// the guard.
struct Pending<'a> {
    machine: &'a SessionMachine,
    generation: u64,
    previous: Option<SessionState>,
}

impl<'a> Pending<'a> {
    fn new(machine: &'a SessionMachine, generation: u64, previous: SessionState) -> Self {
        Self {
            machine,
            generation,
            previous: Some(previous),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let restored = self
                .machine
                .apply_at(self.generation, |inner| inner.state = previous);
            if restored {
                debug!("Transition cancelled, previous state restored");
            }
        }
    }
}

// ============================================================================
// SessionMachine
// ============================================================================

/// Authentication session driven through an injected [`AuthGateway`](realmgate_oauth::AuthGateway).
pub struct SessionMachine {
    gateway: SharedGateway,
    store: Option<SharedTokenStore>,
    config: SessionConfig,
    inner: Mutex<Inner>,
    gate: tokio::sync::Mutex<()>,
    /// Serializes token store writes and deletes.
    store_lock: tokio::sync::Mutex<()>,
    subscribers: Subscribers,
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("session", &self.snapshot())
            .field("subscribers", &self.subscribers)
            .finish_non_exhaustive()
    }
}

impl SessionMachine {
    /// Create an unauthenticated session.
    pub fn new(gateway: SharedGateway, config: SessionConfig) -> Self {
        Self {
            gateway,
            store: None,
            config,
            inner: Mutex::new(Inner::new()),
            gate: tokio::sync::Mutex::new(()),
            store_lock: tokio::sync::Mutex::new(()),
            subscribers: Subscribers::default(),
        }
    }

    /// Attach a durable token store.
    pub fn with_token_store(mut self, store: SharedTokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current session snapshot.
    pub fn snapshot(&self) -> Session {
        self.inner.lock().snapshot()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Register a listener for committed state transitions.
    ///
    /// Listeners run synchronously on the task that committed the
    /// transition, in registration order, after the state lock is released.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.subscribers.add(std::sync::Arc::new(listener))
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Log in with `credentials`.
    ///
    /// A login submitted while already authenticated is a no-op and returns
    /// the current profile.
    pub async fn submit_login(&self, credentials: &Credentials) -> Result<Profile> {
        let _gate = self.gate.lock().await;

        let started = self.apply(|inner| {
            if inner.state == SessionState::Authenticated {
                return None;
            }
            let previous = std::mem::replace(&mut inner.state, SessionState::Authenticating);
            Some((inner.generation, previous))
        });
        let Some((generation, previous)) = started else {
            debug!("Login submitted while authenticated, ignoring");
            return self
                .inner
                .lock()
                .profile
                .clone()
                .ok_or(AuthError::NotAuthenticated);
        };
        let _pending = Pending::new(self, generation, previous);

        info!(remember_me = credentials.remember_me, "Submitting login");
        let outcome = async {
            let tokens = self.call("login", self.gateway.login(credentials)).await?;
            let issued_at = Utc::now();
            let profile = self
                .call("fetch_profile", self.gateway.fetch_profile(&tokens.access_token))
                .await?;
            Ok::<_, AuthError>((tokens, issued_at, profile))
        }
        .await;

        self.settle(generation, outcome, credentials.remember_me)
            .await
    }

    /// Refresh the access token.
    ///
    /// Concurrent calls are coalesced: callers that were waiting while
    /// another refresh ran share its outcome.
    pub async fn refresh(&self) -> Result<()> {
        let observed = self.inner.lock().generation;
        self.refresh_from(observed).await
    }

    /// Refresh if the access token expires within the configured leeway.
    pub async fn ensure_fresh(&self) -> Result<()> {
        self.valid_access_token(self.config.refresh_leeway)
            .await
            .map(|_| ())
    }

    /// An access token valid for at least `min_validity`, refreshing first
    /// if needed.
    pub async fn valid_access_token(&self, min_validity: Duration) -> Result<String> {
        let observed = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.tokens) {
                (SessionState::Authenticated, Some(tokens))
                    if !inner.expires_within(min_validity, Utc::now()) =>
                {
                    return Ok(tokens.access_token.clone());
                }
                (SessionState::Authenticated | SessionState::Refreshing, _) => inner.generation,
                _ => return Err(AuthError::NotAuthenticated),
            }
        };

        self.refresh_from(observed).await?;

        self.inner
            .lock()
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or(AuthError::NotAuthenticated)
    }

    /// End the session.
    ///
    /// The local session is always cleared first. The returned result only
    /// reports whether the provider was notified.
    pub async fn logout(&self) -> Result<()> {
        let tokens = self.apply(|inner| {
            let tokens = inner.tokens.take();
            if tokens.is_some() || inner.state != SessionState::Unauthenticated {
                inner.clear(SessionState::Unauthenticated, None);
            }
            tokens
        });

        self.forget_stored().await;

        let Some(tokens) = tokens else {
            debug!("Logout without an active session");
            return Ok(());
        };

        info!("Logged out");
        self.call("logout", self.gateway.logout(&tokens))
            .await
            .inspect_err(|e| warn!(error = %e, "Provider logout failed, local session cleared"))
    }

    /// Rebuild the session from the token store.
    ///
    /// Returns `Ok(None)` when there is no stored session to resume.
    pub async fn restore(&self) -> Result<Option<Profile>> {
        let Some(store) = self.store.clone() else {
            return Ok(None);
        };
        let _gate = self.gate.lock().await;

        {
            let inner = self.inner.lock();
            if inner.state == SessionState::Authenticated {
                return Ok(inner.profile.clone());
            }
        }

        let Some(stored) = store.load_tokens().await? else {
            debug!("No stored session");
            return Ok(None);
        };

        let now = Utc::now();
        let access_usable = !stored.is_expired(self.config.refresh_leeway, now);
        if !access_usable && stored.refresh_expired(now) {
            info!("Stored session has expired");
            self.forget_stored().await;
            return Ok(None);
        }

        let (generation, previous) = self.apply(|inner| {
            let previous = std::mem::replace(&mut inner.state, SessionState::Authenticating);
            (inner.generation, previous)
        });
        let _pending = Pending::new(self, generation, previous);

        debug!(access_usable, "Restoring stored session");
        let outcome = async {
            let (tokens, issued_at) = if access_usable {
                (stored.to_token_set(now), now)
            } else {
                let refresh_token = stored.refresh_token.as_deref().ok_or_else(|| {
                    AuthError::RefreshExpired("stored session has no refresh token".into())
                })?;
                self.refresh_with_retry(refresh_token).await?
            };
            let profile = self
                .call("fetch_profile", self.gateway.fetch_profile(&tokens.access_token))
                .await?;
            Ok::<_, AuthError>((tokens, issued_at, profile))
        }
        .await;

        self.settle(generation, outcome, true).await.map(Some)
    }

    /// Re-fetch the profile for the current session.
    pub async fn reload_profile(&self) -> Result<Profile> {
        let (session_id, access_token) = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.tokens) {
                (SessionState::Authenticated, Some(tokens)) => {
                    (inner.session_id, tokens.access_token.clone())
                }
                _ => return Err(AuthError::NotAuthenticated),
            }
        };

        let profile = self
            .call("fetch_profile", self.gateway.fetch_profile(&access_token))
            .await?;

        let updated = self.apply(|inner| {
            if inner.session_id != session_id || !inner.state.holds_tokens() {
                return false;
            }
            inner.profile = Some(profile.clone());
            true
        });
        if !updated {
            return Err(AuthError::Cancelled);
        }
        Ok(profile)
    }

    /// Move to `Failed` after an unrecoverable error reported by the host.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Session failed");
        self.apply(|inner| inner.clear(SessionState::Failed(reason), None));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    async fn refresh_from(&self, observed: u64) -> Result<()> {
        let _gate = self.gate.lock().await;

        let started = self.apply(|inner| {
            if inner.generation != observed {
                return inner.outcome().map(|()| None);
            }
            if inner.state != SessionState::Authenticated {
                return Err(AuthError::NotAuthenticated);
            }
            match inner.tokens.as_ref().and_then(|t| t.refresh_token.clone()) {
                Some(refresh_token) => {
                    inner.state = SessionState::Refreshing;
                    Ok(Some((inner.generation, inner.remember, refresh_token)))
                }
                None => {
                    let error = AuthError::RefreshExpired("no refresh token".into());
                    inner.clear(SessionState::Unauthenticated, Some(error.clone()));
                    Err(error)
                }
            }
        })?;
        let Some((generation, remember, refresh_token)) = started else {
            debug!("Refresh already completed by a concurrent caller");
            return Ok(());
        };
        let _pending = Pending::new(self, generation, SessionState::Authenticated);

        match self.refresh_with_retry(&refresh_token).await {
            Ok((tokens, issued_at)) => {
                let expires_in = tokens.expires_in;
                let persisted = tokens.clone();
                if !self.apply_at(generation, |inner| inner.replace_tokens(tokens, issued_at)) {
                    return Err(AuthError::Cancelled);
                }
                info!(expires_in, "Access token refreshed");
                if remember && self.config.persist_tokens {
                    // The commit above bumped the generation once
                    self.persist(generation + 1, &persisted, issued_at).await;
                }
                Ok(())
            }
            Err(error) => {
                self.apply_at(generation, |inner| {
                    inner.clear(failure_state(&error), Some(error.clone()))
                });
                warn!(error = %error, "Token refresh failed, login required");
                if error.requires_login() {
                    self.forget_stored().await;
                }
                Err(error)
            }
        }
    }

    async fn refresh_with_retry(&self, refresh_token: &str) -> Result<(TokenSet, DateTime<Utc>)> {
        let policy = &self.config.retry;
        let mut retry = 0;
        loop {
            match self.call("refresh", self.gateway.refresh(refresh_token)).await {
                Ok(tokens) => return Ok((tokens, Utc::now())),
                Err(error) if error.is_transient() && retry < policy.max_retries => {
                    retry += 1;
                    let delay = policy.delay_for(retry);
                    warn!(
                        attempt = retry,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Commit the outcome of a login or restore started at `generation`.
    async fn settle(
        &self,
        generation: u64,
        outcome: Result<Established>,
        remember: bool,
    ) -> Result<Profile> {
        match outcome {
            Ok(established) => {
                let session_id = Uuid::new_v4();
                let (tokens, issued_at) = (established.0.clone(), established.1);
                let profile = established.2.clone();

                if !self.apply_at(generation, |inner| {
                    inner.establish(session_id, established, remember)
                }) {
                    debug!("Session changed while logging in, discarding tokens");
                    return Err(AuthError::Cancelled);
                }
                info!(
                    session_id = %session_id,
                    subject = %profile.subject,
                    roles = profile.roles.len(),
                    "Authenticated"
                );

                if remember && self.config.persist_tokens {
                    // The commit above bumped the generation once
                    self.persist(generation + 1, &tokens, issued_at).await;
                } else {
                    self.forget_stored().await;
                }
                Ok(profile)
            }
            Err(error) => {
                self.apply_at(generation, |inner| {
                    inner.clear(failure_state(&error), Some(error.clone()))
                });
                warn!(error = %error, "Login failed");
                if error.requires_login() {
                    self.forget_stored().await;
                }
                Err(error)
            }
        }
    }

    /// Run a gateway call under the configured timeout.
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.gateway_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Gateway call timed out"
                );
                Err(AuthError::Timeout(timeout))
            }
        }
    }

    /// Save tokens committed at `generation`, unless the session has moved
    /// on since. The check and the write happen under the store lock, so a
    /// later delete always lands after the write.
    async fn persist(&self, generation: u64, tokens: &TokenSet, issued_at: DateTime<Utc>) {
        if let Some(store) = &self.store {
            let _store = self.store_lock.lock().await;
            if self.inner.lock().generation != generation {
                debug!("Session changed before tokens were saved, skipping");
                return;
            }
            let stored = StoredTokens::from_token_set(tokens, issued_at);
            if let Err(e) = store.save_tokens(&stored).await {
                warn!(error = %e, "Failed to persist tokens");
            }
        }
    }

    async fn forget_stored(&self) {
        if let Some(store) = &self.store {
            let _store = self.store_lock.lock().await;
            if let Err(e) = store.delete_tokens().await {
                warn!(error = %e, "Failed to delete stored tokens");
            }
        }
    }

    /// Mutate the state and notify subscribers if it changed.
    fn apply<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (result, change) = {
            let mut inner = self.inner.lock();
            let from = inner.state.clone();
            let result = f(&mut inner);
            let change = (from != inner.state).then(|| StateChange {
                from,
                to: inner.state.clone(),
                session: inner.snapshot(),
            });
            (result, change)
        };

        if let Some(change) = change {
            debug!(from = %change.from, to = %change.to, "Session state changed");
            self.subscribers.notify(&change);
        }
        result
    }

    /// Like [`apply`](Self::apply), but only if nothing replaced the session
    /// since `generation` was observed.
    fn apply_at(&self, generation: u64, f: impl FnOnce(&mut Inner)) -> bool {
        self.apply(|inner| {
            if inner.generation != generation {
                return false;
            }
            f(inner);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use async_trait::async_trait;
    use realmgate_oauth::{AuthGateway, Grant, InMemoryTokenStore, TokenStore};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Scripted gateway: password "secret" is accepted, user "unreachable"
    /// fails with a network error.
    pub(super) struct MockGateway {
        pub login_calls: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        pub logout_calls: AtomicUsize,
        pub profile_calls: AtomicUsize,
        pub login_expires_in: AtomicU64,
        pub delay: Mutex<Duration>,
        pub refresh_script: Mutex<VecDeque<Result<TokenSet>>>,
        pub profile_error: Mutex<Option<AuthError>>,
        pub roles: Vec<String>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                login_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                logout_calls: AtomicUsize::new(0),
                profile_calls: AtomicUsize::new(0),
                login_expires_in: AtomicU64::new(300),
                delay: Mutex::new(Duration::ZERO),
                refresh_script: Mutex::new(VecDeque::new()),
                profile_error: Mutex::new(None),
                roles: vec!["user".to_string(), "manager".to_string()],
            }
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = delay;
        }

        pub fn script_refresh(&self, result: Result<TokenSet>) {
            self.refresh_script.lock().push_back(result);
        }

        async fn pause(&self) {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl AuthGateway for MockGateway {
        async fn login(&self, credentials: &Credentials) -> Result<TokenSet> {
            let n = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.pause().await;
            let expires_in = self.login_expires_in.load(Ordering::SeqCst);
            match &credentials.grant {
                Grant::Password { username, .. } if username == "unreachable" => {
                    Err(AuthError::Network("connection refused".into()))
                }
                Grant::Password { password, .. } if password != "secret" => Err(
                    AuthError::InvalidCredentials("Invalid user credentials".into()),
                ),
                _ => Ok(TokenSet::new(format!("access-{}", n), expires_in)
                    .with_refresh_token(format!("refresh-{}", n))),
            }
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
            assert!(!refresh_token.is_empty());
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            self.refresh_script.lock().pop_front().unwrap_or_else(|| {
                Ok(TokenSet::new("refreshed", 3600).with_refresh_token("refresh-rotated"))
            })
        }

        async fn logout(&self, _tokens: &TokenSet) -> Result<()> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_profile(&self, _access_token: &str) -> Result<Profile> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.profile_error.lock().clone() {
                return Err(error);
            }
            Ok(Profile::new("user-1").with_roles(self.roles.clone()))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(Duration::from_secs(2))
            .with_retry(RetryPolicy::default().with_base_delay(Duration::from_millis(1)))
    }

    fn setup() -> (Arc<MockGateway>, SessionMachine) {
        let gateway = Arc::new(MockGateway::new());
        let machine = SessionMachine::new(gateway.clone(), config());
        (gateway, machine)
    }

    fn valid() -> Credentials {
        Credentials::password("alice", "secret")
    }

    fn record_transitions(machine: &SessionMachine) -> Arc<Mutex<Vec<(SessionState, SessionState)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        machine.subscribe(move |change| sink.lock().push((change.from.clone(), change.to.clone())));
        seen
    }

    // ─────────────────────────────────────────────────────────────────────
    // Login
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_login_success() {
        let (_, machine) = setup();

        let profile = machine.submit_login(&valid()).await.unwrap();
        assert_eq!(profile.subject, "user-1");

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Authenticated);
        assert_eq!(session.access_token.as_deref(), Some("access-1"));
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
        assert!(session.session_id.is_some());
        assert!(session.last_error.is_none());
        assert!(session.profile.is_some());
        assert!(!session.is_expired_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_login_invalid_credentials() {
        let (_, machine) = setup();

        let err = machine
            .submit_login(&Credentials::password("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.access_token.is_none());
        assert!(session.profile.is_none());
        assert!(matches!(
            session.last_error,
            Some(AuthError::InvalidCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_login_network_error() {
        let (gateway, machine) = setup();

        let err = machine
            .submit_login(&Credentials::password("unreachable", "secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
        assert_eq!(machine.state(), SessionState::Unauthenticated);
        // Logins are never retried
        assert_eq!(gateway.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_while_authenticated_is_noop() {
        let (gateway, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();
        let first = machine.snapshot();
        let seen = record_transitions(&machine);

        let profile = machine.submit_login(&valid()).await.unwrap();
        assert_eq!(profile.subject, "user-1");
        assert_eq!(gateway.login_calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.snapshot(), first);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_login_gateway_timeout() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_delay(Duration::from_millis(500));
        let machine = SessionMachine::new(
            gateway.clone(),
            SessionConfig::new(Duration::from_millis(20)),
        );

        let err = machine.submit_login(&valid()).await.unwrap_err();
        assert_eq!(err, AuthError::Timeout(Duration::from_millis(20)));

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert_eq!(session.last_error, Some(err));
    }

    #[tokio::test]
    async fn test_cancelled_login_leaves_state_unchanged() {
        let (gateway, machine) = setup();
        gateway.set_delay(Duration::from_millis(500));
        let seen = record_transitions(&machine);
        let before = machine.snapshot();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), machine.submit_login(&valid())).await;
        assert!(cancelled.is_err());

        assert_eq!(machine.snapshot(), before);
        assert_eq!(gateway.login_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock(),
            vec![
                (SessionState::Unauthenticated, SessionState::Authenticating),
                (SessionState::Authenticating, SessionState::Unauthenticated),
            ]
        );

        // The gate was released
        gateway.set_delay(Duration::ZERO);
        machine.submit_login(&valid()).await.unwrap();
        assert!(machine.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_unrecoverable_profile_error_fails() {
        let (gateway, machine) = setup();
        *gateway.profile_error.lock() = Some(AuthError::InvalidResponse("missing sub".into()));

        let err = machine.submit_login(&valid()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));

        let session = machine.snapshot();
        assert!(matches!(session.state, SessionState::Failed(_)));
        assert!(session.access_token.is_none());

        // A new login recovers from Failed
        *gateway.profile_error.lock() = None;
        machine.submit_login(&valid()).await.unwrap();
        assert!(machine.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_each_login_gets_new_session_id() {
        let (_, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();
        let first = machine.snapshot().session_id;
        machine.logout().await.unwrap();
        machine.submit_login(&valid()).await.unwrap();
        let second = machine.snapshot().session_id;
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_refresh_replaces_tokens() {
        let (gateway, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();
        let profile = machine.snapshot().profile;

        machine.refresh().await.unwrap();

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Authenticated);
        assert_eq!(session.access_token.as_deref(), Some("refreshed"));
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-rotated"));
        assert_eq!(session.profile, profile);
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_when_unauthenticated() {
        let (gateway, machine) = setup();
        assert_eq!(machine.refresh().await, Err(AuthError::NotAuthenticated));
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_call() {
        let (gateway, machine) = setup();
        gateway.login_expires_in.store(10, Ordering::SeqCst);
        machine.submit_login(&valid()).await.unwrap();
        gateway.set_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(machine.ensure_fresh(), machine.ensure_fresh());
        a.unwrap();
        b.unwrap();

        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.snapshot().access_token.as_deref(), Some("refreshed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_across_threads() {
        let gateway = Arc::new(MockGateway::new());
        gateway.login_expires_in.store(10, Ordering::SeqCst);
        let machine = Arc::new(SessionMachine::new(gateway.clone(), config()));
        machine.submit_login(&valid()).await.unwrap();
        gateway.set_delay(Duration::from_millis(50));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = machine.clone();
                tokio::spawn(async move {
                    machine.valid_access_token(Duration::from_secs(30)).await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "refreshed");
        }
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_retries_transient_errors() {
        let (gateway, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();
        gateway.script_refresh(Err(AuthError::Network("reset".into())));
        gateway.script_refresh(Err(AuthError::Timeout(Duration::from_secs(1))));

        machine.refresh().await.unwrap();
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 3);
        assert!(machine.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_gives_up_after_max_retries() {
        let (gateway, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();
        for _ in 0..4 {
            gateway.script_refresh(Err(AuthError::Network("down".into())));
        }

        let err = machine.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 4);

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.access_token.is_none());
        assert_eq!(session.last_error, Some(err));
    }

    #[tokio::test]
    async fn test_refresh_expired_clears_tokens() {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(InMemoryTokenStore::new());
        let machine =
            SessionMachine::new(gateway.clone(), config()).with_token_store(store.clone());
        machine.submit_login(&valid().remember(true)).await.unwrap();
        assert!(store.has_tokens());

        gateway.script_refresh(Err(AuthError::RefreshExpired("Token is not active".into())));
        let err = machine.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshExpired(_)));
        // Never retried
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.access_token.is_none());
        assert!(session.refresh_token.is_none());
        assert!(!store.has_tokens());
    }

    #[tokio::test]
    async fn test_cancelled_refresh_restores_authenticated() {
        let (gateway, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();
        let before = machine.snapshot();
        gateway.set_delay(Duration::from_millis(500));

        let cancelled = tokio::time::timeout(Duration::from_millis(20), machine.refresh()).await;
        assert!(cancelled.is_err());
        assert_eq!(machine.snapshot(), before);
    }

    #[tokio::test]
    async fn test_valid_access_token() {
        let (gateway, machine) = setup();
        assert_eq!(
            machine.valid_access_token(Duration::from_secs(5)).await,
            Err(AuthError::NotAuthenticated)
        );

        machine.submit_login(&valid()).await.unwrap();
        let token = machine
            .valid_access_token(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(token, "access-1");
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 0);

        // Asking for more validity than the token has left forces a refresh
        let token = machine
            .valid_access_token(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(token, "refreshed");
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Logout, fail, subscribers
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_logout() {
        let (gateway, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();

        machine.logout().await.unwrap();
        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.access_token.is_none());
        assert!(session.profile.is_none());
        assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 1);

        // Second logout does not reach the provider
        machine.logout().await.unwrap();
        assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_clears_tokens() {
        let (_, machine) = setup();
        machine.submit_login(&valid()).await.unwrap();

        machine.fail("clock skew too large");
        let session = machine.snapshot();
        assert_eq!(
            session.state,
            SessionState::Failed("clock skew too large".into())
        );
        assert!(session.access_token.is_none());
        assert_eq!(machine.refresh().await, Err(AuthError::NotAuthenticated));

        machine.logout().await.unwrap();
        assert_eq!(machine.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_subscribers_notified_in_order() {
        let (_, machine) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..2 {
            let sink = seen.clone();
            machine.subscribe(move |change| sink.lock().push((n, change.to.clone())));
        }

        machine.submit_login(&valid()).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (0, SessionState::Authenticating),
                (1, SessionState::Authenticating),
                (0, SessionState::Authenticated),
                (1, SessionState::Authenticated),
            ]
        );
    }

    #[tokio::test]
    async fn test_subscriber_sees_committed_snapshot() {
        let (_, machine) = setup();
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let id = machine.subscribe(move |change| sink.lock().push(change.session.clone()));

        machine.submit_login(&valid()).await.unwrap();
        {
            let snapshots = snapshots.lock();
            let last = snapshots.last().unwrap();
            assert!(last.is_authenticated());
            assert_eq!(last.access_token.as_deref(), Some("access-1"));
        }

        assert!(machine.unsubscribe(id));
        machine.logout().await.unwrap();
        assert_eq!(snapshots.lock().len(), 2);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    fn with_store() -> (Arc<MockGateway>, Arc<InMemoryTokenStore>, SessionMachine) {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(InMemoryTokenStore::new());
        let machine =
            SessionMachine::new(gateway.clone(), config()).with_token_store(store.clone());
        (gateway, store, machine)
    }

    #[tokio::test]
    async fn test_remember_me_persists_tokens() {
        let (_, store, machine) = with_store();

        machine.submit_login(&valid()).await.unwrap();
        assert!(!store.has_tokens());
        machine.logout().await.unwrap();

        machine.submit_login(&valid().remember(true)).await.unwrap();
        let stored = store.load_tokens().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-2");

        machine.logout().await.unwrap();
        assert!(!store.has_tokens());
    }

    #[tokio::test]
    async fn test_persistence_disabled() {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(InMemoryTokenStore::new());
        let machine = SessionMachine::new(gateway, config().with_persist_tokens(false))
            .with_token_store(store.clone());

        machine.submit_login(&valid().remember(true)).await.unwrap();
        assert!(!store.has_tokens());
    }

    #[tokio::test]
    async fn test_restore_without_store() {
        let (_, machine) = setup();
        assert_eq!(machine.restore().await.unwrap(), None);
        assert_eq!(machine.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_restore_valid_tokens() {
        let (gateway, store, machine) = with_store();
        let tokens = TokenSet::new("stored-access", 300).with_refresh_token("stored-refresh");
        store
            .save_tokens(&StoredTokens::from_token_set(&tokens, Utc::now()))
            .await
            .unwrap();

        let profile = machine.restore().await.unwrap().unwrap();
        assert_eq!(profile.subject, "user-1");

        let session = machine.snapshot();
        assert!(session.is_authenticated());
        assert_eq!(session.access_token.as_deref(), Some("stored-access"));
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restore_expired_tokens_refreshes() {
        let (gateway, store, machine) = with_store();
        let tokens = TokenSet::new("stale", 300).with_refresh_token("stored-refresh");
        let issued = Utc::now() - chrono::Duration::seconds(400);
        store
            .save_tokens(&StoredTokens::from_token_set(&tokens, issued))
            .await
            .unwrap();

        machine.restore().await.unwrap().unwrap();
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.snapshot().access_token.as_deref(), Some("refreshed"));

        // The refreshed tokens replace the stale copy
        let stored = store.load_tokens().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "refreshed");
    }

    #[tokio::test]
    async fn test_restore_dead_session_is_discarded() {
        let (gateway, store, machine) = with_store();
        let tokens = TokenSet::new("stale", 60);
        let issued = Utc::now() - chrono::Duration::seconds(600);
        store
            .save_tokens(&StoredTokens::from_token_set(&tokens, issued))
            .await
            .unwrap();

        assert_eq!(machine.restore().await.unwrap(), None);
        assert!(!store.has_tokens());
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(machine.state(), SessionState::Unauthenticated);
    }

    /// Store whose writes take a while to land.
    #[derive(Debug, Default)]
    struct SlowStore {
        inner: InMemoryTokenStore,
    }

    #[async_trait]
    impl TokenStore for SlowStore {
        fn has_tokens(&self) -> bool {
            self.inner.has_tokens()
        }

        async fn save_tokens(&self, tokens: &StoredTokens) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.save_tokens(tokens).await
        }

        async fn load_tokens(&self) -> Result<Option<StoredTokens>> {
            self.inner.load_tokens().await
        }

        async fn delete_tokens(&self) -> Result<()> {
            self.inner.delete_tokens().await
        }
    }

    async fn wait_for_state(machine: &SessionMachine, state: SessionState) {
        for _ in 0..1000 {
            if machine.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("session never reached {}", state);
    }

    #[tokio::test]
    async fn test_logout_wins_over_pending_save() {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(SlowStore::default());
        let machine =
            SessionMachine::new(gateway.clone(), config()).with_token_store(store.clone());

        let credentials = valid().remember(true);
        let (login, logout) = tokio::join!(machine.submit_login(&credentials), async {
            wait_for_state(&machine, SessionState::Authenticated).await;
            machine.logout().await
        });
        login.unwrap();
        logout.unwrap();

        assert_eq!(machine.state(), SessionState::Unauthenticated);
        assert!(!store.has_tokens());
        assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 1);

        // Nothing left to resume
        assert_eq!(machine.restore().await.unwrap(), None);
        assert_eq!(machine.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_logout_during_login_cancels_it() {
        let (gateway, store, machine) = with_store();
        gateway.set_delay(Duration::from_millis(50));

        let credentials = valid().remember(true);
        let (login, logout) = tokio::join!(machine.submit_login(&credentials), async {
            wait_for_state(&machine, SessionState::Authenticating).await;
            machine.logout().await
        });
        assert_eq!(login, Err(AuthError::Cancelled));
        logout.unwrap();

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.access_token.is_none());
        assert!(session.last_error.is_none());
        assert!(!store.has_tokens());
        assert_eq!(gateway.login_calls.load(Ordering::SeqCst), 1);
        // No tokens were held yet, so the provider is not told
        assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 0);

        // The gate was released
        gateway.set_delay(Duration::ZERO);
        machine.submit_login(&valid()).await.unwrap();
        assert!(machine.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_during_refresh_cancels_it() {
        let (gateway, store, machine) = with_store();
        machine.submit_login(&valid().remember(true)).await.unwrap();
        assert!(store.has_tokens());
        gateway.set_delay(Duration::from_millis(50));

        let (refresh, logout) = tokio::join!(machine.refresh(), async {
            wait_for_state(&machine, SessionState::Refreshing).await;
            machine.logout().await
        });
        assert_eq!(refresh, Err(AuthError::Cancelled));
        logout.unwrap();

        let session = machine.snapshot();
        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.access_token.is_none());
        assert!(session.refresh_token.is_none());
        assert!(!store.has_tokens());
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logout_during_restore_cancels_it() {
        let (gateway, store, machine) = with_store();
        let tokens = TokenSet::new("stale", 300).with_refresh_token("stored-refresh");
        let issued = Utc::now() - chrono::Duration::seconds(400);
        store
            .save_tokens(&StoredTokens::from_token_set(&tokens, issued))
            .await
            .unwrap();
        gateway.set_delay(Duration::from_millis(50));

        let (restored, logout) = tokio::join!(machine.restore(), async {
            wait_for_state(&machine, SessionState::Authenticating).await;
            machine.logout().await
        });
        assert_eq!(restored, Err(AuthError::Cancelled));
        logout.unwrap();

        assert_eq!(machine.state(), SessionState::Unauthenticated);
        assert!(machine.snapshot().access_token.is_none());
        assert!(!store.has_tokens());
        assert_eq!(gateway.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload_profile() {
        let (gateway, machine) = setup();
        assert_eq!(
            machine.reload_profile().await,
            Err(AuthError::NotAuthenticated)
        );

        machine.submit_login(&valid()).await.unwrap();
        machine.reload_profile().await.unwrap();
        assert_eq!(gateway.profile_calls.load(Ordering::SeqCst), 2);
        assert!(machine.snapshot().is_authenticated());
    }
}
