use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::flight::SingleFlight;
use crate::{
    AuthFailure, AuthNotifier, ClientIdentity, ErrorKind, IdentityProvider, NoopNotifier,
    OAuthProvider, Scheduler, SessionConfig,
};

type AuthOutcome = Result<Credentials, AuthFailure>;

/// OAuth credentials of one user.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds, counted from `refreshed_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
            ..Self::default()
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let refreshed_at = self.refreshed_at?;
        let lifetime = chrono::Duration::try_seconds(self.expires_in?)?;
        refreshed_at.checked_add_signed(lifetime)
    }

    /// True when the expiry is known and has passed. Unknown expiry counts as valid.
    pub fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|expires_at| expires_at <= Utc::now())
    }

    fn wipe_tokens(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.expires_in = None;
        self.refreshed_at = None;
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("refreshed_at", &self.refreshed_at)
            .field("base_domain", &self.base_domain)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Public shared-link access, sent in the `BoxApi` header.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedLink {
    pub url: String,
    pub password: Option<String>,
}

impl SharedLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub(crate) fn header_value(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "shared_link={}&shared_link_password={password}",
                self.url
            ),
            None => format!("shared_link={}", self.url),
        }
    }
}

impl fmt::Debug for SharedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLink")
            .field("url", &self.url)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Observer of credential lifecycle events.
pub trait AuthListener: Send + Sync {
    fn on_auth_created(&self, _credentials: &Credentials) {}
    fn on_refreshed(&self, _credentials: &Credentials) {}
    fn on_auth_failure(&self, _failure: &AuthFailure) {}
    fn on_logged_out(&self) {}
}

/// Identity of an in-flight credential refresh: the refresh token being exchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlightKey(String);

/// Identity of an in-flight interactive login.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey(u64);

/// Credentials of one user plus everything needed to renew them.
///
/// The credential fields are only written by refresh, login and logout, under
/// one lock. Refreshes and logins are single-flight: concurrent callers await
/// the one operation already running.
pub struct Session {
    client: ClientIdentity,
    credentials: RwLock<Credentials>,
    user_agent: Option<String>,
    shared_link: Option<SharedLink>,
    suppress_auth_error_ui: bool,
    listeners: RwLock<Vec<Arc<dyn AuthListener>>>,
    provider: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn AuthNotifier>,
    scheduler: Scheduler,
    refreshes: SingleFlight<FlightKey, AuthOutcome>,
    logins: SingleFlight<TaskKey, AuthOutcome>,
    last_login: Mutex<Option<TaskKey>>,
    next_task: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("credentials", &*self.credentials.read())
            .field("user_agent", &self.user_agent)
            .field("shared_link", &self.shared_link)
            .field("suppress_auth_error_ui", &self.suppress_auth_error_ui)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        client: ClientIdentity,
        credentials: Credentials,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            client,
            credentials: RwLock::new(credentials),
            user_agent: None,
            shared_link: None,
            suppress_auth_error_ui: false,
            listeners: RwLock::new(Vec::new()),
            provider,
            notifier: Arc::new(NoopNotifier),
            scheduler: Scheduler::default(),
            refreshes: SingleFlight::new(),
            logins: SingleFlight::new(),
            last_login: Mutex::new(None),
            next_task: AtomicU64::new(1),
        }
    }

    /// Builds a session backed by [`OAuthProvider`] from environment-derived config.
    pub fn from_config(config: SessionConfig) -> Self {
        let provider = OAuthProvider::new(config.oauth_base_url);
        Self::new(
            ClientIdentity::new(config.client_id, config.client_secret),
            config.credentials,
            Arc::new(provider),
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AuthNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_shared_link(mut self, shared_link: SharedLink) -> Self {
        self.shared_link = Some(shared_link);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Skips every [`AuthNotifier`] call; failures are still returned.
    pub fn suppress_auth_error_ui(mut self, suppress: bool) -> Self {
        self.suppress_auth_error_ui = suppress;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn AuthListener>) {
        self.listeners.write().push(listener);
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().clone()
    }

    /// Replaces the credentials, e.g. with ones restored from storage.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write() = credentials;
    }

    pub fn access_token(&self) -> Option<String> {
        self.credentials.read().access_token.clone()
    }

    pub fn client(&self) -> &ClientIdentity {
        &self.client
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn shared_link(&self) -> Option<&SharedLink> {
        self.shared_link.as_ref()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Refreshes the credentials, joining a refresh already in flight.
    pub async fn refresh(self: &Arc<Self>) -> AuthOutcome {
        self.refresh_after(None).await
    }

    /// Refreshes credentials after a request sent with `seen_token` was rejected.
    ///
    /// When the current access token already differs from `seen_token`, another
    /// caller has refreshed in the meantime and the current credentials are
    /// returned without contacting the identity provider.
    pub async fn refresh_after(self: &Arc<Self>, seen_token: Option<&str>) -> AuthOutcome {
        let current = self.credentials();
        if let (Some(seen), Some(token)) = (seen_token, current.access_token.as_deref()) {
            if seen != token {
                return Ok(current);
            }
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            let failure = AuthFailure::from_kind(
                ErrorKind::InvalidGrantInvalidToken,
                None,
                "no refresh token available",
            );
            self.handle_failure(&failure);
            return Err(failure);
        };

        let session = Arc::clone(self);
        self.refreshes
            .join_or_start(
                FlightKey(refresh_token),
                &self.scheduler,
                async move { session.run_refresh(current).await },
                || Err(AuthFailure::interrupted()),
            )
            .await
    }

    async fn run_refresh(&self, snapshot: Credentials) -> AuthOutcome {
        // an earlier flight for this refresh token may have finished after the snapshot
        let current = self.credentials();
        if snapshot.access_token.is_some() && current.access_token != snapshot.access_token {
            return Ok(current);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(user_id = ?snapshot.user_id, "refreshing credentials");

        match self.provider.refresh(&self.client, &snapshot).await {
            Ok(mut fresh) => {
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = snapshot.refresh_token.clone();
                }
                if fresh.user_id.is_none() {
                    fresh.user_id = snapshot.user_id.clone();
                }
                if fresh.base_domain.is_none() {
                    fresh.base_domain = snapshot.base_domain;
                }
                fresh.refreshed_at.get_or_insert_with(Utc::now);
                *self.credentials.write() = fresh.clone();

                for listener in self.listeners() {
                    listener.on_refreshed(&fresh);
                }
                Ok(fresh)
            }
            Err(failure) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(fatal = failure.fatal, kind = ?failure.kind, "credential refresh failed");

                self.handle_failure(&failure);
                Err(failure)
            }
        }
    }

    /// Ensures the session holds usable credentials.
    ///
    /// Returns the current credentials when an access token exists, refreshes
    /// when only a refresh token is left, and otherwise starts an interactive
    /// login. Concurrent logins coalesce into the one already pending.
    pub async fn authenticate(self: &Arc<Self>) -> AuthOutcome {
        let current = self.credentials();
        if current.access_token.is_some() {
            return Ok(current);
        }
        if current.refresh_token.is_some() {
            return self.refresh().await;
        }

        let joined = {
            let mut last_login = self.last_login.lock();
            let key = match *last_login {
                Some(key) if self.logins.is_in_flight(&key) => key,
                _ => {
                    let key = TaskKey(self.next_task.fetch_add(1, Ordering::Relaxed));
                    *last_login = Some(key);
                    key
                }
            };
            let session = Arc::clone(self);
            self.logins.join_or_start(
                key,
                &self.scheduler,
                async move { session.run_login().await },
                || Err(AuthFailure::interrupted()),
            )
        };
        joined.await
    }

    async fn run_login(&self) -> AuthOutcome {
        match self.provider.authorize(&self.client).await {
            Ok(mut created) => {
                created.refreshed_at.get_or_insert_with(Utc::now);
                *self.credentials.write() = created.clone();
                for listener in self.listeners() {
                    listener.on_auth_created(&created);
                }
                Ok(created)
            }
            Err(failure) => {
                self.handle_failure(&failure);
                Err(failure)
            }
        }
    }

    /// Revokes the credentials and wipes them locally.
    ///
    /// Local state is cleared and listeners are told even when revocation fails.
    pub async fn logout(&self) -> Result<(), AuthFailure> {
        let current = self.credentials();
        let revoked = self.provider.revoke(&self.client, &current).await;

        *self.credentials.write() = Credentials {
            user_id: current.user_id,
            base_domain: current.base_domain,
            ..Credentials::default()
        };
        for listener in self.listeners() {
            listener.on_logged_out();
        }
        revoked
    }

    pub(crate) fn notify_blocked(&self, kind: ErrorKind) {
        if !self.suppress_auth_error_ui {
            self.notifier.notify_blocked(kind);
        }
    }

    pub(crate) fn notify_terms_required(&self) {
        if !self.suppress_auth_error_ui {
            self.notifier.notify_terms_required();
        }
    }

    fn handle_failure(&self, failure: &AuthFailure) {
        if failure.fatal {
            self.credentials.write().wipe_tokens();
            if !self.suppress_auth_error_ui {
                self.notifier.notify_login_required(failure);
            }
        } else if failure.kind == ErrorKind::TermsOfServiceRequired {
            self.notify_terms_required();
        }

        for listener in self.listeners() {
            listener.on_auth_failure(failure);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn AuthListener>> {
        self.listeners.read().clone()
    }
}
