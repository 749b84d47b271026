//! Single-flight credential refresh.
//!
//! Any number of requests may be rejected with 401 at once; only the first
//! starts a refresh call and the rest await the same shared result. Each
//! completed refresh advances an epoch. A caller that read its credentials
//! before the latest refresh finished gets the stored pair instead of
//! triggering another refresh.
//!
//! Credentials belong to a session. Signing in, signing out and tearing an
//! expired session down go through [`SessionLock`], which starts a new
//! session. A request or refresh that began in an earlier session ends with
//! [`AuthFailure::SessionChanged`] and never reads or writes the new
//! session's credentials.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiPath, HttpMethod, HttpRequest, Transport, TransportFailure};
use crate::credentials::{CredentialError, CredentialPair, CredentialStore};
use crate::outbox::OpId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("session expired")]
    SessionExpired,

    /// The refresh endpoint could not be reached or stored credentials could
    /// not be written. Credentials are kept; a later attempt may succeed.
    #[error("credential refresh unavailable: {reason}")]
    Unavailable { reason: String },

    /// The session the request was sent in has been replaced by a sign-out
    /// or sign-in. The current session's credentials were not touched.
    #[error("session replaced while the request was in flight")]
    SessionChanged,
}

impl AuthFailure {
    /// Terminal failures end the session; credentials are already cleared.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::SessionExpired)
    }
}

/// Which session and refresh epoch a request's credentials were read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    session: u64,
    epoch: u64,
}

type RefreshResult = Result<CredentialPair, AuthFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Default)]
struct RefreshState {
    session: u64,
    epoch: u64,
    in_flight: Option<SharedRefresh>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    refresh_path: ApiPath,
    timeout: Duration,
    state: Mutex<RefreshState>,
    // Held across every credential write; never across a network call.
    writes: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ticket(&self) -> SessionTicket {
        let state = self.state();
        SessionTicket {
            session: state.session,
            epoch: state.epoch,
        }
    }

    fn is_current_session(&self, session: u64) -> bool {
        self.state().session == session
    }
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        refresh_path: ApiPath,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                credentials,
                refresh_path,
                timeout,
                state: Mutex::new(RefreshState::default()),
                writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Number of refreshes that have settled the session one way or the
    /// other.
    pub fn epoch(&self) -> u64 {
        self.inner.state().epoch
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.state().in_flight.is_some()
    }

    /// Take this before reading the credentials a request is sent with.
    pub fn ticket(&self) -> SessionTicket {
        self.inner.ticket()
    }

    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.inner.is_current_session(ticket.session)
    }

    /// A ticket at the current epoch for the same session as `ticket`.
    pub fn renew(&self, ticket: &SessionTicket) -> Result<SessionTicket, AuthFailure> {
        let current = self.inner.ticket();
        if current.session == ticket.session {
            Ok(current)
        } else {
            Err(AuthFailure::SessionChanged)
        }
    }

    /// The stored pair, provided `ticket`'s session is still the current one.
    pub fn current_credentials(&self, ticket: &SessionTicket) -> RefreshResult {
        let pair = self.inner.credentials.get();
        if !self.is_current(ticket) {
            return Err(AuthFailure::SessionChanged);
        }
        pair.ok_or(AuthFailure::SessionExpired)
    }

    /// Waits for any in-progress credential write and blocks new ones until
    /// the returned lock is dropped.
    pub async fn lock_session(&self) -> SessionLock<'_> {
        SessionLock {
            inner: &self.inner,
            _writes: self.inner.writes.lock().await,
        }
    }

    /// Returns credentials newer than those the caller was rejected with.
    ///
    /// `ticket` must have been taken before the rejected request read its
    /// credentials.
    #[instrument(skip(self, caused_by), fields(caused_by = %caused_by))]
    pub async fn ensure_fresh_credentials(
        &self,
        caused_by: &OpId,
        ticket: SessionTicket,
    ) -> Result<CredentialPair, AuthFailure> {
        let refresh = {
            let mut state = self.inner.state();
            if state.session != ticket.session {
                debug!("session replaced since the request was sent");
                return Err(AuthFailure::SessionChanged);
            }
            if state.epoch != ticket.epoch {
                drop(state);
                debug!("credentials already refreshed since the request was sent");
                return self.current_credentials(&ticket);
            }
            match &state.in_flight {
                Some(in_flight) => {
                    debug!("joining in-flight refresh");
                    in_flight.clone()
                }
                None => {
                    let refresh = Self::run(self.inner.clone(), caused_by.clone(), ticket.session)
                        .boxed()
                        .shared();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    async fn run(inner: Arc<Inner>, caused_by: OpId, session: u64) -> RefreshResult {
        let result = Self::refresh_once(&inner, &caused_by, session).await;

        let mut state = inner.state();
        // A replaced session already dropped this refresh.
        if state.session == session {
            state.in_flight = None;
            if !matches!(
                result,
                Err(AuthFailure::Unavailable { .. }) | Err(AuthFailure::SessionChanged)
            ) {
                state.epoch += 1;
            }
        }
        result
    }

    async fn refresh_once(inner: &Inner, caused_by: &OpId, session: u64) -> RefreshResult {
        let current = {
            let _writes = inner.writes.lock().await;
            if !inner.is_current_session(session) {
                return Err(AuthFailure::SessionChanged);
            }
            inner.credentials.get()
        };
        let Some(current) = current else {
            return Err(AuthFailure::NoRefreshToken);
        };
        let Some(refresh_token) = current.refresh_token.clone() else {
            warn!("access token rejected and no refresh token held");
            if !Self::clear(inner, session).await {
                return Err(AuthFailure::SessionChanged);
            }
            return Err(AuthFailure::NoRefreshToken);
        };

        info!(caused_by = %caused_by, "refreshing credentials");
        let request = HttpRequest::new(HttpMethod::Post, inner.refresh_path.clone(), inner.timeout)
            .with_json(&RefreshRequest {
                refresh_token: refresh_token.expose(),
            })
            .map_err(|e| AuthFailure::Unavailable {
                reason: e.to_string(),
            })?;

        let sent = match tokio::time::timeout(inner.timeout, inner.transport.send(request)).await
        {
            Ok(sent) => sent,
            Err(_) => Err(TransportFailure::Timeout {
                after_ms: u64::try_from(inner.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        let response = match sent {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                return Self::rejected(inner, session, response.status()).await;
            }
            Err(TransportFailure::Status { status, .. }) => {
                return Self::rejected(inner, session, status).await;
            }
            Err(failure) => {
                warn!(error = %failure, "refresh request failed");
                return Err(AuthFailure::Unavailable {
                    reason: failure.to_string(),
                });
            }
        };

        let body: RefreshResponse = response.json().map_err(|e| {
            warn!(error = %e, "malformed refresh response");
            AuthFailure::Unavailable {
                reason: e.to_string(),
            }
        })?;

        let refreshed = match body.refresh_token {
            Some(rotated) => CredentialPair::new(body.access_token, Some(rotated)),
            None => CredentialPair::new(
                body.access_token,
                Some(refresh_token.expose().to_string()),
            ),
        }
        .map_err(|e| AuthFailure::Unavailable {
            reason: e.to_string(),
        })?;

        let _writes = inner.writes.lock().await;
        if !inner.is_current_session(session) {
            info!("session replaced during refresh, discarding refreshed credentials");
            return Err(AuthFailure::SessionChanged);
        }
        inner
            .credentials
            .set(refreshed.clone())
            .await
            .map_err(|e| AuthFailure::Unavailable {
                reason: e.to_string(),
            })?;

        info!("credentials refreshed");
        Ok(refreshed)
    }

    /// 408, 429 and 5xx mean the server could not answer right now; any
    /// other status is the server refusing the refresh token.
    async fn rejected(inner: &Inner, session: u64, status: u16) -> RefreshResult {
        if status == 408 || status == 429 || status >= 500 {
            warn!(status, "refresh endpoint unavailable");
            return Err(AuthFailure::Unavailable {
                reason: format!("HTTP {status}"),
            });
        }
        if !Self::clear(inner, session).await {
            return Err(AuthFailure::SessionChanged);
        }
        warn!(status, "refresh token rejected, ending session");
        Err(AuthFailure::SessionExpired)
    }

    /// Clears the store if `session` is still current. Returns false if it
    /// was replaced.
    async fn clear(inner: &Inner, session: u64) -> bool {
        let _writes = inner.writes.lock().await;
        if !inner.is_current_session(session) {
            return false;
        }
        if let Err(e) = inner.credentials.clear().await {
            warn!(error = %e, "failed to remove persisted credentials");
        }
        true
    }
}

/// Exclusive hold on the credential store, taken by sign-in, sign-out and
/// session teardown.
pub struct SessionLock<'a> {
    inner: &'a Inner,
    _writes: tokio::sync::MutexGuard<'a, ()>,
}

impl SessionLock<'_> {
    pub fn ticket(&self) -> SessionTicket {
        self.inner.ticket()
    }

    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.inner.is_current_session(ticket.session)
    }

    /// Starts a new session holding `pair`, or no credentials at all.
    /// Refreshes still running for the previous session are abandoned and
    /// will not store their result.
    pub async fn replace(&mut self, pair: Option<CredentialPair>) -> Result<(), CredentialError> {
        {
            let mut state = self.inner.state();
            state.session += 1;
            state.in_flight = None;
        }
        match pair {
            Some(pair) => self.inner.credentials.set(pair).await,
            None => self.inner.credentials.clear().await,
        }
    }
}
