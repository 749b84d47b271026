//! The single entry point for outbound requests.
//!
//! [`Dispatcher::execute`] sends an operation with the current credentials,
//! refreshes and retries once on 401, defers queueable writes the network
//! could not carry, and kicks the outbox after every successful send.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    ConnectivityMonitor, HttpRequest, HttpResponse, Transport, TransportFailure,
    AUTHORIZATION_HEADER, IDEMPOTENCY_KEY_HEADER,
};
use crate::config::{ConfigError, CoreConfig};
use crate::credentials::{CredentialPair, CredentialStore};
use crate::event::{CoreEvent, EventBus};
use crate::outbox::{
    Delivery, DrainOutcome, DrainReport, DrainStop, EnqueueOutcome, OpId, Operation, Outbox,
    OutboxError,
};
use crate::refresh::{AuthFailure, RefreshCoordinator, SessionTicket};
use crate::server_message;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    /// The operation is persisted and will be replayed. Not an error for the
    /// UI; show it as pending.
    #[error("operation {op_id} queued for later delivery")]
    QueuedForLater { op_id: OpId },

    #[error("device is offline")]
    Offline,

    #[error("session expired")]
    SessionExpired,

    #[error("network error: {reason}")]
    NetworkError { reason: String },

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// A queueable operation could not be persisted (queue full, storage
    /// failure or no signed-in user).
    #[error("operation could not be queued: {reason}")]
    QueueRejected { reason: String },
}

/// How one authorized attempt (plus its refresh-and-retry) ended.
#[derive(Debug)]
enum AttemptError {
    Network(String),
    Status { status: u16, body: Vec<u8> },
    RefreshUnavailable(String),
    SessionExpired,
    /// A sign-out or sign-in replaced the session mid-attempt.
    SessionChanged,
}

impl From<AuthFailure> for AttemptError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Unavailable { reason } => Self::RefreshUnavailable(reason),
            AuthFailure::SessionChanged => Self::SessionChanged,
            AuthFailure::NoRefreshToken | AuthFailure::SessionExpired => Self::SessionExpired,
        }
    }
}

impl From<TransportFailure> for AttemptError {
    fn from(failure: TransportFailure) -> Self {
        match failure {
            TransportFailure::Status { status, body } => Self::Status { status, body },
            other => Self::Network(other.to_string()),
        }
    }
}

struct Inner {
    config: CoreConfig,
    transport: Arc<dyn Transport>,
    connectivity: ConnectivityMonitor,
    outbox: Arc<Outbox>,
    refresh: RefreshCoordinator,
    events: EventBus,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        connectivity: ConnectivityMonitor,
        outbox: Arc<Outbox>,
        events: EventBus,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let refresh = RefreshCoordinator::new(
            transport.clone(),
            credentials,
            config.refresh_path()?,
            config.refresh_timeout(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                connectivity,
                outbox,
                refresh,
                events,
            }),
        })
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.inner.outbox
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    /// Sends `op`, or defers it if it is queueable and cannot go out now.
    #[instrument(skip(self, op), fields(op_id = %op.id(), method = %op.method(), path = %op.path()))]
    pub async fn execute(&self, op: Operation) -> Result<HttpResponse, DispatchFailure> {
        if !self.inner.connectivity.is_online() {
            if op.is_queueable() {
                return self.defer(op).await;
            }
            debug!("offline, not queueable");
            return Err(DispatchFailure::Offline);
        }

        if op.is_queueable() && !self.inner.outbox.is_empty().await {
            debug!("older operations pending, appending behind them");
            let result = self.defer(op).await;
            self.spawn_drain();
            return result;
        }

        let ticket = self.inner.refresh.ticket();
        match self.send_authorized(&op, ticket).await {
            Ok(response) => {
                if !self.inner.outbox.is_empty().await {
                    self.spawn_drain();
                }
                Ok(response)
            }
            Err(AttemptError::Network(reason)) | Err(AttemptError::RefreshUnavailable(reason)) => {
                if op.is_queueable() {
                    warn!(reason = %reason, "send failed, deferring");
                    self.defer(op).await
                } else {
                    Err(DispatchFailure::NetworkError { reason })
                }
            }
            Err(AttemptError::Status { status, body }) => Err(DispatchFailure::ServerError {
                status,
                message: server_message(status, &body),
            }),
            Err(AttemptError::SessionExpired) => {
                self.end_session(ticket).await;
                Err(DispatchFailure::SessionExpired)
            }
            Err(AttemptError::SessionChanged) => {
                debug!("session replaced while sending, dropping result");
                Err(DispatchFailure::SessionExpired)
            }
        }
    }

    /// Replays the outbox now. Returns immediately if a drain is running.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainOutcome, OutboxError> {
        // Sign-in swaps credentials and opens the queue under the same lock,
        // so the ticket and the queue's user always belong together.
        let (ticket, user) = {
            let session = self.inner.refresh.lock_session().await;
            (session.ticket(), self.inner.outbox.current_user().await)
        };
        let Some(user) = user else {
            return Ok(DrainOutcome::Finished(DrainReport {
                stopped: DrainStop::SessionChanged,
                ..DrainReport::default()
            }));
        };

        let connectivity = self.inner.connectivity.clone();
        let this = self;
        let outcome = self
            .inner
            .outbox
            .drain(
                move || connectivity.is_online(),
                move |op| this.deliver_queued(op, ticket),
            )
            .await?;

        if let DrainOutcome::Finished(report) = &outcome {
            match report.stopped {
                DrainStop::SessionExpired => self.end_session(ticket).await,
                DrainStop::SessionChanged => {
                    info!(user = %user, "session replaced mid-drain");
                    // The new session's queue was locked out while this pass ran.
                    if self.inner.outbox.current_user().await.is_some()
                        && !self.inner.outbox.is_empty().await
                        && self.inner.connectivity.is_online()
                    {
                        self.spawn_drain();
                    }
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    pub(crate) fn spawn_drain(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drain().await {
                warn!(error = %e, "background drain failed");
            }
        });
    }

    async fn deliver_queued(&self, op: Operation, ticket: SessionTicket) -> Delivery {
        match self.send_authorized(&op, ticket).await {
            Ok(_) => Delivery::Delivered,
            Err(AttemptError::Network(reason)) | Err(AttemptError::RefreshUnavailable(reason)) => {
                Delivery::Retryable { reason }
            }
            Err(AttemptError::Status { status, .. })
                if status == 408 || status == 429 || status >= 500 =>
            {
                Delivery::Retryable {
                    reason: format!("HTTP {status}"),
                }
            }
            Err(AttemptError::Status { status, body }) => Delivery::Rejected {
                status,
                message: server_message(status, &body),
            },
            Err(AttemptError::SessionExpired) => Delivery::SessionExpired,
            Err(AttemptError::SessionChanged) => Delivery::SessionChanged,
        }
    }

    async fn defer(&self, op: Operation) -> Result<HttpResponse, DispatchFailure> {
        let op_id = op.id().clone();
        match self.inner.outbox.enqueue(op).await {
            Ok(EnqueueOutcome::Queued { .. }) | Ok(EnqueueOutcome::AlreadyQueued) => {
                Err(DispatchFailure::QueuedForLater { op_id })
            }
            Ok(EnqueueOutcome::AlreadyDelivered) => {
                debug!(op_id = %op_id, "operation was already delivered");
                Err(DispatchFailure::QueuedForLater { op_id })
            }
            Err(e) => {
                error!(op_id = %op_id, error = %e, "could not queue operation");
                Err(DispatchFailure::QueueRejected {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// One send with `ticket`'s credentials; on 401 one refresh and one
    /// retry with whatever the refresh produced.
    async fn send_authorized(
        &self,
        op: &Operation,
        ticket: SessionTicket,
    ) -> Result<HttpResponse, AttemptError> {
        let ticket = self.inner.refresh.renew(&ticket)?;
        let credentials = self.inner.refresh.current_credentials(&ticket)?;

        match self.send_once(op, &credentials).await {
            Err(failure) if failure.is_auth_rejection() => {}
            other => return other.map_err(AttemptError::from),
        }

        debug!("access token rejected, refreshing");
        let refreshed = self
            .inner
            .refresh
            .ensure_fresh_credentials(op.id(), ticket)
            .await?;

        match self.send_once(op, &refreshed).await {
            Err(failure) if failure.is_auth_rejection() => {
                warn!("refreshed token rejected");
                Err(AttemptError::SessionExpired)
            }
            other => other.map_err(AttemptError::from),
        }
    }

    async fn send_once(
        &self,
        op: &Operation,
        credentials: &CredentialPair,
    ) -> Result<HttpResponse, TransportFailure> {
        let timeout = self.inner.config.timeout_for(op.class());
        let request = authorized_request(op, credentials, timeout).map_err(|e| {
            error!(error = %e, "could not build request");
            TransportFailure::Connection {
                reason: e.to_string(),
            }
        })?;

        let response = match tokio::time::timeout(timeout, self.inner.transport.send(request)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportFailure::Timeout {
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        if response.is_success() {
            Ok(response)
        } else {
            let status = response.status();
            Err(TransportFailure::status(status, response.into_body()))
        }
    }

    /// Tears `ticket`'s session down after its credentials became unusable.
    /// Only the first caller for a session does anything, and a session
    /// already replaced by sign-in or sign-out is left alone.
    async fn end_session(&self, ticket: SessionTicket) {
        let mut session = self.inner.refresh.lock_session().await;
        if !session.is_current(&ticket) {
            debug!("session already replaced");
            return;
        }
        if let Err(e) = session.replace(None).await {
            warn!(error = %e, "failed to remove persisted credentials");
        }
        match self.inner.outbox.close_session().await {
            Ok(Some(discarded)) => {
                info!(discarded, "session expired");
                self.inner.events.emit(CoreEvent::SessionExpired);
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to discard queue of expired session"),
        }
    }
}

fn authorized_request(
    op: &Operation,
    credentials: &CredentialPair,
    timeout: Duration,
) -> Result<HttpRequest, crate::capabilities::HttpError> {
    let request = op.to_request(timeout)?.with_header(
        AUTHORIZATION_HEADER,
        format!("Bearer {}", credentials.access_token.expose()),
    )?;
    if op.is_queueable() {
        request.with_header(IDEMPOTENCY_KEY_HEADER, op.id().as_str())
    } else {
        Ok(request)
    }
}
