//! Host-facing facade wiring credentials, the outbox and the dispatcher.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ConnectivityMonitor, HttpResponse, Transition, Transport};
use crate::config::CoreConfig;
use crate::credentials::{CredentialPair, CredentialStore};
use crate::dispatcher::{DispatchFailure, Dispatcher};
use crate::event::{CoreEvent, EventBus};
use crate::model::SyncStatus;
use crate::outbox::{
    DrainOutcome, Operation, Outbox, OutboxConfig, QueueStorage, RecoveryReport, UserId,
};
use crate::AppResult;

pub struct App {
    dispatcher: Dispatcher,
    credentials: Arc<dyn CredentialStore>,
    connectivity: ConnectivityMonitor,
    events: EventBus,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        storage: Arc<dyn QueueStorage>,
        connectivity: ConnectivityMonitor,
    ) -> AppResult<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        let outbox = Arc::new(Outbox::new(
            storage,
            OutboxConfig::from(&config),
            events.clone(),
        )?);
        let dispatcher = Dispatcher::new(
            config,
            transport,
            credentials.clone(),
            connectivity.clone(),
            outbox,
            events.clone(),
        )?;

        Ok(Self {
            dispatcher,
            credentials,
            connectivity,
            events,
            watcher: Mutex::new(None),
        })
    }

    /// Stores `pair` and opens `user`'s queue, recovering anything persisted
    /// by an earlier run. A different user's queue is discarded first.
    ///
    /// Requests still in flight from the previous session can no longer
    /// refresh, retry or store anything.
    #[instrument(skip(self, user, pair), fields(user = %user))]
    pub async fn sign_in(&self, user: UserId, pair: CredentialPair) -> AppResult<RecoveryReport> {
        let outbox = self.dispatcher.outbox();
        let mut session = self.dispatcher.refresh_coordinator().lock_session().await;
        if let Some(previous) = outbox.current_user().await {
            if previous != user {
                warn!(previous = %previous, "switching user, discarding previous queue");
                outbox.close_session().await?;
            }
        }

        session.replace(Some(pair)).await?;
        let report = outbox.open_session(user).await?;
        drop(session);

        if self.connectivity.is_online() && !outbox.is_empty().await {
            self.dispatcher.spawn_drain();
        }
        info!(recovered = report.recovered, "signed in");
        Ok(report)
    }

    /// Discards the queue (each operation reported as permanently failed)
    /// and forgets the credentials. Returns the number of discarded
    /// operations.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> AppResult<usize> {
        let mut session = self.dispatcher.refresh_coordinator().lock_session().await;
        let discarded = self
            .dispatcher
            .outbox()
            .close_session()
            .await?
            .unwrap_or(0);
        session.replace(None).await?;
        drop(session);
        info!(discarded, "signed out");
        Ok(discarded)
    }

    pub async fn execute(&self, op: Operation) -> Result<HttpResponse, DispatchFailure> {
        self.dispatcher.execute(op).await
    }

    pub async fn drain(&self) -> AppResult<DrainOutcome> {
        Ok(self.dispatcher.drain().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_signed_in(&self) -> bool {
        self.credentials.get().is_some()
    }

    /// Starting point for a [`SyncStatus`] the UI keeps up to date from
    /// [`subscribe`](Self::subscribe).
    pub async fn status(&self) -> SyncStatus {
        SyncStatus::new(
            self.connectivity.is_online(),
            self.dispatcher.outbox().pending().await,
        )
    }

    /// Forwards connectivity transitions to the event stream and drains the
    /// outbox whenever the device comes back online. Replaces any watcher
    /// started earlier; the task stops when the `App` is dropped.
    pub fn spawn_connectivity_watcher(&self) {
        let mut transitions = self.connectivity.subscribe();
        let dispatcher = self.dispatcher.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            while let Some(transition) = transitions.next().await {
                let online = transition == Transition::Online;
                events.emit(CoreEvent::ConnectivityChanged { online });
                if !online {
                    continue;
                }
                debug!("back online, draining outbox");
                if let Err(e) = dispatcher.drain().await {
                    warn!(error = %e, "drain after reconnect failed");
                }
            }
        });

        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        let slot = self
            .watcher
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}
