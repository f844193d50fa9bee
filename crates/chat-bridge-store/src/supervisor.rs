//! Connection supervisor: establishes the connection, persists credential
//! changes, and hands failures to the reconnect coordinator.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_bridge_core::{
    AuthState, Connection, ConnectionEvent, ConnectionState, ConnectionUpdate, Connector,
    CredentialStore, EventStream, Fault, MessageSender, MessagesUpsert, OutboundMessage,
    SendError, StoreError, UpsertKind,
};
use chat_bridge_reconnect::{ReconnectConfig, ReconnectCoordinator, ReconnectOutcome};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use serde::Deserialize;
use tokio::{
    sync::{RwLock, broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const DEFAULT_WIPE_AFTER_FAILURES: u32 = 5;
const INCOMING_CAPACITY: usize = 256;

/// Supervisor error.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Supervisor is shut down")]
    ShutDown,
}

/// Supervisor tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub reconnect: ReconnectConfig,
    /// Wipe stored credentials when this many consecutive retries failed.
    /// Zero disables the wipe.
    pub wipe_after_failures: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            wipe_after_failures: DEFAULT_WIPE_AFTER_FAILURES,
        }
    }
}

/// What the supervisor is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorStatus {
    Idle,
    Connecting,
    Open { user: Option<String> },
    Reconnecting { attempt: u32, delay: Duration },
    /// The account was logged out remotely. Needs `restart_fresh`.
    LoggedOut,
    /// Retry budget spent. Needs `restart_fresh`.
    RetriesExhausted { attempts: u32 },
    Stopped,
}

/// Owns the single live connection and keeps it alive.
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    store: Arc<dyn CredentialStore>,
    coordinator: ReconnectCoordinator,
    wipe_after_failures: u32,
    current: RwLock<Option<Arc<dyn Connection>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<SupervisorStatus>,
    incoming: broadcast::Sender<MessagesUpsert>,
    shutting_down: AtomicBool,
}

impl ConnectionSupervisor {
    /// Create a supervisor. Nothing connects until [`start`](Self::start).
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SupervisorStatus::Idle);
        let (incoming, _) = broadcast::channel(INCOMING_CAPACITY);
        Arc::new(Self {
            connector,
            store,
            coordinator: ReconnectCoordinator::new(config.reconnect),
            wipe_after_failures: config.wipe_after_failures,
            current: RwLock::new(None),
            event_task: Mutex::new(None),
            status,
            incoming,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Watch status transitions.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn current_status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub const fn coordinator(&self) -> &ReconnectCoordinator {
        &self.coordinator
    }

    /// Receive message batches from whichever connection is live.
    #[must_use]
    pub fn incoming(&self) -> broadcast::Receiver<MessagesUpsert> {
        self.incoming.subscribe()
    }

    /// Establish the first connection. Failures are retried in the
    /// background.
    pub async fn start(self: &Arc<Self>) {
        Arc::clone(self).establish().await;
    }

    /// Wipe stored credentials and connect from scratch.
    ///
    /// The way out of `LoggedOut` and `RetriesExhausted`.
    ///
    /// # Errors
    /// Returns an error if the store cannot be cleared or the supervisor
    /// was shut down.
    pub async fn restart_fresh(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShutDown);
        }
        info!("restarting with fresh credentials");
        self.coordinator.shutdown();
        self.drop_connection().await;
        self.store.clear_all().await?;
        self.coordinator.reset_attempt_count();
        Arc::clone(self).establish().await;
        Ok(())
    }

    /// Cancel retries and close the live connection.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.coordinator.shutdown();
        self.drop_connection().await;
        self.set_status(SupervisorStatus::Stopped);
        info!("connection supervisor stopped");
    }

    fn establish(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            self.set_status(SupervisorStatus::Connecting);
            self.wipe_if_stuck().await;

            let creds = match self.store.load_or_init_credentials().await {
                Ok(creds) => creds,
                Err(e) => {
                    error!(error = %e, "failed to load credentials");
                    self.handle_fault(Some(&Fault::new().with_message(e.to_string())));
                    return;
                }
            };

            let auth = AuthState {
                creds,
                keys: Arc::clone(&self.store),
            };

            match self.connector.connect(auth).await {
                Ok(connection) => self.attach(connection).await,
                Err(e) => {
                    error!(error = %e, "failed to connect");
                    self.handle_fault(Some(&e.fault()));
                }
            }
        }
        .boxed()
    }

    /// Clear stored credentials once per failure streak, when the attempt
    /// count reaches the threshold.
    async fn wipe_if_stuck(&self) {
        let attempts = self.coordinator.attempt_count();
        if self.wipe_after_failures == 0 || attempts != self.wipe_after_failures {
            return;
        }

        warn!(attempts, "repeated connection failures, clearing stored credentials");
        match self.store.clear_all().await {
            Ok(()) => info!("stored credentials cleared"),
            Err(e) => error!(error = %e, "failed to clear stored credentials"),
        }
    }

    async fn attach(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            connection.close().await;
            return;
        }

        debug!(connection_id = %connection.id(), "connection established, watching events");
        let events = connection.events();
        *self.current.write().await = Some(Arc::clone(&connection));

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_events(connection, events).await });
        if let Some(previous) = self.lock_event_task().replace(task) {
            previous.abort();
        }
    }

    async fn run_events(self: Arc<Self>, connection: Arc<dyn Connection>, mut events: EventStream) {
        while let Some(event) = events.next().await {
            match event {
                ConnectionEvent::CredentialsUpdate(creds) => {
                    if let Err(e) = self.store.save_credentials(&creds).await {
                        error!(error = %e, "failed to save credentials update");
                    }
                }
                ConnectionEvent::Update(update) => {
                    if self.on_update(&connection, update).await {
                        return;
                    }
                }
                ConnectionEvent::Messages(upsert) => self.on_messages(upsert),
            }
        }

        // No close was reported, so the connection is gone without a reason.
        if self.is_current(&connection).await {
            warn!(connection_id = %connection.id(), "event stream ended without a close, reconnecting");
            connection.close().await;
            self.on_closed(&connection, None).await;
        }
    }

    fn on_messages(&self, upsert: MessagesUpsert) {
        info!(kind = ?upsert.kind, count = upsert.messages.len(), "messages received");
        if upsert.kind == UpsertKind::Notify {
            for message in &upsert.messages {
                let summary = message.summary();
                info!(
                    sender_name = %summary.sender_name,
                    sender_id = %summary.sender_id,
                    is_group = summary.is_group,
                    message_type = %summary.message_type,
                    timestamp = summary.timestamp,
                    "incoming message"
                );
            }
        }
        // Nobody listening is fine.
        let _ = self.incoming.send(upsert);
    }

    /// Returns true once the connection is closed.
    async fn on_update(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
        update: ConnectionUpdate,
    ) -> bool {
        if let Some(qr) = &update.qr {
            info!(qr = %qr, "pairing QR code received, scan it with the phone app");
        }

        match update.connection {
            Some(ConnectionState::Open) => {
                self.coordinator.on_successful_connection();
                let user = connection.user_id();
                info!(user = ?user, "connection open");
                self.set_status(SupervisorStatus::Open { user });
                false
            }
            Some(ConnectionState::Close) => {
                self.on_closed(connection, update.last_disconnect).await;
                true
            }
            Some(state) => {
                debug!(?state, "connection state changed");
                false
            }
            None => false,
        }
    }

    async fn on_closed(self: &Arc<Self>, connection: &Arc<dyn Connection>, fault: Option<Fault>) {
        {
            let mut current = self.current.write().await;
            if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
                *current = None;
            }
        }

        if fault.as_ref().is_some_and(Fault::is_logged_out) {
            warn!("logged out remotely, clearing stored credentials");
            if let Err(e) = self.store.clear_all().await {
                error!(error = %e, "failed to clear stored credentials");
            }
            self.coordinator.shutdown();
            self.set_status(SupervisorStatus::LoggedOut);
            return;
        }

        self.handle_fault(fault.as_ref());
    }

    fn handle_fault(self: &Arc<Self>, fault: Option<&Fault>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        match self
            .coordinator
            .on_connection_error(fault, move || this.establish())
        {
            ReconnectOutcome::Scheduled { attempt, delay } => {
                self.set_status(SupervisorStatus::Reconnecting { attempt, delay });
            }
            ReconnectOutcome::AlreadyReconnecting => {}
            ReconnectOutcome::Exhausted { attempts } => {
                error!(attempts, "giving up on reconnecting");
                self.set_status(SupervisorStatus::RetriesExhausted { attempts });
            }
        }
    }

    async fn drop_connection(&self) {
        if let Some(task) = self.lock_event_task().take() {
            task.abort();
        }
        let connection = self.current.write().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    async fn is_current(&self, connection: &Arc<dyn Connection>) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.id() == connection.id())
    }

    async fn live(&self) -> Result<Arc<dyn Connection>, SendError> {
        self.current.read().await.clone().ok_or(SendError::NotConnected)
    }

    fn set_status(&self, status: SupervisorStatus) {
        debug!(?status, "supervisor status");
        self.status.send_replace(status);
    }

    fn lock_event_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.event_task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageSender for ConnectionSupervisor {
    async fn jid_exists(&self, jid: &str) -> Result<bool, SendError> {
        self.live().await?.jid_exists(jid).await
    }

    async fn send_message(&self, jid: &str, message: OutboundMessage) -> Result<(), SendError> {
        let connection = self.live().await?;
        debug!(jid, kind = message.kind(), "sending message");
        connection.send_message(jid, message).await
    }
}
