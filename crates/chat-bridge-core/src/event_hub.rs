//! Broadcast + history event hub for a single connection.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{ConnectionEvent, ConnectionUpdate, Credentials, MessagesUpsert};

/// Default history size limit (events).
const HISTORY_LEN: usize = 256;

const CHANNEL_CAPACITY: usize = 1024;

/// Ordered stream of connection events.
pub type EventStream = futures::stream::BoxStream<'static, ConnectionEvent>;

/// Event hub with broadcast and history support.
///
/// A subscriber attached after the connection started still sees what
/// happened before (e.g. the `opening` update) and then live events, each
/// exactly once and in push order. A subscriber that falls behind the live
/// channel is handed the latest connection-state update in place of the
/// dropped events, so a `close` is never lost.
pub struct EventHub {
    history: RwLock<VecDeque<ConnectionEvent>>,
    latest_state: Arc<RwLock<Option<ConnectionUpdate>>>,
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a new event hub.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a hub whose live channel buffers `capacity` events per
    /// subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: RwLock::new(VecDeque::with_capacity(32)),
            latest_state: Arc::new(RwLock::new(None)),
            sender,
        }
    }

    /// Push an event to both live subscribers and history.
    pub fn push(&self, event: impl Into<ConnectionEvent>) {
        let event = event.into();
        // Holding the history lock across the send keeps snapshots taken by
        // `subscribe` consistent with the live channel.
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        if let ConnectionEvent::Update(update) = &event {
            if update.connection.is_some() {
                *self.latest_state.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(update.clone());
            }
        }
        let _ = self.sender.send(event.clone());
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Push a connection-state update.
    pub fn push_update(&self, update: ConnectionUpdate) {
        self.push(update);
    }

    /// Push a credentials update.
    pub fn push_credentials(&self, creds: Credentials) {
        self.push(creds);
    }

    /// Push a batch of received messages.
    pub fn push_messages(&self, upsert: MessagesUpsert) {
        self.push(upsert);
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let (history, rx) = {
            let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
            (history.iter().cloned().collect::<Vec<_>>(), self.sender.subscribe())
        };

        let latest_state = Arc::clone(&self.latest_state);
        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(move |res| {
            let latest_state = Arc::clone(&latest_state);
            async move {
                match res {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged, replaying latest state");
                        latest_state
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone()
                            .map(ConnectionEvent::Update)
                    }
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionState, Fault};

    #[tokio::test]
    async fn test_late_subscriber_sees_history_then_live() {
        let hub = EventHub::new();
        hub.push_update(ConnectionUpdate::state(ConnectionState::Opening));
        hub.push_update(ConnectionUpdate::qr("qr-payload"));

        let mut events = hub.subscribe();
        hub.push_update(ConnectionUpdate::state(ConnectionState::Open));

        assert_eq!(
            events.next().await,
            Some(ConnectionUpdate::state(ConnectionState::Opening).into())
        );
        assert_eq!(events.next().await, Some(ConnectionUpdate::qr("qr-payload").into()));
        assert_eq!(
            events.next().await,
            Some(ConnectionUpdate::state(ConnectionState::Open).into())
        );
    }

    #[tokio::test]
    async fn test_mixed_events_keep_order() {
        let hub = EventHub::new();
        let mut events = hub.subscribe();

        hub.push_update(ConnectionUpdate::state(ConnectionState::Open));
        hub.push_credentials(Credentials::generate());
        hub.push_update(ConnectionUpdate::closed(Some(Fault::logged_out())));

        assert!(matches!(events.next().await, Some(ConnectionEvent::Update(_))));
        assert!(matches!(
            events.next().await,
            Some(ConnectionEvent::CredentialsUpdate(_))
        ));
        match events.next().await {
            Some(ConnectionEvent::Update(update)) => {
                assert!(update.last_disconnect.unwrap().is_logged_out());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_still_sees_close() {
        let hub = EventHub::with_capacity(2);
        let mut events = hub.subscribe();

        hub.push_update(ConnectionUpdate::state(ConnectionState::Open));
        hub.push_update(ConnectionUpdate::closed(Some(Fault::new().with_close_code(1006))));
        for _ in 0..4 {
            hub.push_credentials(Credentials::generate());
        }

        assert_eq!(
            events.next().await,
            Some(ConnectionUpdate::closed(Some(Fault::new().with_close_code(1006))).into())
        );
        assert!(matches!(
            events.next().await,
            Some(ConnectionEvent::CredentialsUpdate(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let hub = EventHub::new();
        for _ in 0..(HISTORY_LEN + 10) {
            hub.push_update(ConnectionUpdate::state(ConnectionState::Opening));
        }
        hub.push_update(ConnectionUpdate::state(ConnectionState::Open));
        assert_eq!(hub.history.read().unwrap().len(), HISTORY_LEN);

        let mut events = hub.subscribe().skip(HISTORY_LEN - 1);
        assert_eq!(
            events.next().await,
            Some(ConnectionUpdate::state(ConnectionState::Open).into())
        );
    }
}
