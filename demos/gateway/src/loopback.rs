//! Loopback connector standing in for the protocol socket.
//!
//! Pairs instantly, echoes sends into the log and keeps a per-recipient
//! session record in the signal-key store. Messages sent to the loopback's
//! own JID come back as incoming `notify` messages. The first `failures`
//! connects are refused so the reconnect path can be watched.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chat_bridge_core::{
    AuthState, ConnectError, Connection, ConnectionState, ConnectionUpdate, Connector,
    CredentialStore, EventHub, EventStream, Fault, IncomingMessage, MessageKey, MessagesUpsert,
    OutboundMessage, SendError, StoredValue, UpsertKind, credentials::Contact,
    traits::ConnectionId,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

const LOOPBACK_USER: &str = "10000000000@s.whatsapp.net";
const SESSION_CATEGORY: &str = "session";

pub struct LoopbackConnector {
    remaining_failures: AtomicU32,
}

impl LoopbackConnector {
    pub const fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, auth: AuthState) -> Result<Arc<dyn Connection>, ConnectError> {
        let refused = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectError::Failed(
                Fault::new()
                    .with_code("ECONNREFUSED")
                    .with_message("loopback refused the connection"),
            ));
        }

        let hub = Arc::new(EventHub::new());
        hub.push_update(ConnectionUpdate::state(ConnectionState::Opening));

        let mut creds = auth.creds;
        if !creds.registered {
            hub.push_update(ConnectionUpdate::qr(format!(
                "{},{},{},{}",
                Uuid::new_v4().simple(),
                BASE64.encode(&creds.noise_key.public),
                BASE64.encode(&creds.signed_identity_key.public),
                creds.adv_secret_key,
            )));
            creds.registered = true;
            creds.me = Some(Contact {
                id: LOOPBACK_USER.to_string(),
                name: Some("loopback".to_string()),
            });
            hub.push_credentials(creds.clone());
        }
        hub.push_update(ConnectionUpdate::state(ConnectionState::Open));

        Ok(Arc::new(LoopbackConnection {
            id: Uuid::new_v4(),
            user: creds.me.map(|me| me.id),
            keys: auth.keys,
            hub,
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackConnection {
    id: ConnectionId,
    user: Option<String>,
    keys: Arc<dyn CredentialStore>,
    hub: Arc<EventHub>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    /// Create the recipient's session record on first contact.
    async fn ensure_session(&self, jid: &str) -> Result<(), SendError> {
        let ids = [jid.to_string()];
        let existing = self
            .keys
            .bulk_get_keys(SESSION_CATEGORY, &ids)
            .await
            .map_err(|e| SendError::Failed(e.to_string()))?;
        if existing.get(jid).is_some_and(Option::is_some) {
            return Ok(());
        }

        let record = StoredValue::map([
            ("jid", StoredValue::from(jid)),
            ("rootKey", StoredValue::bytes(Uuid::new_v4().as_bytes().to_vec())),
        ]);
        let updates = BTreeMap::from([(
            SESSION_CATEGORY.to_string(),
            BTreeMap::from([(jid.to_string(), Some(record))]),
        )]);
        self.keys
            .bulk_set_keys(updates)
            .await
            .map_err(|e| SendError::Failed(e.to_string()))?;
        tracing::debug!(jid, "created loopback session");
        Ok(())
    }

    fn echo(&self, jid: &str, message: &OutboundMessage) {
        let message_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        self.hub.push_messages(MessagesUpsert {
            messages: vec![IncomingMessage {
                key: MessageKey {
                    remote_jid: jid.to_string(),
                    participant: None,
                    from_me: true,
                    id: Some(Uuid::new_v4().simple().to_string().to_uppercase()),
                },
                push_name: Some("loopback".to_string()),
                message_timestamp,
                message: Some(content(message)),
            }],
            kind: UpsertKind::Notify,
        });
    }
}

/// Message content keyed by content type.
fn content(message: &OutboundMessage) -> Map<String, Value> {
    let (kind, body) = match message {
        OutboundMessage::Text { text } => ("conversation", json!(text)),
        OutboundMessage::Image { url, caption } => {
            ("imageMessage", json!({ "url": url, "caption": caption }))
        }
        OutboundMessage::Video { url, caption } => {
            ("videoMessage", json!({ "url": url, "caption": caption }))
        }
        OutboundMessage::Audio { url, ptt } => ("audioMessage", json!({ "url": url, "ptt": ptt })),
    };
    Map::from_iter([(kind.to_string(), body)])
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn events(&self) -> EventStream {
        self.hub.subscribe()
    }

    fn user_id(&self) -> Option<String> {
        self.user.clone()
    }

    async fn jid_exists(&self, jid: &str) -> Result<bool, SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        Ok(jid.ends_with("@s.whatsapp.net") || jid.ends_with("@g.us"))
    }

    async fn send_message(&self, jid: &str, message: OutboundMessage) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        self.ensure_session(jid).await?;
        tracing::info!(jid, kind = message.kind(), ?message, "loopback delivered message");
        if self.user.as_deref() == Some(jid) {
            self.echo(jid, &message);
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(connection_id = %self.id, "loopback connection closed");
        }
    }
}
