//! Events raised by a live connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Credentials, Fault};

/// Lifecycle state of the remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Close,
}

/// A connection-state transition, possibly carrying a pairing QR payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
    /// Why the connection closed. Only meaningful with `Close`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<Fault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    #[must_use]
    pub fn state(connection: ConnectionState) -> Self {
        Self {
            connection: Some(connection),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn closed(fault: Option<Fault>) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: fault,
            qr: None,
        }
    }

    #[must_use]
    pub fn qr(payload: impl Into<String>) -> Self {
        Self {
            qr: Some(payload.into()),
            ..Self::default()
        }
    }
}

/// Why a batch of messages arrived: `notify` for new messages, `append`
/// for history the server replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Addressing of a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Chat the message belongs to: a user or a group JID.
    pub remote_jid: String,
    /// Author inside a group chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A received message. The content stays opaque JSON keyed by content type
/// (`conversation`, `imageMessage`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub message_timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Map<String, Value>>,
}

/// Loggable facts about a message, without its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub sender_name: String,
    /// Sender JID without the server part.
    pub sender_id: String,
    pub is_group: bool,
    /// Comma-separated content types, `unknown` when there is no content.
    pub message_type: String,
    pub timestamp: u64,
}

impl IncomingMessage {
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.key.remote_jid.ends_with("@g.us")
    }

    #[must_use]
    pub fn summary(&self) -> MessageSummary {
        let sender = self.key.participant.as_deref().unwrap_or(&self.key.remote_jid);
        let sender_id = sender.split('@').next().unwrap_or_default().to_string();
        let message_type = self
            .message
            .as_ref()
            .map(|content| content.keys().map(String::as_str).collect::<Vec<_>>().join(", "))
            .filter(|types| !types.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        MessageSummary {
            sender_name: self.push_name.clone().unwrap_or_else(|| sender_id.clone()),
            sender_id,
            is_group: self.is_group(),
            message_type,
            timestamp: self.message_timestamp,
        }
    }
}

/// A batch of received messages, serialized the way event consumers expect
/// it: `{"messages": [...], "type": "notify"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub messages: Vec<IncomingMessage>,
    #[serde(rename = "type")]
    pub kind: UpsertKind,
}

/// Event raised by a connection, delivered in the order raised.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Update(ConnectionUpdate),
    /// Credential material changed and should be persisted.
    CredentialsUpdate(Box<Credentials>),
    /// Messages were received.
    Messages(MessagesUpsert),
}

impl From<ConnectionUpdate> for ConnectionEvent {
    fn from(update: ConnectionUpdate) -> Self {
        Self::Update(update)
    }
}

impl From<Credentials> for ConnectionEvent {
    fn from(creds: Credentials) -> Self {
        Self::CredentialsUpdate(Box::new(creds))
    }
}

impl From<MessagesUpsert> for ConnectionEvent {
    fn from(upsert: MessagesUpsert) -> Self {
        Self::Messages(upsert)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_group_message_summary() {
        let upsert: MessagesUpsert = serde_json::from_value(json!({
            "type": "notify",
            "messages": [{
                "key": {
                    "remoteJid": "1203630@g.us",
                    "participant": "15550001111@s.whatsapp.net",
                    "fromMe": false,
                    "id": "3EB0"
                },
                "pushName": "Ana",
                "messageTimestamp": 1_700_000_000,
                "message": { "conversation": "hello" }
            }]
        }))
        .unwrap();

        assert_eq!(upsert.kind, UpsertKind::Notify);
        assert_eq!(
            upsert.messages[0].summary(),
            MessageSummary {
                sender_name: "Ana".to_string(),
                sender_id: "15550001111".to_string(),
                is_group: true,
                message_type: "conversation".to_string(),
                timestamp: 1_700_000_000,
            }
        );
    }

    #[test]
    fn test_private_message_without_content() {
        let message = IncomingMessage {
            key: MessageKey {
                remote_jid: "15550001111@s.whatsapp.net".to_string(),
                ..MessageKey::default()
            },
            ..IncomingMessage::default()
        };

        let summary = message.summary();
        assert_eq!(summary.sender_name, "15550001111");
        assert!(!summary.is_group);
        assert_eq!(summary.message_type, "unknown");
    }

    #[test]
    fn test_upsert_serializes_type_field() {
        let upsert = MessagesUpsert {
            messages: Vec::new(),
            kind: UpsertKind::Append,
        };
        assert_eq!(
            serde_json::to_value(&upsert).unwrap(),
            json!({ "messages": [], "type": "append" })
        );
    }
}
