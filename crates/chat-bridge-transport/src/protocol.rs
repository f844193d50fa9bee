//! Request and response bodies of the send API.
//!
//! Every field defaults when absent, so a missing field surfaces as
//! [`MissingParams`] (HTTP 400) instead of a body rejection.

use chat_bridge_core::OutboundMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A required request field was absent or empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Missing required parameters: {0}")]
pub struct MissingParams(pub &'static str);

/// `POST /send/text`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendTextRequest {
    pub jid: String,
    pub message: String,
}

impl SendTextRequest {
    /// Split into recipient and message.
    ///
    /// # Errors
    /// Returns [`MissingParams`] if `jid` or `message` is empty.
    pub fn into_parts(self) -> Result<(String, OutboundMessage), MissingParams> {
        if self.jid.is_empty() || self.message.is_empty() {
            return Err(MissingParams("jid and message"));
        }
        Ok((self.jid, OutboundMessage::Text { text: self.message }))
    }
}

/// `POST /send/image` and `POST /send/video`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendMediaRequest {
    pub jid: String,
    pub url: String,
    pub caption: String,
}

impl SendMediaRequest {
    /// # Errors
    /// Returns [`MissingParams`] if `jid` or `url` is empty.
    pub fn into_image(self) -> Result<(String, OutboundMessage), MissingParams> {
        let (jid, url, caption) = self.checked()?;
        Ok((jid, OutboundMessage::Image { url, caption }))
    }

    /// # Errors
    /// Returns [`MissingParams`] if `jid` or `url` is empty.
    pub fn into_video(self) -> Result<(String, OutboundMessage), MissingParams> {
        let (jid, url, caption) = self.checked()?;
        Ok((jid, OutboundMessage::Video { url, caption }))
    }

    fn checked(self) -> Result<(String, String, String), MissingParams> {
        if self.jid.is_empty() || self.url.is_empty() {
            return Err(MissingParams("jid and url"));
        }
        Ok((self.jid, self.url, self.caption))
    }
}

/// `POST /send/audio`. `ptt` sends the audio as a voice note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendAudioRequest {
    pub jid: String,
    pub url: String,
    pub ptt: bool,
}

impl SendAudioRequest {
    /// # Errors
    /// Returns [`MissingParams`] if `jid` or `url` is empty.
    pub fn into_parts(self) -> Result<(String, OutboundMessage), MissingParams> {
        if self.jid.is_empty() || self.url.is_empty() {
            return Err(MissingParams("jid and url"));
        }
        Ok((
            self.jid,
            OutboundMessage::Audio {
                url: self.url,
                ptt: self.ptt,
            },
        ))
    }
}

/// Response body of every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}
