//! HTTP send API.
//!
//! ```ignore
//! let app = Router::new().merge(router(supervisor));
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use chat_bridge_core::{MessageSender, OutboundMessage, SendError};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::protocol::{
    ApiResponse, MissingParams, SendAudioRequest, SendMediaRequest, SendTextRequest,
};

/// Handler state.
#[derive(Clone)]
struct ApiState {
    sender: Arc<dyn MessageSender>,
}

/// Why a send request failed.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    MissingParams(#[from] MissingParams),
    #[error("JID {0} is not registered")]
    UnknownJid(String),
    #[error("Failed to send {kind} message")]
    Send {
        kind: &'static str,
        #[source]
        source: SendError,
    },
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingParams(_) | Self::UnknownJid(_) => StatusCode::BAD_REQUEST,
            Self::Send { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ApiResponse::failure(self.to_string()))).into_response()
    }
}

/// Build the send API router over `sender`.
#[must_use]
pub fn router(sender: Arc<dyn MessageSender>) -> Router {
    Router::new()
        .route("/send/text", post(send_text))
        .route("/send/image", post(send_image))
        .route("/send/video", post(send_video))
        .route("/send/audio", post(send_audio))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { sender })
}

async fn send_text(
    State(state): State<ApiState>,
    Json(req): Json<SendTextRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let (jid, message) = req.into_parts()?;

    let exists = state
        .sender
        .jid_exists(&jid)
        .await
        .map_err(|source| ApiError::Send {
            kind: "text",
            source,
        })?;
    if !exists {
        tracing::error!(jid = %jid, "recipient is not registered");
        return Err(ApiError::UnknownJid(jid));
    }

    deliver(&state, jid, message).await
}

async fn send_image(
    State(state): State<ApiState>,
    Json(req): Json<SendMediaRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let (jid, message) = req.into_image()?;
    deliver(&state, jid, message).await
}

async fn send_video(
    State(state): State<ApiState>,
    Json(req): Json<SendMediaRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let (jid, message) = req.into_video()?;
    deliver(&state, jid, message).await
}

async fn send_audio(
    State(state): State<ApiState>,
    Json(req): Json<SendAudioRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let (jid, message) = req.into_parts()?;
    deliver(&state, jid, message).await
}

async fn deliver(
    state: &ApiState,
    jid: String,
    message: OutboundMessage,
) -> Result<Json<ApiResponse>, ApiError> {
    let kind = message.kind();
    tracing::info!(jid = %jid, kind, "sending message");

    match state.sender.send_message(&jid, message).await {
        Ok(()) => {
            tracing::info!(jid = %jid, kind, "message sent");
            Ok(Json(ApiResponse::ok(format!("{} message sent", capitalize(kind)))))
        }
        Err(source) => {
            tracing::error!(jid = %jid, kind, error = %source, "failed to send message");
            Err(ApiError::Send { kind, source })
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    /// Knows every JID except ones starting with `0`; fails sends to `fail`.
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, OutboundMessage)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn jid_exists(&self, jid: &str) -> Result<bool, SendError> {
            Ok(!jid.starts_with('0'))
        }

        async fn send_message(&self, jid: &str, message: OutboundMessage) -> Result<(), SendError> {
            if jid == "fail" {
                return Err(SendError::NotConnected);
            }
            self.sent.lock().unwrap().push((jid.to_string(), message));
            Ok(())
        }
    }

    async fn post_json(
        sender: &Arc<RecordingSender>,
        path: &str,
        body: &Value,
    ) -> (StatusCode, Value) {
        let app = router(Arc::clone(sender) as Arc<dyn MessageSender>);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_send_text() {
        let sender = Arc::new(RecordingSender::default());
        let (status, body) = post_json(
            &sender,
            "/send/text",
            &json!({ "jid": "15550001111@s.whatsapp.net", "message": "hello" }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "message": "Text message sent" }));
        assert_eq!(
            *sender.sent.lock().unwrap(),
            vec![(
                "15550001111@s.whatsapp.net".to_string(),
                OutboundMessage::Text {
                    text: "hello".to_string()
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_send_text_missing_params() {
        let sender = Arc::new(RecordingSender::default());
        let (status, body) = post_json(&sender, "/send/text", &json!({ "jid": "1555" })).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Missing required parameters: jid and message");
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_text_unknown_jid() {
        let sender = Arc::new(RecordingSender::default());
        let (status, body) =
            post_json(&sender, "/send/text", &json!({ "jid": "0000", "message": "hi" })).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "JID 0000 is not registered");
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_media_endpoints() {
        let sender = Arc::new(RecordingSender::default());

        let (status, _) = post_json(
            &sender,
            "/send/image",
            &json!({ "jid": "1", "url": "https://x/i.png", "caption": "look" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            post_json(&sender, "/send/video", &json!({ "jid": "1", "url": "https://x/v.mp4" }))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Video message sent");

        let (status, _) = post_json(
            &sender,
            "/send/audio",
            &json!({ "jid": "1", "url": "https://x/a.ogg", "ptt": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let sent: Vec<OutboundMessage> = sender
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect();
        assert_eq!(
            sent,
            vec![
                OutboundMessage::Image {
                    url: "https://x/i.png".to_string(),
                    caption: "look".to_string(),
                },
                OutboundMessage::Video {
                    url: "https://x/v.mp4".to_string(),
                    caption: String::new(),
                },
                OutboundMessage::Audio {
                    url: "https://x/a.ogg".to_string(),
                    ptt: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_media_missing_url() {
        let sender = Arc::new(RecordingSender::default());
        for path in ["/send/image", "/send/video", "/send/audio"] {
            let (status, body) = post_json(&sender, path, &json!({ "jid": "1" })).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
            assert_eq!(body["error"], "Missing required parameters: jid and url");
        }
    }

    #[tokio::test]
    async fn test_send_failure_is_server_error() {
        let sender = Arc::new(RecordingSender::default());
        let (status, body) = post_json(
            &sender,
            "/send/audio",
            &json!({ "jid": "fail", "url": "https://x/a.ogg" }),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "success": false, "error": "Failed to send audio message" }));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("image"), "Image");
        assert_eq!(capitalize(""), "");
    }
}
