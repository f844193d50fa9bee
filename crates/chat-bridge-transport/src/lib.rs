//! Transport layer for the chat gateway.
//!
//! Provides:
//! - Request/response bodies of the send API (JSON)
//! - HTTP router over any `MessageSender` (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

pub use protocol::{ApiResponse, MissingParams, SendAudioRequest, SendMediaRequest, SendTextRequest};
