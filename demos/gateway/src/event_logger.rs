//! Forwards received message batches to an external logging endpoint.

use std::time::Duration;

use chat_bridge_core::MessagesUpsert;
use tokio::sync::broadcast::{self, error::RecvError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EventLogger {
    client: reqwest::Client,
    url: String,
}

impl EventLogger {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    /// POST one batch as JSON.
    pub async fn post(&self, upsert: &MessagesUpsert) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(upsert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Forward batches until the channel closes. A failed POST is logged and
    /// the batch skipped.
    pub async fn run(self, mut incoming: broadcast::Receiver<MessagesUpsert>) {
        tracing::info!(url = %self.url, "forwarding received messages to event logger");
        loop {
            match incoming.recv().await {
                Ok(upsert) => match self.post(&upsert).await {
                    Ok(()) => tracing::debug!(url = %self.url, "event sent to logger"),
                    Err(e) => {
                        tracing::error!(url = %self.url, error = %e, "failed to send event to logger");
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
