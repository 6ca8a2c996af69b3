//! Stream transports.
//!
//! Both transports deliver a turn's output as a [`TransportStream`] of
//! [`TransportEvent`]s. The pull transport opens one SSE request per turn and never
//! retries on its own; the push transport keeps a WebSocket open and reconnects
//! after unclean closes. Cancellation is an explicit [`CancellationToken`] checked
//! at every suspension point, so once it fires no further event is delivered.

mod pull;
mod push;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use cinder_protocol::{CanonicalBriefingEvent, RawProtocolEvent};
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::{TransportError, TransportResult};

pub use pull::PullTransport;
pub use push::PushTransport;

/// Events buffered between a transport task and its consumer.
const STREAM_BUFFER: usize = 64;

/// One conversational turn to send to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub session_id: String,
    pub correlation_id: Uuid,
    pub query: String,
    /// Free-form state handed to the agents alongside the query.
    pub context: Value,
}

/// What a transport yields.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An agent-native fragment; needs assembly.
    Raw(RawProtocolEvent),
    /// A finished event, transformed server-side.
    Briefing(Box<CanonicalBriefingEvent>),
    /// The transport lost its connection and will retry after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The stream ended normally. Always the last event.
    Completed,
    /// The stream ended with an error. Always the last event.
    Failed(TransportError),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Contract shared by the pull and push transports.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create a server-side session; the returned id keys every later turn.
    async fn create_session(&self) -> TransportResult<String>;

    /// Start streaming `request`. Returns immediately; network work happens on a
    /// spawned task that stops as soon as `cancel` fires.
    fn open(&self, request: TurnRequest, cancel: CancellationToken) -> TransportStream;
}

/// Receiving half of an open transport.
///
/// Dropping the stream cancels it.
pub struct TransportStream {
    rx: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TransportStream {
    /// Next event, or `None` once the stream has ended or been cancelled.
    pub async fn next(&mut self) -> Option<TransportEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Stop reading and release the connection. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TransportStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sending half, owned by the transport task.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Deliver one event. Returns `false` once the stream was cancelled or the
    /// consumer went away; the caller should stop.
    pub(crate) async fn emit(&self, event: TransportEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub(crate) fn channel(cancel: CancellationToken) -> (Emitter, TransportStream) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    (
        Emitter {
            tx,
            cancel: cancel.clone(),
        },
        TransportStream { rx, cancel },
    )
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    id: String,
}

/// `POST {base}/apps/{app}/users/{user}/sessions`, used by both transports.
pub(crate) async fn bootstrap_session(
    client: &reqwest::Client,
    backend: &BackendConfig,
) -> TransportResult<String> {
    let url = format!(
        "{}/apps/{}/users/{}/sessions",
        backend.base_url.trim_end_matches('/'),
        backend.app_name,
        backend.user_id
    );
    debug!("Creating backend session at {}", url);

    let response = client
        .post(&url)
        .timeout(backend.bootstrap_timeout())
        .json(&serde_json::json!({}))
        .send()
        .await
        .map_err(|e| TransportError::from_reqwest(&url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
        });
    }

    let created: SessionCreated = response
        .json()
        .await
        .map_err(|e| TransportError::Bootstrap(e.to_string()))?;
    if created.id.trim().is_empty() {
        return Err(TransportError::Bootstrap(
            "backend returned an empty session id".to_string(),
        ));
    }

    info!("Created backend session {}", created.id);
    Ok(created.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_yields_until_cancelled() {
        let (emitter, mut stream) = channel(CancellationToken::new());

        assert!(emitter.emit(TransportEvent::Completed).await);
        assert_eq!(stream.next().await, Some(TransportEvent::Completed));

        stream.cancel();
        assert!(!emitter.emit(TransportEvent::Completed).await);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_buffered_event_is_dropped_after_cancel() {
        let (emitter, mut stream) = channel(CancellationToken::new());
        assert!(emitter.emit(TransportEvent::Completed).await);

        stream.cancel();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_emitter() {
        let (emitter, stream) = channel(CancellationToken::new());
        drop(stream);
        assert!(emitter.token().is_cancelled());
        assert!(!emitter.emit(TransportEvent::Completed).await);
    }
}
