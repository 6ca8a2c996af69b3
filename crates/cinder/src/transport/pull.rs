//! Server-Sent-Events transport: one long-lived `POST /run_sse` per turn.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::header::ACCEPT;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Emitter, StreamTransport, TransportEvent, TransportStream, TurnRequest, channel};
use crate::config::{BackendConfig, PullConfig};
use crate::error::{TransportError, TransportResult};
use crate::frame::FrameParser;

/// Pull transport. Cheap to clone; clones share the HTTP connection pool.
///
/// A failed stream is reported, never retried here; the session client owns
/// turn-level retry.
#[derive(Debug, Clone)]
pub struct PullTransport {
    client: reqwest::Client,
    backend: Arc<BackendConfig>,
    config: Arc<PullConfig>,
}

impl PullTransport {
    pub fn new(backend: BackendConfig, config: PullConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| TransportError::Connect {
                url: backend.base_url.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            backend: Arc::new(backend),
            config: Arc::new(config),
        })
    }

    fn run_url(&self) -> String {
        format!("{}/run_sse", self.backend.base_url.trim_end_matches('/'))
    }

    async fn stream_turn(&self, request: &TurnRequest, emitter: &Emitter) -> TransportResult<()> {
        let url = self.run_url();
        let body = json!({
            "appName": self.backend.app_name,
            "userId": self.backend.user_id,
            "sessionId": request.session_id,
            "newMessage": {
                "role": "user",
                "parts": [{"text": request.query}],
            },
            "streaming": true,
            "stateDelta": request.context,
        });

        debug!(
            "Opening SSE stream at {} for session {} (correlation {})",
            url, request.session_id, request.correlation_id
        );

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .timeout(self.config.request_timeout())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        info!("SSE stream open for session {}", request.session_id);

        let mut parser = FrameParser::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| TransportError::BodyRead(e.to_string()))?;
            for event in parser.feed(&chunk) {
                if !emitter.emit(TransportEvent::Raw(event)).await {
                    return Ok(());
                }
            }
            if parser.is_finished() {
                break;
            }
        }

        for event in parser.finish() {
            if !emitter.emit(TransportEvent::Raw(event)).await {
                return Ok(());
            }
        }

        if !parser.is_finished() {
            debug!("SSE body ended without end-of-stream sentinel");
        }
        if parser.dropped() > 0 {
            warn!(
                "Dropped {} malformed frame(s) on session {}",
                parser.dropped(),
                request.session_id
            );
        }
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for PullTransport {
    fn name(&self) -> &'static str {
        "pull"
    }

    async fn create_session(&self) -> TransportResult<String> {
        super::bootstrap_session(&self.client, &self.backend).await
    }

    fn open(&self, request: TurnRequest, cancel: CancellationToken) -> TransportStream {
        let (emitter, stream) = channel(cancel);
        let this = self.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = emitter.token().cancelled() => {
                    debug!("SSE stream for session {} cancelled", request.session_id);
                    return;
                }
                outcome = this.stream_turn(&request, &emitter) => outcome,
            };

            let last = match outcome {
                Ok(()) => TransportEvent::Completed,
                Err(e) => {
                    warn!("SSE stream for session {} failed: {}", request.session_id, e);
                    TransportEvent::Failed(e)
                }
            };
            emitter.emit(last).await;
        });

        stream
    }
}
