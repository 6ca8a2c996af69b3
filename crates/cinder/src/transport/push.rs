//! WebSocket transport: a persistent `/ws/{session}` subscription with automatic
//! reconnection.

use std::sync::Arc;

use async_trait::async_trait;
use cinder_protocol::{ClientMessage, ServerMessage, SubscriptionFilter};
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::{Emitter, StreamTransport, TransportEvent, TransportStream, TurnRequest, channel};
use crate::backoff::BackoffPolicy;
use crate::config::{BackendConfig, PushConfig};
use crate::error::{TransportError, TransportResult};

/// How one socket connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketEnd {
    /// Normal close frame from the server, or the turn finished.
    Clean,
    /// The consumer cancelled; nothing more to report.
    Cancelled,
}

/// Push transport. Cheap to clone; clones share the subscription filter.
#[derive(Debug, Clone)]
pub struct PushTransport {
    client: reqwest::Client,
    backend: Arc<BackendConfig>,
    config: Arc<PushConfig>,
    backoff: BackoffPolicy,
    filter: Arc<watch::Sender<SubscriptionFilter>>,
}

impl PushTransport {
    pub fn new(
        backend: BackendConfig,
        config: PushConfig,
        backoff: BackoffPolicy,
    ) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Connect {
                url: backend.base_url.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let (filter, _) = watch::channel(config.filter());
        Ok(Self {
            client,
            backend: Arc::new(backend),
            config: Arc::new(config),
            backoff,
            filter: Arc::new(filter),
        })
    }

    /// Replace the subscription filter. Open sockets re-subscribe immediately.
    pub fn set_filter(&self, filter: SubscriptionFilter) {
        self.filter.send_replace(filter);
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.filter.borrow().clone()
    }

    fn socket_url(&self, session_id: &str) -> String {
        format!("{}/ws/{}", self.config.ws_url.trim_end_matches('/'), session_id)
    }

    /// Reconnect loop. `attempt` counts consecutive unclean closes and drops back
    /// to zero once a connection delivers its first server message.
    async fn run(&self, request: TurnRequest, emitter: Emitter) {
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                if attempt > self.config.max_reconnect_attempts {
                    error!(
                        "Push socket for session {} exceeded max reconnect attempts",
                        request.session_id
                    );
                    emitter
                        .emit(TransportEvent::Failed(TransportError::ReconnectExhausted {
                            attempts: attempt - 1,
                        }))
                        .await;
                    return;
                }

                let delay = self.backoff.delay(attempt);
                if !emitter
                    .emit(TransportEvent::Reconnecting { attempt, delay })
                    .await
                {
                    return;
                }
                tokio::select! {
                    biased;
                    _ = emitter.token().cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.connect_and_stream(&request, &emitter, &mut attempt).await {
                Ok(SocketEnd::Cancelled) => {
                    debug!("Push socket for session {} cancelled", request.session_id);
                    return;
                }
                Ok(SocketEnd::Clean) => {
                    info!("Push socket for session {} closed cleanly", request.session_id);
                    emitter.emit(TransportEvent::Completed).await;
                    return;
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Push socket for session {} failed: {}", request.session_id, e);
                    emitter.emit(TransportEvent::Failed(e)).await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "Push socket for session {} dropped (attempt {}): {}",
                        request.session_id, attempt, e
                    );
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        request: &TurnRequest,
        emitter: &Emitter,
        attempt: &mut u32,
    ) -> TransportResult<SocketEnd> {
        let url = self.socket_url(&request.session_id);
        debug!("Connecting push socket at {}", url);

        let connected = tokio::select! {
            biased;
            _ = emitter.token().cancelled() => return Ok(SocketEnd::Cancelled),
            connected = connect_async(url.as_str()) => connected,
        };
        let (socket, _) = connected.map_err(|e| map_connect_error(&url, e))?;
        let (mut write, mut read) = socket.split();

        let mut filter_rx = self.filter.subscribe();
        let filter = filter_rx.borrow_and_update().clone();
        send(&mut write, &ClientMessage::subscribe(&filter)).await?;

        let turn_mode = !request.query.trim().is_empty();
        if turn_mode {
            send(
                &mut write,
                &ClientMessage::Query {
                    text: request.query.clone(),
                    context: request.context.clone(),
                    correlation_id: request.correlation_id,
                },
            )
            .await?;
        }

        info!("Push socket open for session {}", request.session_id);

        let heartbeat = self.config.heartbeat_timeout();
        let mut established = false;
        loop {
            let message = tokio::select! {
                biased;
                _ = emitter.token().cancelled() => {
                    close(&mut write, "client cancelled").await;
                    return Ok(SocketEnd::Cancelled);
                }
                changed = filter_rx.changed() => {
                    if changed.is_ok() {
                        let filter = filter_rx.borrow_and_update().clone();
                        debug!("Re-subscribing push socket with {:?}", filter);
                        send(&mut write, &ClientMessage::subscribe(&filter)).await?;
                    }
                    continue;
                }
                message = tokio::time::timeout(heartbeat, read.next()) => message,
            };

            let message = match message {
                Err(_) => return Err(TransportError::HeartbeatTimeout(heartbeat)),
                Ok(None) => {
                    return Err(TransportError::Socket(
                        "connection dropped without close frame".to_string(),
                    ));
                }
                Ok(Some(Err(e))) => return Err(TransportError::Socket(e.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            if !established && message.is_text() {
                // the open only counts once the server has spoken on it
                established = true;
                *attempt = 0;
            }

            match message {
                Message::Text(text) => match ServerMessage::parse(text.as_str()) {
                    Ok(ServerMessage::Ping) => {
                        send(&mut write, &ClientMessage::Pong).await?;
                    }
                    Ok(ServerMessage::Pong) => {}
                    Ok(ServerMessage::Connected(ack)) => {
                        debug!("Push socket connected: {}", ack);
                    }
                    Ok(ServerMessage::Subscribed(ack)) => {
                        debug!("Push subscription acknowledged: {}", ack);
                    }
                    Ok(ServerMessage::Briefing(event)) => {
                        if let Err(e) = event.validate() {
                            warn!("Dropping invalid briefing {}: {}", event.event_id, e);
                            continue;
                        }
                        if !filter_rx.borrow().matches(&event) {
                            continue;
                        }
                        if !emitter.emit(TransportEvent::Briefing(event)).await {
                            return Ok(SocketEnd::Cancelled);
                        }
                    }
                    Ok(ServerMessage::Raw(raw)) => {
                        let turn_done = turn_mode && raw.turn_complete == Some(true);
                        if !emitter.emit(TransportEvent::Raw(*raw)).await {
                            return Ok(SocketEnd::Cancelled);
                        }
                        if turn_done {
                            close(&mut write, "turn complete").await;
                            return Ok(SocketEnd::Clean);
                        }
                    }
                    Ok(ServerMessage::Other(kind)) => {
                        debug!("Ignoring push message of type {:?}", kind);
                    }
                    Err(e) => {
                        warn!("Dropping malformed push message: {}", e);
                    }
                },
                Message::Close(frame) => {
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Normal => Ok(SocketEnd::Clean),
                        Some(frame) => Err(TransportError::Socket(format!(
                            "server closed with {}: {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        ))),
                        None => Err(TransportError::Socket(
                            "server closed without a status".to_string(),
                        )),
                    };
                }
                // tungstenite answers protocol pings itself
                _ => {}
            }
        }
    }
}

#[async_trait]
impl StreamTransport for PushTransport {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn create_session(&self) -> TransportResult<String> {
        super::bootstrap_session(&self.client, &self.backend).await
    }

    fn open(&self, request: TurnRequest, cancel: CancellationToken) -> TransportStream {
        let (emitter, stream) = channel(cancel);
        let this = self.clone();
        tokio::spawn(async move { this.run(request, emitter).await });
        stream
    }
}

async fn send<S>(write: &mut S, message: &ClientMessage) -> TransportResult<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)
        .map_err(|e| TransportError::Socket(format!("failed to encode {message:?}: {e}")))?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Socket(e.to_string()))
}

async fn close<S>(write: &mut S, reason: &'static str)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {}", e);
    }
}

fn map_connect_error(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => TransportError::Status {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Url(e) => TransportError::InvalidUrl(format!("{url}: {e}")),
        other => TransportError::Connect {
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}
