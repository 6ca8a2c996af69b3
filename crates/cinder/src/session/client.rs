//! Session client: drives one transport, the transformer and the store for a
//! logical conversation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cinder_protocol::CanonicalBriefingEvent;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::state::{SessionState, TurnReport};
use crate::backoff::BackoffPolicy;
use crate::canon::EventTransformer;
use crate::config::RetryConfig;
use crate::error::{FailureCause, SessionFailure};
use crate::store::EventStore;
use crate::transport::{StreamTransport, TransportEvent, TurnRequest};

/// Mutable session bookkeeping. Every write from a turn task re-checks
/// `generation` under this lock, so a task that was superseded or cancelled can
/// never touch state again.
#[derive(Debug, Default)]
struct Inner {
    generation: u64,
    cancel: Option<CancellationToken>,
    session_id: Option<String>,
    correlation_id: Option<Uuid>,
    local_log: Vec<CanonicalBriefingEvent>,
}

struct Shared<T> {
    transport: T,
    store: EventStore,
    backoff: BackoffPolicy,
    max_retries: u32,
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `state` if `generation` is still current.
    fn publish(&self, generation: u64, state: SessionState) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Store `event` if `generation` is still current. `None` means the turn was
    /// superseded; `Some(false)` means the store already held the event.
    fn commit(&self, generation: u64, event: CanonicalBriefingEvent) -> Option<bool> {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Dropping event {} from a superseded turn", event.event_id);
            return None;
        }
        let appended = self.store.append(event.clone());
        if appended {
            inner.local_log.push(event);
        }
        Some(appended)
    }
}

/// How one transport attempt ended.
enum AttemptEnd {
    Completed,
    Cancelled,
    Failed(FailureCause),
}

/// Handle to a turn started with [`SessionClient::start`].
#[derive(Debug)]
pub struct TurnHandle {
    correlation_id: Uuid,
    task: JoinHandle<TurnReport>,
}

impl TurnHandle {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait for the turn to settle.
    pub async fn wait(self) -> TurnReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!("Turn task {} ended abnormally: {}", self.correlation_id, e);
                TurnReport {
                    correlation_id: self.correlation_id,
                    outcome: SessionState::Cancelled,
                    attempts: 0,
                    reconnects: 0,
                    events: 0,
                }
            }
        }
    }
}

/// Orchestrates transport, transformer and store.
///
/// Cheap to clone; clones share one session.
pub struct SessionClient<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SessionClient<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: StreamTransport> SessionClient<T> {
    pub fn new(transport: T, store: EventStore, backoff: BackoffPolicy, retry: RetryConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                store,
                backoff,
                max_retries: retry.max_retries,
                inner: Mutex::new(Inner::default()),
                state,
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn store(&self) -> &EventStore {
        &self.shared.store
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Server session id, once bootstrapped.
    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    /// Correlation id of the current (or last) turn.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.shared.lock().correlation_id
    }

    /// Events committed by this session since the last [`Self::new_session`].
    pub fn local_log(&self) -> Vec<CanonicalBriefingEvent> {
        self.shared.lock().local_log.clone()
    }

    /// Start a turn for `query`, superseding any turn still in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, query: impl Into<String>, context: Value) -> TurnHandle {
        self.spawn_turn(query.into(), context)
    }

    /// Open the transport without sending a query. Only meaningful for transports
    /// that push events on their own; the turn ends when the server closes.
    pub fn watch(&self) -> TurnHandle {
        self.spawn_turn(String::new(), Value::Null)
    }

    /// Cancel the in-flight turn. Once this returns, nothing from that turn
    /// reaches the store. Returns `false` when no turn was running.
    pub fn cancel(&self) -> bool {
        let mut inner = self.shared.lock();
        if self.shared.state.borrow().is_settled() {
            return false;
        }
        if let Some(token) = inner.cancel.take() {
            token.cancel();
        }
        inner.generation += 1;
        self.shared.state.send_replace(SessionState::Cancelled);
        info!("Turn cancelled");
        true
    }

    /// Forget the server session and this session's local log. The shared store
    /// is left alone.
    pub fn new_session(&self) {
        let mut inner = self.shared.lock();
        if let Some(token) = inner.cancel.take() {
            token.cancel();
        }
        inner.generation += 1;
        inner.session_id = None;
        inner.correlation_id = None;
        inner.local_log.clear();
        self.shared.state.send_replace(SessionState::Idle);
        info!("Started a new session");
    }

    fn spawn_turn(&self, query: String, context: Value) -> TurnHandle {
        let correlation_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let generation = {
            let mut inner = self.shared.lock();
            if let Some(previous) = inner.cancel.replace(cancel.clone()) {
                debug!("Superseding in-flight turn");
                previous.cancel();
            }
            inner.generation += 1;
            inner.correlation_id = Some(correlation_id);
            self.shared
                .state
                .send_replace(SessionState::connecting(1));
            inner.generation
        };

        let span = tracing::info_span!(
            "turn",
            correlation_id = %correlation_id,
            transport = self.shared.transport.name()
        );
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(
            async move {
                let turn = Turn {
                    shared,
                    generation,
                    correlation_id,
                    cancel,
                };
                turn.run(query, context).await
            }
            .instrument(span),
        );

        TurnHandle {
            correlation_id,
            task,
        }
    }
}

/// One turn's task-local state.
struct Turn<T> {
    shared: Arc<Shared<T>>,
    generation: u64,
    correlation_id: Uuid,
    cancel: CancellationToken,
}

impl<T: StreamTransport> Turn<T> {
    async fn run(self, query: String, context: Value) -> TurnReport {
        let mut transformer = EventTransformer::new(self.correlation_id);
        let mut report = TurnReport {
            correlation_id: self.correlation_id,
            outcome: SessionState::Cancelled,
            attempts: 0,
            reconnects: 0,
            events: 0,
        };

        loop {
            report.attempts += 1;
            if !self
                .shared
                .publish(self.generation, SessionState::connecting(report.attempts))
            {
                return report;
            }

            let end = self
                .attempt(&query, &context, &mut transformer, &mut report)
                .await;

            let cause = match end {
                AttemptEnd::Completed => {
                    if self.shared.publish(self.generation, SessionState::Completed) {
                        report.outcome = SessionState::Completed;
                        info!("Turn completed with {} event(s)", report.events);
                    }
                    return report;
                }
                AttemptEnd::Cancelled => return report,
                AttemptEnd::Failed(cause) => cause,
            };

            let retryable = match &cause {
                FailureCause::Transport(e) => e.is_retryable(),
                FailureCause::Protocol(e) => e.class().should_retry(),
            };
            if retryable && report.attempts <= self.shared.max_retries {
                let delay = self.shared.backoff.delay(report.attempts);
                warn!(
                    "Turn attempt {} failed ({:?}); retrying in {:?}",
                    report.attempts, cause, delay
                );
                // a retried turn starts its invocations from scratch
                transformer.reset(self.correlation_id);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return report,
                    _ = tokio::time::sleep(delay) => {}
                }
                report.reconnects += 1;
                continue;
            }

            let failure = SessionFailure::new(cause, report.attempts);
            error!("Turn failed after {} attempt(s): {:?}", report.attempts, failure.cause);
            if self
                .shared
                .publish(self.generation, SessionState::Failed(failure.clone()))
            {
                report.outcome = SessionState::Failed(failure);
            }
            return report;
        }
    }

    async fn attempt(
        &self,
        query: &str,
        context: &Value,
        transformer: &mut EventTransformer,
        report: &mut TurnReport,
    ) -> AttemptEnd {
        let session_id = match self.ensure_session().await {
            Ok(Some(id)) => id,
            Ok(None) => return AttemptEnd::Cancelled,
            Err(cause) => return AttemptEnd::Failed(cause),
        };

        let request = TurnRequest {
            session_id,
            correlation_id: self.correlation_id,
            query: query.to_string(),
            context: context.clone(),
        };
        // dropping the stream at the end of this attempt releases the connection
        let mut stream = self
            .shared
            .transport
            .open(request, self.cancel.child_token());
        let mut streaming = false;

        loop {
            let Some(event) = stream.next().await else {
                return AttemptEnd::Cancelled;
            };

            if !streaming && matches!(event, TransportEvent::Raw(_) | TransportEvent::Briefing(_)) {
                streaming = true;
                if !self.shared.publish(self.generation, SessionState::Streaming) {
                    return AttemptEnd::Cancelled;
                }
            }

            match event {
                TransportEvent::Raw(raw) => match transformer.transform(&raw) {
                    Ok(Some(event)) => match self.shared.commit(self.generation, event) {
                        Some(true) => report.events += 1,
                        Some(false) => {}
                        None => return AttemptEnd::Cancelled,
                    },
                    Ok(None) => {}
                    Err(e) => return AttemptEnd::Failed(FailureCause::Protocol(e)),
                },
                TransportEvent::Briefing(event) => match self.shared.commit(self.generation, *event) {
                    Some(true) => report.events += 1,
                    Some(false) => {}
                    None => return AttemptEnd::Cancelled,
                },
                TransportEvent::Reconnecting { attempt, delay } => {
                    report.reconnects += 1;
                    streaming = false;
                    debug!("Transport reconnecting (attempt {}) in {:?}", attempt, delay);
                    // the reconnected transport replays the turn from its start
                    transformer.reset(self.correlation_id);
                    if !self.shared.publish(
                        self.generation,
                        SessionState::Connecting {
                            attempt: report.attempts,
                            reconnect: attempt,
                        },
                    ) {
                        return AttemptEnd::Cancelled;
                    }
                }
                TransportEvent::Completed => return AttemptEnd::Completed,
                TransportEvent::Failed(e) => {
                    return AttemptEnd::Failed(FailureCause::Transport(e));
                }
            }
        }
    }

    /// The server session id, bootstrapping one if needed. `Ok(None)` means the
    /// turn was cancelled meanwhile.
    async fn ensure_session(&self) -> Result<Option<String>, FailureCause> {
        if let Some(id) = self.shared.lock().session_id.clone() {
            return Ok(Some(id));
        }

        let created = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            created = self.shared.transport.create_session() => created,
        };
        let id = created.map_err(FailureCause::Transport)?;

        let mut inner = self.shared.lock();
        if inner.generation != self.generation {
            return Ok(None);
        }
        inner.session_id = Some(id.clone());
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use cinder_protocol::{AgentRole, Content, Part, RawProtocolEvent};

    use super::*;
    use crate::error::{TransportError, TransportResult};
    use crate::transport::{TransportStream, channel};

    #[derive(Debug, Clone)]
    enum Step {
        Emit(TransportEvent),
        /// Stay open until cancelled.
        Hang,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        opens: AtomicU32,
        sessions: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Vec<Step>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn create_session(&self) -> TransportResult<String> {
            let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("session-{n}"))
        }

        fn open(&self, _request: TurnRequest, cancel: CancellationToken) -> TransportStream {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Step::Emit(TransportEvent::Completed)]);
            let (emitter, stream) = channel(cancel);
            tokio::spawn(async move {
                for step in script {
                    match step {
                        Step::Emit(event) => {
                            if !emitter.emit(event).await {
                                return;
                            }
                        }
                        Step::Hang => emitter.token().cancelled().await,
                    }
                }
            });
            stream
        }
    }

    fn text(invocation: &str, partial: bool, body: &str) -> Step {
        Step::Emit(TransportEvent::Raw(RawProtocolEvent {
            id: format!("{invocation}-{partial}"),
            invocation_id: Some(invocation.to_string()),
            author: Some("burn_analyst".to_string()),
            content: Some(Content {
                role: Some("model".to_string()),
                parts: vec![Part::text(body)],
            }),
            partial: Some(partial),
            ..Default::default()
        }))
    }

    fn agent_error(code: &str) -> Step {
        Step::Emit(TransportEvent::Raw(RawProtocolEvent {
            id: "err".to_string(),
            error_code: Some(code.to_string()),
            ..Default::default()
        }))
    }

    fn completed() -> Step {
        Step::Emit(TransportEvent::Completed)
    }

    fn client(transport: ScriptedTransport, max_retries: u32) -> SessionClient<ScriptedTransport> {
        SessionClient::new(
            transport,
            EventStore::new(50),
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            RetryConfig { max_retries },
        )
    }

    #[tokio::test]
    async fn test_retryable_error_then_success_reconnects_once() {
        let transport = ScriptedTransport::new(vec![
            vec![agent_error("UNAVAILABLE")],
            vec![
                text("a", true, "Burn sev"),
                text("a", false, "erity is high."),
                completed(),
            ],
        ]);
        let client = client(transport, 3);

        let report = client.start("How bad is the burn?", Value::Null).wait().await;

        assert!(report.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.reconnects, 1);
        assert_eq!(report.attempts, 2);
        assert_eq!(client.state(), SessionState::Completed);
        assert_eq!(client.transport().opens.load(Ordering::SeqCst), 2);
        assert_eq!(client.transport().sessions.load(Ordering::SeqCst), 1);

        let stored = client.store().snapshot();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].source_agent, AgentRole::BurnAnalyst);
        assert_eq!(stored[0].correlation_id, report.correlation_id);
        assert_eq!(client.local_log().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_fails_without_retry() {
        let transport = ScriptedTransport::new(vec![vec![agent_error("PERMISSION_DENIED")]]);
        let client = client(transport, 3);

        let report = client.start("q", Value::Null).wait().await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.cause, FailureCause::Protocol(_)));
        assert_eq!(report.reconnects, 0);
        assert_eq!(client.transport().opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_error_code_is_not_retried() {
        let transport = ScriptedTransport::new(vec![vec![agent_error("SOLAR_FLARE")]]);
        let client = client(transport, 3);

        let report = client.start("q", Value::Null).wait().await;
        assert_eq!(report.failure().map(|f| f.attempts), Some(1));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let transport = ScriptedTransport::new(vec![
            vec![Step::Emit(TransportEvent::Failed(TransportError::Status { status: 503 }))],
            vec![agent_error("RESOURCE_EXHAUSTED")],
            vec![agent_error("UNAVAILABLE")],
            vec![completed()],
        ]);
        let client = client(transport, 2);

        let report = client.start("q", Value::Null).wait().await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.attempts, 3);
        assert_eq!(report.reconnects, 2);
        assert_eq!(client.transport().opens.load(Ordering::SeqCst), 3);
        assert!(matches!(client.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_transport_reconnect_discards_partial_fragments() {
        let transport = ScriptedTransport::new(vec![vec![
            text("a", true, "Burn sev"),
            Step::Emit(TransportEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(1),
            }),
            text("a", false, "Burn severity is high."),
            completed(),
        ]]);
        let client = client(transport, 0);

        let report = client.start("q", Value::Null).wait().await;

        assert!(report.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.reconnects, 1);
        let stored = client.store().snapshot();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content.detail, "Burn severity is high.");
    }

    #[tokio::test]
    async fn test_cancel_drops_late_events() {
        let transport = ScriptedTransport::new(vec![vec![text("a", true, "Burn sev"), Step::Hang]]);
        let client = client(transport, 3);
        let mut state = client.watch_state();

        let handle = client.start("q", Value::Null);
        state
            .wait_for(|s| *s == SessionState::Streaming)
            .await
            .unwrap();

        assert!(client.cancel());
        assert_eq!(client.state(), SessionState::Cancelled);
        assert!(!client.cancel());

        let report = handle.wait().await;
        assert_eq!(report.outcome, SessionState::Cancelled);
        assert!(client.store().is_empty());
        assert_eq!(client.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_commit() {
        let client = client(ScriptedTransport::default(), 0);
        let stale = client.shared.lock().generation;
        client.new_session();

        let raw = RawProtocolEvent {
            id: "x".to_string(),
            content: Some(Content {
                role: None,
                parts: vec![Part::text("Late.")],
            }),
            ..Default::default()
        };
        let event = EventTransformer::new(Uuid::new_v4())
            .transform(&raw)
            .unwrap()
            .unwrap();
        assert_eq!(client.shared.commit(stale, event), None);
        assert!(!client.shared.publish(stale, SessionState::Completed));
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_new_session_resets_identity_but_not_store() {
        let transport = ScriptedTransport::new(vec![
            vec![text("a", false, "First finding."), completed()],
            vec![text("b", false, "Second finding."), completed()],
        ]);
        let client = client(transport, 0);

        let first = client.start("one", Value::Null).wait().await;
        assert_eq!(client.session_id().as_deref(), Some("session-1"));

        client.new_session();
        assert_eq!(client.session_id(), None);
        assert!(client.local_log().is_empty());
        assert_eq!(client.store().len(), 1);

        let second = client.start("two", Value::Null).wait().await;
        assert_ne!(first.correlation_id, second.correlation_id);
        assert_eq!(client.session_id().as_deref(), Some("session-2"));
        assert_eq!(client.local_log().len(), 1);
        assert_eq!(client.store().len(), 2);
    }

    #[tokio::test]
    async fn test_start_supersedes_previous_turn() {
        let transport = ScriptedTransport::new(vec![
            vec![text("a", true, "Stale"), Step::Hang],
            vec![text("b", false, "Fresh."), completed()],
        ]);
        let client = client(transport, 0);
        let mut state = client.watch_state();

        let old = client.start("old", Value::Null);
        state
            .wait_for(|s| *s == SessionState::Streaming)
            .await
            .unwrap();
        let new = client.start("new", Value::Null);

        assert_eq!(old.wait().await.outcome, SessionState::Cancelled);
        assert!(new.wait().await.is_completed());
        assert_eq!(client.store().len(), 1);
    }
}
