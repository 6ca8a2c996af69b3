//! Assembly of raw agent fragments into canonical briefings.
//!
//! The transformer is stateful per session: fragments sharing an invocation id are
//! buffered until the final (`partial = false`) fragment arrives, and only then is a
//! single [`CanonicalBriefingEvent`] built. Nothing partial ever leaves this module.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use cinder_protocol::{
    AgentRole, BriefingContent, BriefingHints, CanonicalBriefingEvent, Citation, EventType,
    PartKind, ProofLayer, RawProtocolEvent, Severity, UiBinding, UiTarget,
};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use super::classify::{ErrorCode, ProtocolError};

/// Maximum characters in a briefing summary.
pub const SUMMARY_MAX_CHARS: usize = 240;

/// Maximum characters in a citation excerpt.
pub const EXCERPT_MAX_CHARS: usize = 280;

/// Text accumulated for one invocation.
#[derive(Debug, Default)]
struct Assembly {
    author: Option<String>,
    text: String,
    thoughts: String,
    citations: Vec<Citation>,
    hints: BriefingHints,
    fragments: usize,
}

impl Assembly {
    fn absorb(&mut self, raw: &RawProtocolEvent) {
        self.fragments += 1;
        if self.author.is_none() {
            self.author = raw.author.clone();
        }

        for part in raw.parts() {
            match part.kind() {
                PartKind::Text(text) => self.text.push_str(text),
                PartKind::Thought(text) => self.thoughts.push_str(text),
                PartKind::ToolResult(result) => self.citations.push(Citation {
                    source_type: "tool".to_string(),
                    id: result.id.clone().unwrap_or_else(|| result.name.clone()),
                    uri: citation_uri(&result.response)
                        .unwrap_or_else(|| format!("tool://{}", result.name)),
                    excerpt: excerpt(&result.response),
                }),
                PartKind::CodeResult(result) => self.citations.push(Citation {
                    source_type: "code_execution".to_string(),
                    id: format!("code-{}", self.citations.len() + 1),
                    uri: format!(
                        "code://{}",
                        result.outcome.as_deref().unwrap_or("OUTCOME_UNSPECIFIED")
                    ),
                    excerpt: truncate_chars(
                        result.output.as_deref().unwrap_or_default(),
                        EXCERPT_MAX_CHARS,
                    ),
                }),
                PartKind::Empty => {}
            }
        }

        if let Some(hints) = &raw.custom_metadata {
            self.hints.merge(hints.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.thoughts.trim().is_empty() && self.citations.is_empty()
    }
}

/// Converts raw protocol events into canonical briefings for one session.
#[derive(Debug)]
pub struct EventTransformer {
    correlation_id: Uuid,
    assemblies: HashMap<String, Assembly>,
}

impl EventTransformer {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            assemblies: HashMap::new(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Number of invocations with buffered fragments.
    pub fn pending_invocations(&self) -> usize {
        self.assemblies.len()
    }

    /// Discard every accumulation buffer and adopt a new correlation id.
    pub fn reset(&mut self, correlation_id: Uuid) {
        if !self.assemblies.is_empty() {
            debug!(
                "Discarding {} unfinished invocation(s) on transformer reset",
                self.assemblies.len()
            );
        }
        self.assemblies.clear();
        self.correlation_id = correlation_id;
    }

    /// Feed one raw event.
    ///
    /// Returns `Ok(Some(..))` exactly once per invocation, on its final fragment;
    /// `Ok(None)` for partial fragments and heartbeats; `Err` when the fragment
    /// carries an error code. An error fragment's content is ignored and its
    /// invocation's buffer is dropped.
    pub fn transform(
        &mut self,
        raw: &RawProtocolEvent,
    ) -> Result<Option<CanonicalBriefingEvent>, ProtocolError> {
        let key = raw.assembly_key().to_string();

        if let Some(code) = raw.error_code.as_deref() {
            self.assemblies.remove(&key);
            let code = ErrorCode::parse(code);
            if matches!(code, ErrorCode::Unrecognized(_)) {
                warn!("Unrecognized agent error code {:?}; not retrying", code.as_str());
            }
            return Err(ProtocolError {
                code,
                message: raw.error_message.clone(),
                invocation_id: raw.invocation_id.clone(),
            });
        }

        if !raw.has_payload() {
            // Heartbeat or bookkeeping event. An empty final fragment still closes
            // out whatever was buffered before it.
            if raw.is_partial() || !self.assemblies.contains_key(&key) {
                return Ok(None);
            }
        }

        let assembly = self.assemblies.entry(key.clone()).or_default();
        assembly.absorb(raw);

        if raw.is_partial() {
            return Ok(None);
        }

        let assembly = self.assemblies.remove(&key).unwrap_or_default();
        if assembly.is_empty() {
            return Ok(None);
        }
        debug!(
            "Finalized invocation {} from {} fragment(s)",
            key, assembly.fragments
        );
        Ok(Some(self.finalize(assembly, raw.timestamp)))
    }

    fn finalize(&self, assembly: Assembly, timestamp: Option<f64>) -> CanonicalBriefingEvent {
        let Assembly {
            author,
            text,
            thoughts,
            mut citations,
            hints,
            ..
        } = assembly;

        let source_agent = match author.as_deref() {
            Some(author) => AgentRole::lookup(author).unwrap_or_else(|| {
                debug!("Unknown author {:?}; attributing to coordinator", author);
                AgentRole::RecoveryCoordinator
            }),
            None => AgentRole::RecoveryCoordinator,
        };

        let confidence = hints
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0));
        let severity = Severity::from_confidence(confidence);
        let suggested_actions = hints.suggested_actions.clone();
        let event_type = hints
            .event_type()
            .unwrap_or_else(|| derive_event_type(severity, !suggested_actions.is_empty()));
        let geo_reference = hints.geo_reference.clone().filter(|geo| geo.is_feature());
        let target = hints
            .ui_target()
            .unwrap_or_else(|| derive_ui_target(event_type, severity, geo_reference.is_some()));

        let detail = text.trim().to_string();
        let summary = if detail.is_empty() {
            format!(
                "{} returned {} result(s)",
                source_agent.display_name(),
                citations.len()
            )
        } else {
            first_sentence(&detail)
        };

        citations.extend(hints.citations);
        let reasoning_chain = thoughts
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        CanonicalBriefingEvent {
            event_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            parent_event_id: hints.parent_event_id,
            timestamp: timestamp
                .and_then(timestamp_from_secs)
                .unwrap_or_else(Utc::now),
            event_type,
            severity,
            source_agent,
            ui_binding: UiBinding {
                target,
                geo_reference,
            },
            content: BriefingContent {
                summary,
                detail,
                suggested_actions,
            },
            proof_layer: ProofLayer {
                // neutral midpoint when the backend gave no confidence
                confidence: confidence.unwrap_or(0.5),
                confidence_ledger: hints.confidence_ledger,
                citations,
                reasoning_chain,
            },
        }
    }
}

/// Event type when the backend did not say.
fn derive_event_type(severity: Severity, has_actions: bool) -> EventType {
    if severity == Severity::Critical {
        EventType::Alert
    } else if has_actions {
        EventType::ActionRequired
    } else {
        EventType::Insight
    }
}

/// Rendering target when the backend did not say.
fn derive_ui_target(event_type: EventType, severity: Severity, has_geo: bool) -> UiTarget {
    match event_type {
        EventType::Alert if severity == Severity::Critical => UiTarget::ModalInterrupt,
        _ if has_geo => UiTarget::MapHighlight,
        EventType::ActionRequired => UiTarget::PanelInject,
        _ => UiTarget::RailPulse,
    }
}

/// First sentence of `text`, capped at [`SUMMARY_MAX_CHARS`].
fn first_sentence(text: &str) -> String {
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                None => true,
                Some((_, next)) => next.is_whitespace(),
            };
            if at_boundary {
                return truncate_chars(&text[..idx + c.len_utf8()], SUMMARY_MAX_CHARS);
            }
        }
        if c == '\n' {
            return truncate_chars(text[..idx].trim_end(), SUMMARY_MAX_CHARS);
        }
    }
    truncate_chars(text, SUMMARY_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

fn citation_uri(response: &Value) -> Option<String> {
    ["uri", "url", "source"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn excerpt(response: &Value) -> String {
    let text = match response {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("excerpt").or_else(|| map.get("summary")) {
            Some(Value::String(s)) => s.clone(),
            _ => response.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    };
    truncate_chars(&text, EXCERPT_MAX_CHARS)
}

fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}

// ============================================================================
// Tests
// ============================================================================
