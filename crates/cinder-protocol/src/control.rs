//! Push-transport control messages.
//!
//! The push socket carries JSON text messages. A handful of `type` values are
//! reserved for the handshake and heartbeat; everything else is payload, told apart
//! by shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::briefing::{AgentRole, CanonicalBriefingEvent, EventType};
use crate::raw::RawProtocolEvent;

/// Which events a push subscriber wants. Empty lists mean "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub agents: Vec<AgentRole>,
    #[serde(default)]
    pub event_types: Vec<EventType>,
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &CanonicalBriefingEvent) -> bool {
        (self.agents.is_empty() || self.agents.contains(&event.source_agent))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// Messages sent from the client to the push server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        agents: Vec<AgentRole>,
        #[serde(rename = "eventTypes")]
        event_types: Vec<EventType>,
    },
    Pong,
    /// Start a turn over the socket. Subscription-only connections never send it.
    #[serde(rename_all = "camelCase")]
    Query {
        text: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        context: Value,
        correlation_id: Uuid,
    },
}

impl ClientMessage {
    pub fn subscribe(filter: &SubscriptionFilter) -> Self {
        Self::Subscribe {
            agents: filter.agents.clone(),
            event_types: filter.event_types.clone(),
        }
    }
}

/// Messages received from the push server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ping,
    Pong,
    Connected(Value),
    Subscribed(Value),
    /// A finished event, already transformed server-side.
    Briefing(Box<CanonicalBriefingEvent>),
    /// An agent-native fragment that still needs assembly.
    Raw(Box<RawProtocolEvent>),
    /// Anything else; carries the `type` tag if there was one.
    Other(Option<String>),
}

impl ServerMessage {
    /// Classify a text message by its reserved `type` or, failing that, by shape.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);

        match kind.as_deref() {
            Some("ping") => return Ok(Self::Ping),
            Some("pong") => return Ok(Self::Pong),
            Some("connected") => return Ok(Self::Connected(value)),
            Some("subscribed") => return Ok(Self::Subscribed(value)),
            _ => {}
        }

        if value.get("eventId").is_some() {
            let event: CanonicalBriefingEvent = serde_json::from_value(value)?;
            return Ok(Self::Briefing(Box::new(event)));
        }
        let raw_shape = ["invocationId", "content", "errorCode", "turnComplete"]
            .iter()
            .any(|field| value.get(field).is_some());
        if raw_shape {
            let raw: RawProtocolEvent = serde_json::from_value(value)?;
            return Ok(Self::Raw(Box::new(raw)));
        }

        Ok(Self::Other(kind))
    }
}
