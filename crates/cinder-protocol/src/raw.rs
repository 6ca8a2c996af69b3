//! Raw agent protocol events.
//!
//! These mirror what the agent backend emits per fragment of a turn. The backend is
//! untrusted: every field is optional unless the protocol cannot work without it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::briefing::{Citation, ConfidenceLedger, EventType, GeoFeature, SuggestedAction, UiTarget};

/// One unit from the agent backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProtocolEvent {
    /// Opaque, not unique across invocations.
    #[serde(default)]
    pub id: String,
    /// Groups every fragment of one agent turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// `true` while more fragments for this invocation are coming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_metadata: Option<BriefingHints>,
}

impl RawProtocolEvent {
    pub fn is_partial(&self) -> bool {
        self.partial.unwrap_or(false)
    }

    /// Key used to assemble fragments. Falls back to the event id when the backend
    /// omits the invocation id.
    pub fn assembly_key(&self) -> &str {
        self.invocation_id.as_deref().unwrap_or(&self.id)
    }

    pub fn parts(&self) -> &[Part] {
        self.content
            .as_ref()
            .map(|c| c.parts.as_slice())
            .unwrap_or_default()
    }

    /// Whether any part carries text or a tool/code result.
    pub fn has_payload(&self) -> bool {
        self.parts().iter().any(Part::has_payload)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A content part. On the wire a part is an object carrying one of several
/// optional members; [`Part::kind`] gives the closed view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution_result: Option<CodeExecutionResult>,
}

/// Borrowed view of what a [`Part`] carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartKind<'a> {
    Text(&'a str),
    Thought(&'a str),
    ToolResult(&'a FunctionResponse),
    CodeResult(&'a CodeExecutionResult),
    Empty,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            thought: Some(true),
            ..Default::default()
        }
    }

    pub fn tool_result(name: impl Into<String>, response: Value) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                id: None,
                name: name.into(),
                response,
            }),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> PartKind<'_> {
        if let Some(result) = &self.function_response {
            return PartKind::ToolResult(result);
        }
        if let Some(result) = &self.code_execution_result {
            return PartKind::CodeResult(result);
        }
        match &self.text {
            Some(text) if text.is_empty() => PartKind::Empty,
            Some(text) if self.thought.unwrap_or(false) => PartKind::Thought(text),
            Some(text) => PartKind::Text(text),
            None => PartKind::Empty,
        }
    }

    pub fn has_payload(&self) -> bool {
        !matches!(self.kind(), PartKind::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

// ============================================================================
// Briefing hints
// ============================================================================

/// Optional briefing metadata the backend may attach to a fragment.
///
/// Every member is parsed on its own; a malformed member reads as absent instead of
/// invalidating the frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefingHints {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub ui_target: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub geo_reference: Option<GeoFeature>,
    #[serde(default, deserialize_with = "lenient_list", skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<SuggestedAction>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub confidence_ledger: Option<ConfidenceLedger>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<Uuid>,
    #[serde(default, deserialize_with = "lenient_list", skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl BriefingHints {
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type.as_deref().and_then(EventType::parse)
    }

    pub fn ui_target(&self) -> Option<UiTarget> {
        self.ui_target.as_deref().and_then(UiTarget::parse)
    }

    /// Overlay `newer` on top of `self`: members present in `newer` win.
    pub fn merge(&mut self, newer: BriefingHints) {
        if newer.confidence.is_some() {
            self.confidence = newer.confidence;
        }
        if newer.event_type.is_some() {
            self.event_type = newer.event_type;
        }
        if newer.ui_target.is_some() {
            self.ui_target = newer.ui_target;
        }
        if newer.geo_reference.is_some() {
            self.geo_reference = newer.geo_reference;
        }
        if !newer.suggested_actions.is_empty() {
            self.suggested_actions = newer.suggested_actions;
        }
        if newer.confidence_ledger.is_some() {
            self.confidence_ledger = newer.confidence_ledger;
        }
        if newer.parent_event_id.is_some() {
            self.parent_event_id = newer.parent_event_id;
        }
        self.citations.extend(newer.citations);
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Keep the well-formed entries of a list, skip the rest.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}
