//! Canonical briefing event types.
//!
//! A [`CanonicalBriefingEvent`] is the contract handed to every UI consumer: a finished
//! agent finding with its routing hint (`uiBinding`) and its audit trail (`proofLayer`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ============================================================================
// Agent roles
// ============================================================================

/// The fixed set of agent roles that can author a briefing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    BurnAnalyst,
    TrailAssessor,
    CruisingAssessor,
    NepaAdvisor,
    RecoveryCoordinator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        Self::BurnAnalyst,
        Self::TrailAssessor,
        Self::CruisingAssessor,
        Self::NepaAdvisor,
        Self::RecoveryCoordinator,
    ];

    /// Look up a role from an author string, if it is a known name or alias.
    pub fn lookup(author: &str) -> Option<Self> {
        let normalized = author.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "burn_analyst" | "burn" | "burn_severity" | "baer_analyst" => Some(Self::BurnAnalyst),
            "trail_assessor" | "trail" | "trails" | "trail_damage" => Some(Self::TrailAssessor),
            "cruising_assessor" | "cruising" | "timber_cruiser" | "timber" => {
                Some(Self::CruisingAssessor)
            }
            "nepa_advisor" | "nepa" | "compliance" | "compliance_advisor" => Some(Self::NepaAdvisor),
            "recovery_coordinator" | "coordinator" | "root" | "orchestrator" => {
                Some(Self::RecoveryCoordinator)
            }
            _ => None,
        }
    }

    /// Map an author string to a role. Unknown authors fall back to the coordinator.
    pub fn from_author(author: &str) -> Self {
        Self::lookup(author).unwrap_or(Self::RecoveryCoordinator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BurnAnalyst => "burn_analyst",
            Self::TrailAssessor => "trail_assessor",
            Self::CruisingAssessor => "cruising_assessor",
            Self::NepaAdvisor => "nepa_advisor",
            Self::RecoveryCoordinator => "recovery_coordinator",
        }
    }

    /// Human-readable name for terminal output.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::BurnAnalyst => "Burn Analyst",
            Self::TrailAssessor => "Trail Assessor",
            Self::CruisingAssessor => "Cruising Assessor",
            Self::NepaAdvisor => "NEPA Advisor",
            Self::RecoveryCoordinator => "Recovery Coordinator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_author(&raw))
    }
}

// ============================================================================
// Classification enums
// ============================================================================

/// What kind of finding a briefing carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Alert,
    Insight,
    ActionRequired,
    StatusUpdate,
}

impl EventType {
    /// Parse a type string, returning `None` for anything outside the vocabulary.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Some(Self::Alert),
            "insight" => Some(Self::Insight),
            "action_required" | "action-required" | "action" => Some(Self::ActionRequired),
            "status_update" | "status-update" | "status" => Some(Self::StatusUpdate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Insight => "insight",
            Self::ActionRequired => "action_required",
            Self::StatusUpdate => "status_update",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator attention level. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Lower bound of the `info` confidence band.
    pub const INFO_FLOOR: f64 = 0.8;
    /// Lower bound of the `warning` confidence band.
    pub const WARNING_FLOOR: f64 = 0.5;

    /// Derive severity from a backend-supplied confidence.
    ///
    /// Higher confidence never yields a higher severity. A missing confidence is
    /// neutral (`Info`).
    pub fn from_confidence(confidence: Option<f64>) -> Self {
        match confidence {
            None => Self::Info,
            Some(c) if c >= Self::INFO_FLOOR => Self::Info,
            Some(c) if c >= Self::WARNING_FLOOR => Self::Warning,
            Some(_) => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering destination for a briefing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiTarget {
    MapHighlight,
    RailPulse,
    PanelInject,
    ModalInterrupt,
}

impl UiTarget {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "map_highlight" | "map" => Some(Self::MapHighlight),
            "rail_pulse" | "rail" | "sidebar" => Some(Self::RailPulse),
            "panel_inject" | "panel" => Some(Self::PanelInject),
            "modal_interrupt" | "modal" => Some(Self::ModalInterrupt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MapHighlight => "map_highlight",
            Self::RailPulse => "rail_pulse",
            Self::PanelInject => "panel_inject",
            Self::ModalInterrupt => "modal_interrupt",
        }
    }
}

impl fmt::Display for UiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event body
// ============================================================================

/// A GeoJSON `Feature`. Geometry is carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoFeature {
    #[serde(rename = "type", default = "feature_tag")]
    pub kind: String,
    #[serde(default)]
    pub geometry: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

fn feature_tag() -> String {
    "Feature".to_string()
}

impl GeoFeature {
    pub fn is_feature(&self) -> bool {
        self.kind == "Feature"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiBinding {
    pub target: UiTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_reference: Option<GeoFeature>,
}

/// A follow-up the operator can hand to another agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedAction {
    pub action_id: String,
    pub label: String,
    pub target_agent: AgentRole,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefingContent {
    pub summary: String,
    pub detail: String,
    #[serde(default)]
    pub suggested_actions: Vec<SuggestedAction>,
}

// ============================================================================
// Proof layer
// ============================================================================

/// Data quality tier of a ledger input: 1 (measured) through 3 (inferred).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SourceTier(u8);

impl SourceTier {
    pub fn new(tier: u8) -> Option<Self> {
        (1..=3).contains(&tier).then_some(Self(tier))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SourceTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("source tier must be 1, 2 or 3, got {value}"))
    }
}

impl From<SourceTier> for u8 {
    fn from(tier: SourceTier) -> Self {
        tier.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerInput {
    pub source: String,
    pub confidence: f64,
    pub tier: SourceTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Per-input confidence breakdown separating what is known from what is inferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceLedger {
    #[serde(default)]
    pub inputs: Vec<LedgerInput>,
    pub analysis_confidence: f64,
    pub recommendation_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub source_type: String,
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofLayer {
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_ledger: Option<ConfidenceLedger>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub reasoning_chain: Vec<String>,
}

// ============================================================================
// Envelope
// ============================================================================

/// A finished agent finding, ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBriefingEvent {
    pub event_id: Uuid,
    /// Groups every event stemming from one user query.
    pub correlation_id: Uuid,
    /// Causal parent when one agent's output triggered this one.
    #[serde(default)]
    pub parent_event_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub source_agent: AgentRole,
    pub ui_binding: UiBinding,
    pub content: BriefingContent,
    pub proof_layer: ProofLayer,
}

/// Why a canonical event failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    ConfidenceOutOfRange(f64),
    EmptySummary,
    NotAFeature(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfidenceOutOfRange(c) => write!(f, "confidence {c} outside [0, 1]"),
            Self::EmptySummary => write!(f, "briefing summary is empty"),
            Self::NotAFeature(kind) => write!(f, "geo reference is a {kind}, not a Feature"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CanonicalBriefingEvent {
    /// Check the invariants a consumer relies on. Used for events built outside
    /// this process (e.g. delivered already-transformed over the push socket).
    pub fn validate(&self) -> Result<(), ValidationError> {
        let confidence = self.proof_layer.confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(confidence));
        }
        if self.content.summary.trim().is_empty() {
            return Err(ValidationError::EmptySummary);
        }
        if let Some(geo) = &self.ui_binding.geo_reference {
            if !geo.is_feature() {
                return Err(ValidationError::NotAFeature(geo.kind.clone()));
            }
        }
        Ok(())
    }

    pub fn is_modal(&self) -> bool {
        self.ui_binding.target == UiTarget::ModalInterrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CanonicalBriefingEvent {
        CanonicalBriefingEvent {
            event_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            parent_event_id: None,
            timestamp: Utc::now(),
            event_type: EventType::ActionRequired,
            severity: Severity::Warning,
            source_agent: AgentRole::TrailAssessor,
            ui_binding: UiBinding {
                target: UiTarget::PanelInject,
                geo_reference: None,
            },
            content: BriefingContent {
                summary: "Bridge 4 washed out.".to_string(),
                detail: "Bridge 4 washed out. Close the trailhead.".to_string(),
                suggested_actions: vec![],
            },
            proof_layer: ProofLayer {
                confidence: 0.6,
                confidence_ledger: None,
                citations: vec![],
                reasoning_chain: vec![],
            },
        }
    }

    #[test]
    fn test_agent_lookup_and_fallback() {
        assert_eq!(AgentRole::from_author("burn_analyst"), AgentRole::BurnAnalyst);
        assert_eq!(AgentRole::from_author("Trail-Assessor"), AgentRole::TrailAssessor);
        assert_eq!(AgentRole::from_author("nepa"), AgentRole::NepaAdvisor);
        assert_eq!(AgentRole::lookup("weather_bot"), None);
        assert_eq!(
            AgentRole::from_author("weather_bot"),
            AgentRole::RecoveryCoordinator
        );
    }

    #[test]
    fn test_severity_bands_are_monotonic() {
        let mut previous = Severity::Critical;
        for step in 0..=100 {
            let severity = Severity::from_confidence(Some(step as f64 / 100.0));
            assert!(severity <= previous, "severity rose at confidence {step}%");
            previous = severity;
        }
        assert_eq!(Severity::from_confidence(None), Severity::Info);
        assert_eq!(Severity::from_confidence(Some(0.49)), Severity::Critical);
        assert_eq!(Severity::from_confidence(Some(0.5)), Severity::Warning);
        assert_eq!(Severity::from_confidence(Some(0.8)), Severity::Info);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = sample();
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "action_required");
        assert_eq!(value["sourceAgent"], "trail_assessor");
        assert_eq!(value["uiBinding"]["target"], "panel_inject");
        assert_eq!(value["proofLayer"]["confidence"], 0.6);
        assert!(value["eventId"].is_string());
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn test_source_tier_rejects_out_of_range() {
        let ok: LedgerInput =
            serde_json::from_value(json!({"source": "MTBS", "confidence": 0.9, "tier": 1}))
                .unwrap();
        assert_eq!(ok.tier.get(), 1);

        let bad = serde_json::from_value::<LedgerInput>(
            json!({"source": "rumor", "confidence": 0.1, "tier": 4}),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate() {
        let mut event = sample();
        assert!(event.validate().is_ok());

        event.proof_layer.confidence = 1.5;
        assert_eq!(
            event.validate(),
            Err(ValidationError::ConfidenceOutOfRange(1.5))
        );

        let mut event = sample();
        event.ui_binding.geo_reference = Some(GeoFeature {
            kind: "FeatureCollection".to_string(),
            geometry: Value::Null,
            id: None,
            properties: None,
        });
        assert!(matches!(
            event.validate(),
            Err(ValidationError::NotAFeature(_))
        ));
    }
}
