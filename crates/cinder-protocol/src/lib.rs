//! Wire types for the Cinder agent briefing pipeline.
//!
//! This crate defines the formats crossing every boundary of the pipeline:
//!
//! ```text
//! Agent backend --[SSE: raw events]-------> Pull transport --+
//!                                                            +--> Transformer --> Store --> UI
//! Agent backend --[WS: raw/canonical]-----> Push transport --+
//!               <--[WS: subscribe/pong]---
//! ```
//!
//! ## Design Principles
//!
//! 1. **Raw events are untrusted.** Everything optional on the wire is optional here,
//!    and briefing hints are parsed leniently so one odd field never drops a frame.
//! 2. **Canonical events are complete.** A [`CanonicalBriefingEvent`] is never partial;
//!    assembly happens before one is constructed.
//! 3. **Closed vocabularies.** Agent roles, event types, severities and UI targets are
//!    enums with explicit fallbacks instead of free strings.

pub mod briefing;
pub mod control;
pub mod raw;

pub use briefing::{
    AgentRole, BriefingContent, CanonicalBriefingEvent, Citation, ConfidenceLedger, EventType,
    GeoFeature, LedgerInput, ProofLayer, Severity, SourceTier, SuggestedAction, UiBinding,
    UiTarget, ValidationError,
};
pub use control::{ClientMessage, ServerMessage, SubscriptionFilter};
pub use raw::{
    BriefingHints, CodeExecutionResult, Content, FunctionResponse, Part, PartKind,
    RawProtocolEvent,
};
