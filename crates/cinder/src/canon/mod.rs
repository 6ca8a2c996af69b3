//! Canonicalization of the raw agent protocol.
//!
//! - [`classify`]: error code taxonomy
//! - [`transformer`]: fragment assembly into [`cinder_protocol::CanonicalBriefingEvent`]

pub mod classify;
pub mod transformer;

pub use classify::{ErrorClass, ErrorCode, ProtocolError};
pub use transformer::{EventTransformer, EXCERPT_MAX_CHARS, SUMMARY_MAX_CHARS};
