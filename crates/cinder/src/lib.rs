//! Agent briefing pipeline for the post-wildfire recovery operator console.
//!
//! ```text
//! agent backend ──SSE / WebSocket──► transport ──► FrameParser
//!                                        │
//!                                        ▼
//!                                  EventTransformer ──► EventStore ──► UI consumers
//!                                        ▲
//!                                  SessionClient (start / cancel / new_session, retry)
//! ```

pub mod backoff;
pub mod canon;
pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod store;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use canon::{ErrorClass, ErrorCode, EventTransformer, ProtocolError};
pub use error::{ConfigError, FailureCause, SessionFailure, TransportError, TransportResult};
pub use frame::FrameParser;
pub use session::{SessionClient, SessionState, TurnHandle, TurnReport};
pub use store::{EventStore, StoreChange};
pub use transport::{
    PullTransport, PushTransport, StreamTransport, TransportEvent, TransportStream, TurnRequest,
};
