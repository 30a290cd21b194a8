//! Broadcaster-side media engine
//!
//! One [`session::ViewerSession`] per viewer-with-region, each owning a peer
//! connection and a cropper over the shared [`source::SourceTrack`]. The
//! [`engine::BroadcastEngine`] drives sessions from hub notifications.

pub mod engine;
pub mod session;
pub mod source;

pub use engine::{BroadcastEngine, EngineHandle};
pub use session::{NegotiationState, SessionEvent, ViewerSession, ViewerSessionConfig};
pub use source::SourceTrack;
