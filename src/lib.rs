//! Call signaling for one-to-one WebRTC calls over a user-keyed relay.
//!
//! [`engine::CallEngine`] runs the call lifecycle, [`channel`] talks to the
//! relay, [`rtc`] adapts the `webrtc` crate's peer connection.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod ice_buffer;
pub mod media;
pub mod protocol;
pub mod rtc;
pub mod session;
pub mod transport;

pub use engine::{CallEngine, CallHandle, CallSnapshot, Command, EndReason, EngineEvent, Notice};
pub use error::CallError;
pub use session::CallPhase;
