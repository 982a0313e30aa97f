//! Client-side negotiation core for real-time audio/video sessions
//! against an SFU (selective forwarding unit).
//!
//! Given a signaling endpoint and session options, a [`Session`]
//! acquires local tracks, runs the offer/answer/candidate handshake over
//! a WebSocket, rewrites the negotiated description for policy reasons,
//! ramps the outbound bitrate up after the session goes live, and turns
//! raw transport counters into per-second deltas and change events.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sfu_client::{SampleTrackSource, Session, SessionConfig, SessionEvent};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let url = url::Url::parse("wss://sfu.example.com/ws")?;
//! let options = json!({"roomId": "demo", "userId": "alice", "duration": 120});
//! let (handle, mut events) = Session::start(
//!     SessionConfig::new(url, options),
//!     Arc::new(SampleTrackSource),
//! )?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Start => println!("live"),
//!         SessionEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! handle.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod join;
pub mod ramp;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod stats;

mod utils;

pub use config::{
    AudioConstraints, Capabilities, IceServer, MediaConstraints, RtcConfig, SessionConfig,
    Verbosity, VideoConstraints, VideoFormat,
};
pub use error::{ChannelError, MediaError, SessionError, StatsError};
pub use join::JoinPayload;
pub use ramp::{BitrateAllocation, BitrateControls, BitrateRamper, BitrateSink, RampConfig};
pub use session::{
    LocalMedia, MediaSource, SampleTrackSource, Session, SessionEvent, SessionHandle,
};
pub use signaling::{
    CandidatePayload, ChannelEvent, ClientMessage, ControlPayload, DiagnosticKind,
    PolyControlPayload, ServerMessage, SignalingChannel,
};
pub use stats::{CounterChange, EncoderTelemetry, StatsDelta, StatsSnapshot};
