use serde::{Deserialize, Serialize};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use crate::join::JoinPayload;
use crate::ramp::RampConfig;

/// How chatty the session is towards the signaling server.
///
/// `Events` sends discrete media-counter updates (resolution, fps, PLI,
/// FIR, keyframes). `Debug` additionally reports connection/signaling/ICE
/// state changes and the selected candidate pair. Diagnostics are pure
/// side-channel telemetry and never affect the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verbosity {
    Quiet,
    Events,
    Debug,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Events
    }
}

/// Video codecs the join payload accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoFormat {
    #[serde(rename = "VP8")]
    Vp8,
    #[serde(rename = "H264")]
    H264,
}

impl VideoFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "VP8" => Some(VideoFormat::Vp8),
            "H264" => Some(VideoFormat::H264),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VideoFormat::Vp8 => "VP8",
            VideoFormat::H264 => "H264",
        }
    }
}

/// Runtime capabilities resolved once at session construction and threaded
/// through as configuration, instead of being re-probed ad hoc.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Honor the join payload's video format when building the media
    /// engine.
    pub codec_preference: bool,
    /// Advertise transport-wide congestion control in the answer.
    pub twcc: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities { codec_preference: true, twcc: false }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing_mode: String,
    pub format: VideoFormat,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        VideoConstraints {
            width: 800,
            height: 600,
            frame_rate: 30,
            facing_mode: "user".to_owned(),
            format: VideoFormat::Vp8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub sample_size: u32,
    pub channel_count: u16,
    pub auto_gain_control: bool,
    pub latency: f64,
    pub noise_suppression: bool,
    /// `None` means "decide from the session shape": cancelled everywhere
    /// except the size-1 mirror configuration used for self-tests.
    pub echo_cancellation: Option<bool>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        AudioConstraints {
            sample_size: 16,
            channel_count: 1,
            auto_gain_control: false,
            latency: 0.003,
            noise_suppression: false,
            echo_cancellation: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaConstraints {
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

impl MediaConstraints {
    /// Merge the defaults with what the validated join payload asks for.
    pub fn resolve(&self, join: &JoinPayload) -> MediaConstraints {
        let mut resolved = self.clone();
        if resolved.audio.echo_cancellation.is_none() {
            resolved.audio.echo_cancellation = Some(join.size != Some(1.0));
        }
        if let Some(format) = join.video_format.as_deref().and_then(VideoFormat::from_name) {
            resolved.video.format = format;
        }
        if let Some(width) = join.width {
            resolved.video.width = width.round() as u32;
        }
        if let Some(height) = join.height {
            resolved.video.height = height.round() as u32;
        }
        if let Some(frame_rate) = join.frame_rate {
            resolved.video.frame_rate = frame_rate.round() as u32;
        }
        resolved
    }
}

/// One ICE server entry, `stun:`/`turn:` scheme included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        RtcConfig {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl RtcConfig {
    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// Everything a session needs up front. `peer_options` is the raw,
/// loosely-typed option object coming from the embedding application; it
/// is validated into a join payload before any network or media activity.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signaling_url: Url,
    pub peer_options: serde_json::Value,
    pub rtc: RtcConfig,
    pub constraints: MediaConstraints,
    pub verbosity: Verbosity,
    /// Deliver per-interval stats deltas to the caller. Counter polling
    /// itself also runs whenever verbosity is at least `Events`.
    pub stats: bool,
    pub ramp: RampConfig,
    pub capabilities: Capabilities,
}

impl SessionConfig {
    pub fn new(signaling_url: Url, peer_options: serde_json::Value) -> Self {
        SessionConfig {
            signaling_url,
            peer_options,
            rtc: RtcConfig::default(),
            constraints: MediaConstraints::default(),
            verbosity: Verbosity::default(),
            stats: false,
            ramp: RampConfig::default(),
            capabilities: Capabilities::default(),
        }
    }
}
