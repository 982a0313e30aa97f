//! WebSocket signaling channel and the wire grammar spoken over it.
//!
//! Every frame is a JSON envelope `{kind, payload}` where `payload` is
//! itself a JSON-encoded string. Parsing is total: an unknown kind or a
//! malformed payload is logged and skipped, never fatal. The channel owns
//! a writer task and a reader task; callers interact only through typed
//! messages and a single event stream that always terminates in exactly
//! one `Closed`.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::ChannelError;

/// Normal application teardown close code.
pub const CLOSE_CODE_LEAVING: u16 = 1000;
/// Close code sent when the server reported a fatal error.
pub const CLOSE_CODE_ERROR: u16 = 4000;

const CONNECT_WATCHDOG: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// ICE candidate as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        CandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

/// Everything the server can say. `error*` kinds collapse into one fatal
/// variant; kinds this build does not know land in `Unrecognized` so the
/// session can keep running against a newer server.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Offer(RTCSessionDescription),
    Candidate(CandidatePayload),
    Start,
    Ending,
    Files { payload: String },
    Error { kind: String, payload: Option<String> },
    Unrecognized(String),
}

impl ServerMessage {
    fn parse(text: &str) -> Option<ServerMessage> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping unparsable signaling frame: {err}");
                return None;
            }
        };

        if envelope.kind.starts_with("error") {
            return Some(ServerMessage::Error { kind: envelope.kind, payload: envelope.payload });
        }

        match envelope.kind.as_str() {
            "offer" => match envelope.payload {
                Some(payload) => match serde_json::from_str(&payload) {
                    Ok(description) => Some(ServerMessage::Offer(description)),
                    Err(err) => {
                        warn!("dropping offer with malformed description: {err}");
                        None
                    }
                },
                None => {
                    warn!("dropping offer without a description payload");
                    None
                }
            },
            "candidate" => match envelope.payload {
                Some(payload) => match serde_json::from_str(&payload) {
                    Ok(candidate) => Some(ServerMessage::Candidate(candidate)),
                    Err(err) => {
                        warn!("dropping malformed remote candidate: {err}");
                        None
                    }
                },
                None => {
                    warn!("dropping candidate without a payload");
                    None
                }
            },
            "start" => Some(ServerMessage::Start),
            "ending" => Some(ServerMessage::Ending),
            "files" => Some(ServerMessage::Files {
                payload: envelope.payload.unwrap_or_default(),
            }),
            other => Some(ServerMessage::Unrecognized(other.to_owned())),
        }
    }
}

/// State-change diagnostics reported over the side channel. Kinds mirror
/// the transport observers they come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    ConnectionState,
    SignalingState,
    IceConnectionState,
    IceGatheringState,
    NegotiationNeeded,
    IceCandidateFailed,
    SelectedCandidatePair,
    VideoResolution,
    VideoFps,
    PliReceivedCount,
    FirReceivedCount,
    KeyframeEncodedCount,
    KeyframeDecodedCount,
}

impl DiagnosticKind {
    pub fn wire_kind(&self) -> &'static str {
        match self {
            DiagnosticKind::ConnectionState => "client_connection_state_changed",
            DiagnosticKind::SignalingState => "client_signaling_state_changed",
            DiagnosticKind::IceConnectionState => "client_ice_connection_state_changed",
            DiagnosticKind::IceGatheringState => "client_ice_gathering_state_changed",
            DiagnosticKind::NegotiationNeeded => "client_negotiation_needed",
            DiagnosticKind::IceCandidateFailed => "client_ice_candidate_failed",
            DiagnosticKind::SelectedCandidatePair => "client_selected_candidate_pair",
            DiagnosticKind::VideoResolution => "client_video_resolution_updated",
            DiagnosticKind::VideoFps => "client_video_fps_updated",
            DiagnosticKind::PliReceivedCount => "client_pli_received_count_updated",
            DiagnosticKind::FirReceivedCount => "client_fir_received_count_updated",
            DiagnosticKind::KeyframeEncodedCount => "client_keyframe_encoded_count_updated",
            DiagnosticKind::KeyframeDecodedCount => "client_keyframe_decoded_count_updated",
        }
    }
}

/// Interactive effect-parameter update, numeric value with an optional
/// transition time.
#[derive(Debug, Clone, Serialize)]
pub struct ControlPayload {
    pub name: String,
    pub property: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Typed effect-parameter update routed by payload kind server-side.
/// The value is numeric at the API boundary and stringified on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct PolyControlPayload {
    pub name: String,
    pub property: String,
    pub kind: String,
    #[serde(serialize_with = "number_as_string")]
    pub value: f64,
}

fn number_as_string<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&value.to_string())
}

/// Everything the client can say.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Join(serde_json::Value),
    Answer(RTCSessionDescription),
    Candidate(CandidatePayload),
    Control(ControlPayload),
    PolyControl(PolyControlPayload),
    Ext { kind: String, payload: Option<String> },
    Diagnostic { kind: DiagnosticKind, text: Option<String> },
}

impl ClientMessage {
    pub fn kind(&self) -> String {
        match self {
            ClientMessage::Join(_) => "join".to_owned(),
            ClientMessage::Answer(_) => "client_answer".to_owned(),
            ClientMessage::Candidate(_) => "client_candidate".to_owned(),
            ClientMessage::Control(_) => "client_control".to_owned(),
            ClientMessage::PolyControl(_) => "client_polycontrol".to_owned(),
            ClientMessage::Ext { kind, .. } => format!("ext_{kind}"),
            ClientMessage::Diagnostic { kind, .. } => kind.wire_kind().to_owned(),
        }
    }

    fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        let kind = self.kind();
        let payload = match self {
            ClientMessage::Join(options) => Some(serde_json::to_string(&options)?),
            ClientMessage::Answer(description) => Some(serde_json::to_string(&description)?),
            ClientMessage::Candidate(candidate) => Some(serde_json::to_string(&candidate)?),
            ClientMessage::Control(control) => Some(serde_json::to_string(&control)?),
            ClientMessage::PolyControl(control) => Some(serde_json::to_string(&control)?),
            ClientMessage::Ext { payload, .. } => payload,
            ClientMessage::Diagnostic { text, .. } => text,
        };
        Ok(Envelope { kind, payload })
    }
}

/// What the reader task emits. The stream ends with exactly one `Closed`,
/// whether the server closed cleanly, the transport failed, or the local
/// side hung up.
#[derive(Debug)]
pub enum ChannelEvent {
    Message(ServerMessage),
    Error(String),
    Closed,
}

enum Outbound {
    Frame(String),
    Pong(Vec<u8>),
    Close(u16),
}

/// Handle to a connected signaling channel.
pub struct SignalingChannel {
    out_tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SignalingChannel {
    /// Connect and spawn the writer and reader tasks.
    ///
    /// A watchdog logs when the server has not been reached within ten
    /// seconds; the connect attempt itself is not aborted, the transport
    /// error (if any) still decides the outcome.
    pub async fn connect(
        url: &Url,
    ) -> Result<(SignalingChannel, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let watchdog_url = url.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(CONNECT_WATCHDOG).await;
            warn!("still waiting on signaling server at {watchdog_url} after {CONNECT_WATCHDOG:?}");
        });

        let connect_result = connect_async(url.as_str()).await;
        watchdog.abort();
        let (stream, _response) = connect_result.map_err(ChannelError::Connect)?;
        info!("signaling channel connected to {url}");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let result = match outbound {
                    Outbound::Frame(text) => sink.send(Message::Text(text)).await,
                    Outbound::Pong(data) => sink.send(Message::Pong(data)).await,
                    Outbound::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: Cow::Borrowed(""),
                        };
                        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                            debug!("signaling close frame not delivered: {err}");
                        }
                        let _ = sink.flush().await;
                        break;
                    }
                };
                if let Err(err) = result {
                    debug!("signaling write failed: {err}");
                    break;
                }
            }
        });

        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(message) = ServerMessage::parse(&text) {
                            if event_tx.send(ChannelEvent::Message(message)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Outbound::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = event_tx.send(ChannelEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
            let _ = event_tx.send(ChannelEvent::Closed);
        });

        Ok((
            SignalingChannel { out_tx, closed: Arc::new(AtomicBool::new(false)) },
            event_rx,
        ))
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let envelope = message.into_envelope()?;
        let text = serde_json::to_string(&envelope)?;
        self.out_tx
            .send(Outbound::Frame(text))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Initiate a close handshake. Idempotent; later `send` calls fail
    /// with `Closed`.
    pub async fn close(&self, code: u16) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.out_tx.send(Outbound::Close(code)).await;
    }
}
